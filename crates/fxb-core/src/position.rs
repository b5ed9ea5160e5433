//! Position state.

use crate::account::AccountId;
use crate::decimal::{Price, Volume};
use crate::order::OrderSide;
use crate::symbol::Symbol;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Engine-issued position identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct PositionId(pub u64);

impl fmt::Display for PositionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CloseReason {
    Manual,
    StopLoss,
    TakeProfit,
    StopOut,
    Admin,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Manual => write!(f, "manual"),
            Self::StopLoss => write!(f, "stop-loss"),
            Self::TakeProfit => write!(f, "take-profit"),
            Self::StopOut => write!(f, "stop-out"),
            Self::Admin => write!(f, "admin"),
        }
    }
}

/// An open (or closed) leveraged position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    pub account: AccountId,
    pub symbol: Symbol,
    pub side: OrderSide,
    pub volume: Volume,
    pub open_price: Price,
    /// Latest reprice, the side the position would close at.
    pub current_price: Price,
    /// In account currency, refreshed on every reprice.
    pub unrealized_pl: Decimal,
    /// Commission charged at open, in account currency.
    pub commission: Decimal,
    /// Accrued swap, in account currency.
    pub swap: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<Price>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<Price>,
    pub open_time_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_time_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<CloseReason>,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.close_time_ms.is_none()
    }

    /// Whether the stop-loss fires at the given closing price.
    ///
    /// Buys close at bid and stop on the way down, sells close at ask and
    /// stop on the way up.
    pub fn stop_loss_hit(&self, close_price: Price) -> bool {
        match (self.stop_loss, self.side) {
            (Some(sl), OrderSide::Buy) => close_price <= sl,
            (Some(sl), OrderSide::Sell) => close_price >= sl,
            (None, _) => false,
        }
    }

    /// Whether the take-profit fires at the given closing price.
    pub fn take_profit_hit(&self, close_price: Price) -> bool {
        match (self.take_profit, self.side) {
            (Some(tp), OrderSide::Buy) => close_price >= tp,
            (Some(tp), OrderSide::Sell) => close_price <= tp,
            (None, _) => false,
        }
    }

    /// Price-move P/L in quote currency for a closing price, before any
    /// cross-currency conversion.
    pub fn quote_pl(&self, close_price: Price, contract_size: Decimal) -> Decimal {
        let diff = match self.side {
            OrderSide::Buy => close_price.inner() - self.open_price.inner(),
            OrderSide::Sell => self.open_price.inner() - close_price.inner(),
        };
        diff * contract_size * self.volume.inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn buy_position() -> Position {
        Position {
            id: PositionId(1),
            account: AccountId::new(1001),
            symbol: Symbol::new("EURUSD"),
            side: OrderSide::Buy,
            volume: Volume::new(dec!(0.10)),
            open_price: Price::new(dec!(1.0855)),
            current_price: Price::new(dec!(1.0855)),
            unrealized_pl: Decimal::ZERO,
            commission: Decimal::ZERO,
            swap: Decimal::ZERO,
            stop_loss: Some(Price::new(dec!(1.0840))),
            take_profit: None,
            open_time_ms: 1_705_778_100_000,
            close_time_ms: None,
            close_reason: None,
        }
    }

    #[test]
    fn stop_loss_trigger() {
        let pos = buy_position();
        assert!(!pos.stop_loss_hit(Price::new(dec!(1.0841))));
        assert!(pos.stop_loss_hit(Price::new(dec!(1.0840))));
        assert!(pos.stop_loss_hit(Price::new(dec!(1.0839))));
    }

    #[test]
    fn quote_pl_buy() {
        let pos = buy_position();
        let pl = pos.quote_pl(Price::new(dec!(1.0839)), dec!(100000));
        assert_eq!(pl, dec!(-16.000000));
    }

    #[test]
    fn quote_pl_sell() {
        let mut pos = buy_position();
        pos.side = OrderSide::Sell;
        pos.open_price = Price::new(dec!(1.0870));
        let pl = pos.quote_pl(Price::new(dec!(1.0850)), dec!(100000));
        assert_eq!(pl, dec!(20.000000));
    }

    #[test]
    fn close_reason_display() {
        assert_eq!(CloseReason::StopLoss.to_string(), "stop-loss");
        assert_eq!(
            serde_json::to_string(&CloseReason::StopOut).unwrap(),
            "\"stop-out\""
        );
    }
}
