//! Order types and lifecycle.

use crate::account::AccountId;
use crate::decimal::{Price, Volume};
use crate::symbol::Symbol;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Engine-issued order identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct OrderId(pub u64);

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Order side: buy or sell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Returns the opposite side.
    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Returns 1 for buy, -1 for sell (for position arithmetic).
    pub fn sign(&self) -> i8 {
        match self {
            Self::Buy => 1,
            Self::Sell => -1,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Market => write!(f, "market"),
            Self::Limit => write!(f, "limit"),
            Self::Stop => write!(f, "stop"),
            Self::StopLimit => write!(f, "stop-limit"),
        }
    }
}

/// Order state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderState {
    Pending,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// A client order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub account: AccountId,
    pub symbol: Symbol,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub volume: Volume,
    /// Limit price for limit/stop-limit, trigger price for stop.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<Price>,
    /// Stop activation price, stop-limit only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<Price>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<Price>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<Price>,
    pub state: OrderState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fill_price: Option<Price>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fill_time_ms: Option<i64>,
    pub created_ms: i64,
}

impl Order {
    /// Whether a stop activation for a stop-limit order has occurred.
    ///
    /// Plain limit and market orders never have a stop leg.
    pub fn has_stop_leg(&self) -> bool {
        self.order_type == OrderType::StopLimit && self.stop_price.is_some()
    }
}
