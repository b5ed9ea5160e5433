//! Account state.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric account identifier (the trader's login).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct AccountId(pub u64);

impl AccountId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How simultaneous positions on one symbol are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarginMode {
    /// Any number of independent positions per symbol.
    #[default]
    Hedging,
    /// At most one net position per (account, symbol).
    Netting,
}

/// Account lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccountStatus {
    Active,
    Suspended,
    MarginCall,
}

/// Trading account.
///
/// `equity` and `margin_used` are derived values the engine refreshes on
/// every reprice; they are carried here so snapshots serialize complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    /// Deposit currency (e.g. "USD").
    pub currency: String,
    /// Notional multiplier per unit of margin.
    pub leverage: u32,
    pub margin_mode: MarginMode,
    /// Realized funds.
    pub balance: Decimal,
    /// Broker-granted credit, part of equity but not withdrawable.
    pub credit: Decimal,
    /// balance + credit + unrealized P/L - accrued swap/commission.
    pub equity: Decimal,
    /// Collateral locked by open positions.
    pub margin_used: Decimal,
    pub status: AccountStatus,
}

impl Account {
    pub fn new(id: AccountId, currency: impl Into<String>, leverage: u32, mode: MarginMode) -> Self {
        Self {
            id,
            currency: currency.into(),
            leverage: leverage.max(1),
            margin_mode: mode,
            balance: Decimal::ZERO,
            credit: Decimal::ZERO,
            equity: Decimal::ZERO,
            margin_used: Decimal::ZERO,
            status: AccountStatus::Active,
        }
    }

    /// equity - used margin.
    pub fn free_margin(&self) -> Decimal {
        self.equity - self.margin_used
    }

    /// equity / used margin * 100, None while no margin is in use.
    pub fn margin_level(&self) -> Option<Decimal> {
        if self.margin_used.is_zero() {
            return None;
        }
        Some(self.equity / self.margin_used * Decimal::ONE_HUNDRED)
    }
}
