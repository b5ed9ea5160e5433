//! Engine error types.
//!
//! Validation failures carry the stable kebab-case codes surfaced to
//! clients; the conversion to a wire code goes through [`EngineError::code`].

use fxb_core::{AccountId, OrderId, PositionId, Symbol};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("insufficient margin")]
    InsufficientMargin,

    #[error("market closed for {0}")]
    MarketClosed(Symbol),

    #[error("symbol disabled: {0}")]
    SymbolDisabled(Symbol),

    #[error("volume out of range")]
    VolumeOutOfRange,

    #[error("account suspended: {0}")]
    AccountSuspended(AccountId),

    #[error("price unavailable for {0}")]
    PriceUnavailable(Symbol),

    #[error("stop too close to market")]
    StopTooClose,

    #[error("unknown symbol: {0}")]
    UnknownSymbol(Symbol),

    #[error("unknown account: {0}")]
    UnknownAccount(AccountId),

    #[error("unknown order: {0}")]
    UnknownOrder(OrderId),

    #[error("unknown position: {0}")]
    UnknownPosition(PositionId),

    #[error("order not pending: {0}")]
    OrderNotPending(OrderId),

    #[error("invalid order type for this operation")]
    InvalidOrderType,
}

impl EngineError {
    /// Stable error code surfaced to clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InsufficientMargin => "insufficient-margin",
            Self::MarketClosed(_) => "market-closed",
            Self::SymbolDisabled(_) => "symbol-disabled",
            Self::VolumeOutOfRange => "volume-out-of-range",
            Self::AccountSuspended(_) => "account-suspended",
            Self::PriceUnavailable(_) => "price-unavailable",
            Self::StopTooClose => "stop-too-close",
            Self::UnknownSymbol(_) => "unknown-symbol",
            Self::UnknownAccount(_) => "unknown-account",
            Self::UnknownOrder(_) => "unknown-order",
            Self::UnknownPosition(_) => "unknown-position",
            Self::OrderNotPending(_) => "order-not-pending",
            Self::InvalidOrderType => "invalid-order-type",
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
