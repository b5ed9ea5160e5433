//! Error types for fxb-core.

use crate::decimal::Volume;
use crate::symbol::Symbol;
use thiserror::Error;

/// Core error types.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid price: {0}")]
    InvalidPrice(String),

    #[error("volume out of range for {symbol}: {volume}")]
    VolumeOutOfRange { symbol: Symbol, volume: Volume },

    #[error("unknown symbol: {0}")]
    UnknownSymbol(Symbol),

    #[error("decimal parse error: {0}")]
    DecimalParse(#[from] rust_decimal::Error),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
