//! Core domain types for the fxb broker engine.
//!
//! This crate provides the fundamental types shared by every component:
//! - `Symbol`, `SymbolSpec`: instrument catalog
//! - `Price`, `Volume`: precision-safe numeric types
//! - `Tick`, `OhlcBar`, `Timeframe`: market data
//! - `Account`, `Order`, `Position`, `LedgerEntry`: trading state
//! - `StreamEvent`: the closed set of events broadcast to clients

pub mod account;
pub mod decimal;
pub mod error;
pub mod event;
pub mod ledger;
pub mod ohlc;
pub mod order;
pub mod position;
pub mod symbol;
pub mod tick;

pub use account::{Account, AccountId, AccountStatus, MarginMode};
pub use decimal::{Price, Volume};
pub use error::{CoreError, Result};
pub use event::{AccountUpdate, ClientRequest, MarginCallAction, StreamEvent};
pub use ledger::{LedgerEntry, LedgerEntryKind};
pub use ohlc::{OhlcBar, Timeframe};
pub use order::{Order, OrderId, OrderSide, OrderState, OrderType};
pub use position::{CloseReason, Position, PositionId};
pub use symbol::{ProductClass, Symbol, SymbolSpec};
pub use tick::{SourceTag, Tick};

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// Returns 0 if the system clock is before the epoch (should never happen).
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
