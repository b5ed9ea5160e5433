//! Tick storage for the fxb broker engine.
//!
//! Two tiers:
//! - **Hot**: a bounded in-memory ring per symbol with O(1) append.
//! - **Cold**: an asynchronous batched writer flushing JSON Lines day files,
//!   one file per (symbol, UTC day), append-only until rotation.
//!
//! JSON Lines keeps partial corruption local to single lines: the reader
//! stops at the last complete record and counts the damage instead of
//! failing the whole file.

pub mod config;
pub mod error;
pub mod history;
pub mod reader;
pub mod record;
pub mod ring;
pub mod sweep;
pub mod writer;

pub use config::StoreConfig;
pub use error::{StoreError, StoreResult};
pub use history::TickStore;
pub use record::TickRecord;
pub use ring::TickRing;
pub use sweep::run_retention_sweep;
pub use writer::{spawn_writer, WriterHandle};
