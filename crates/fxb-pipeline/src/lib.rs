//! Quote pipeline for the fxb broker engine.
//!
//! Transforms raw gateway output into the two downstream products, broadcast
//! events and OHLC bars, while enforcing data quality and flow control.
//! Stages per tick: dedup, ordering check, sanity check, broadcast throttle,
//! fan-out, aggregation. Work is cheap and serial per tick so ordering
//! within a symbol is preserved.

pub mod aggregate;
pub mod config;
pub mod counters;
pub mod error;
pub mod pipeline;
pub mod stages;

pub use aggregate::BarAggregator;
pub use config::PipelineConfig;
pub use counters::{QualityCounters, QualitySnapshot};
pub use error::{PipelineError, PipelineResult};
pub use pipeline::{QuotePipeline, TickOutcome};
pub use stages::{DropReason, QuoteFilter};
