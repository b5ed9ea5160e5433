//! On-disk tick record.

use fxb_core::{Price, SourceTag, Symbol, Tick};
use serde::{Deserialize, Serialize};

/// One line of a day file.
///
/// The symbol is carried by the file path, not the record. Ordering within a
/// file is by non-decreasing `timestamp_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickRecord {
    pub timestamp_ms: i64,
    pub bid: Price,
    pub ask: Price,
    pub spread: Price,
    pub source: SourceTag,
}

impl TickRecord {
    pub fn from_tick(tick: &Tick) -> Self {
        Self {
            timestamp_ms: tick.timestamp_ms,
            bid: tick.bid,
            ask: tick.ask,
            spread: tick.spread(),
            source: tick.source.clone(),
        }
    }

    pub fn into_tick(self, symbol: Symbol) -> Tick {
        Tick {
            symbol,
            bid: self.bid,
            ask: self.ask,
            timestamp_ms: self.timestamp_ms,
            source: self.source,
        }
    }

    /// Mid-price, used by OHLC re-aggregation.
    pub fn mid(&self) -> Price {
        Price::mid(self.bid, self.ask)
    }
}
