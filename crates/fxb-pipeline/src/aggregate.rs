//! Streaming OHLC aggregation.

use fxb_core::{OhlcBar, Symbol, Tick, Timeframe};
use std::collections::hash_map::Entry;
use std::collections::HashMap;

/// Live bars per (symbol, timeframe); seals a bar when its bucket ends.
///
/// Feeding the same tick sequence in one run or split across arbitrary
/// ingest boundaries yields identical sealed bars: the only state is the
/// current bar per key.
pub struct BarAggregator {
    timeframes: Vec<Timeframe>,
    current: HashMap<(Symbol, Timeframe), OhlcBar>,
}

impl BarAggregator {
    pub fn new(timeframes: Vec<Timeframe>) -> Self {
        Self {
            timeframes,
            current: HashMap::new(),
        }
    }

    /// Fold an accepted tick into every timeframe; returns bars sealed by
    /// this tick (bucket rollover), oldest timeframe order preserved.
    pub fn apply(&mut self, tick: &Tick) -> Vec<OhlcBar> {
        let mid = tick.mid();
        let mut sealed = Vec::new();

        for &tf in &self.timeframes {
            let bucket = tf.bucket_start(tick.timestamp_ms);
            match self.current.entry((tick.symbol.clone(), tf)) {
                Entry::Occupied(mut entry) => {
                    let bar = entry.get_mut();
                    if bar.bucket_start_ms == bucket {
                        bar.update(mid);
                    } else {
                        sealed.push(bar.clone());
                        *bar = OhlcBar::open_bucket(tick.symbol.clone(), tf, bucket, mid);
                    }
                }
                Entry::Vacant(entry) => {
                    entry.insert(OhlcBar::open_bucket(tick.symbol.clone(), tf, bucket, mid));
                }
            }
        }
        sealed
    }

    /// Current (unsealed) bar for a key, if any.
    pub fn live_bar(&self, symbol: &Symbol, timeframe: Timeframe) -> Option<&OhlcBar> {
        self.current.get(&(symbol.clone(), timeframe))
    }
}
