//! Hot in-memory tick ring, bounded per symbol.

use fxb_core::Tick;
use std::collections::VecDeque;

/// Fixed-capacity ring of the latest ticks for one symbol.
///
/// Append is O(1); the oldest tick is evicted once capacity is reached.
#[derive(Debug)]
pub struct TickRing {
    buf: VecDeque<Tick>,
    capacity: usize,
}

impl TickRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, tick: Tick) {
        if self.buf.len() == self.capacity {
            self.buf.pop_front();
        }
        self.buf.push_back(tick);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Most recent tick.
    pub fn latest(&self) -> Option<&Tick> {
        self.buf.back()
    }

    /// Up to `n` most recent ticks, oldest first.
    pub fn latest_n(&self, n: usize) -> Vec<Tick> {
        let start = self.buf.len().saturating_sub(n);
        self.buf.iter().skip(start).cloned().collect()
    }

    /// Ticks with `from_ms <= timestamp_ms <= to_ms`, oldest first.
    pub fn range(&self, from_ms: i64, to_ms: i64) -> Vec<Tick> {
        self.buf
            .iter()
            .filter(|t| t.timestamp_ms >= from_ms && t.timestamp_ms <= to_ms)
            .cloned()
            .collect()
    }

    /// Earliest timestamp still held, None when empty.
    pub fn oldest_ms(&self) -> Option<i64> {
        self.buf.front().map(|t| t.timestamp_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fxb_core::Price;
    use rust_decimal_macros::dec;

    fn tick(ts: i64) -> Tick {
        Tick::new(
            "EURUSD",
            Price::new(dec!(1.0850)),
            Price::new(dec!(1.0851)),
            ts,
            "LP1",
        )
    }

    #[test]
    fn bounded_eviction() {
        let mut ring = TickRing::new(3);
        for ts in 0..5 {
            ring.push(tick(ts));
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.oldest_ms(), Some(2));
        assert_eq!(ring.latest().unwrap().timestamp_ms, 4);
    }

    #[test]
    fn latest_n_ordering() {
        let mut ring = TickRing::new(10);
        for ts in 0..5 {
            ring.push(tick(ts));
        }
        let last3 = ring.latest_n(3);
        assert_eq!(
            last3.iter().map(|t| t.timestamp_ms).collect::<Vec<_>>(),
            vec![2, 3, 4]
        );
        assert_eq!(ring.latest_n(100).len(), 5);
    }

    #[test]
    fn range_query() {
        let mut ring = TickRing::new(10);
        for ts in [10, 20, 30, 40] {
            ring.push(tick(ts));
        }
        let hits = ring.range(15, 35);
        assert_eq!(
            hits.iter().map(|t| t.timestamp_ms).collect::<Vec<_>>(),
            vec![20, 30]
        );
    }
}
