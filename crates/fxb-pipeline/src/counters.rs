//! Quality counters exported to the admin surface.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters, shared between the pipeline and the admin surface.
#[derive(Debug, Default)]
pub struct QualityCounters {
    pub received: AtomicU64,
    pub deduped: AtomicU64,
    pub dropped_stale: AtomicU64,
    pub dropped_invalid: AtomicU64,
    pub throttled: AtomicU64,
    pub broadcast: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QualitySnapshot {
    pub received: u64,
    pub deduped: u64,
    pub dropped_stale: u64,
    pub dropped_invalid: u64,
    pub throttled: u64,
    pub broadcast: u64,
}

impl QualityCounters {
    pub fn snapshot(&self) -> QualitySnapshot {
        QualitySnapshot {
            received: self.received.load(Ordering::Relaxed),
            deduped: self.deduped.load(Ordering::Relaxed),
            dropped_stale: self.dropped_stale.load(Ordering::Relaxed),
            dropped_invalid: self.dropped_invalid.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
            broadcast: self.broadcast.load(Ordering::Relaxed),
        }
    }
}
