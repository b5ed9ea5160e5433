//! Store configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Tick store tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory day files are written under (one subdirectory per symbol).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Hot ring capacity per symbol.
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,
    /// Flush once this many records are buffered.
    #[serde(default = "default_flush_batch")]
    pub flush_batch: usize,
    /// Flush at least this often regardless of batch fill.
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
    /// Rotate a day file once it holds this many records.
    #[serde(default = "default_max_records_per_file")]
    pub max_records_per_file: usize,
    /// Remove day files older than this many days.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// How often the retention sweep runs.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Write queue capacity between the pipeline and the writer task.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Disable coalescing under backpressure (regulatory-grade capture:
    /// the producer waits instead of collapsing to newest-per-symbol).
    #[serde(default)]
    pub strict_capture: bool,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data/ticks")
}

fn default_ring_capacity() -> usize {
    10_000
}

fn default_flush_batch() -> usize {
    500
}

fn default_flush_interval_secs() -> u64 {
    30
}

fn default_max_records_per_file() -> usize {
    50_000
}

fn default_retention_days() -> u32 {
    180
}

fn default_sweep_interval_secs() -> u64 {
    3600
}

fn default_queue_capacity() -> usize {
    8192
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            ring_capacity: default_ring_capacity(),
            flush_batch: default_flush_batch(),
            flush_interval_secs: default_flush_interval_secs(),
            max_records_per_file: default_max_records_per_file(),
            retention_days: default_retention_days(),
            sweep_interval_secs: default_sweep_interval_secs(),
            queue_capacity: default_queue_capacity(),
            strict_capture: false,
        }
    }
}
