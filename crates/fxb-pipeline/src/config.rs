//! Pipeline configuration.

use fxb_core::Timeframe;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Quote pipeline tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Drop ticks whose timestamp lags the wall clock by more than this.
    #[serde(default = "default_max_tick_age_ms")]
    pub max_tick_age_ms: i64,
    /// Reject a tick whose mid moved more than this fraction from the last
    /// accepted mid (0.10 = 10%).
    #[serde(default = "default_max_mid_change")]
    pub max_mid_change: Decimal,
    /// Suppress broadcast when the mid moved less than this fraction since
    /// the last broadcast.
    #[serde(default = "default_throttle_epsilon")]
    pub throttle_epsilon: Decimal,
    /// Disable throttling entirely; every accepted tick is broadcast.
    #[serde(default)]
    pub full_tick: bool,
    /// Timeframes bars are aggregated for.
    #[serde(default = "default_timeframes")]
    pub timeframes: Vec<Timeframe>,
}

fn default_max_tick_age_ms() -> i64 {
    60_000
}

fn default_max_mid_change() -> Decimal {
    // 10%
    Decimal::new(10, 2)
}

fn default_throttle_epsilon() -> Decimal {
    // 1e-6
    Decimal::new(1, 6)
}

fn default_timeframes() -> Vec<Timeframe> {
    Timeframe::ALL.to_vec()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_tick_age_ms: default_max_tick_age_ms(),
            max_mid_change: default_max_mid_change(),
            throttle_epsilon: default_throttle_epsilon(),
            full_tick: false,
            timeframes: default_timeframes(),
        }
    }
}
