//! Engine configuration.

use fxb_core::MarginMode;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Where client orders are matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    /// Matched internally against the broker's book.
    #[default]
    BBook,
    /// Routed to the external liquidity provider.
    ABook,
}

/// Risk levels and account defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Margin level (percent) below which a warning is emitted.
    #[serde(default = "default_margin_call_level")]
    pub margin_call_level: Decimal,
    /// Margin level (percent) below which positions are force-closed.
    #[serde(default = "default_stop_out_level")]
    pub stop_out_level: Decimal,
    /// Leverage applied to new accounts.
    #[serde(default = "default_leverage")]
    pub default_leverage: u32,
    /// Margin mode applied to new accounts.
    #[serde(default)]
    pub default_margin_mode: MarginMode,
    /// Commission charged per lot at open, account currency.
    #[serde(default)]
    pub commission_per_lot: Decimal,
    /// Spread mark-up added to the fill price, in pips.
    #[serde(default)]
    pub markup_pips: Decimal,
    /// A quote older than this cannot fill orders.
    #[serde(default = "default_max_quote_age_ms")]
    pub max_quote_age_ms: i64,
}

fn default_margin_call_level() -> Decimal {
    Decimal::ONE_HUNDRED
}

fn default_stop_out_level() -> Decimal {
    Decimal::new(50, 0)
}

fn default_leverage() -> u32 {
    100
}

fn default_max_quote_age_ms() -> i64 {
    300_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            margin_call_level: default_margin_call_level(),
            stop_out_level: default_stop_out_level(),
            default_leverage: default_leverage(),
            default_margin_mode: MarginMode::default(),
            commission_per_lot: Decimal::ZERO,
            markup_pips: Decimal::ZERO,
            max_quote_age_ms: default_max_quote_age_ms(),
        }
    }
}
