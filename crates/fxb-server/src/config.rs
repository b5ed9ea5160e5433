//! Application configuration.
//!
//! One TOML file aggregates the per-component sections; every field has a
//! default so a minimal file (or none at all) still yields a runnable
//! configuration.

use crate::error::AppResult;
use fxb_core::{Symbol, SymbolSpec};
use fxb_engine::{EngineConfig, ExecutionMode};
use fxb_fix::GatewayConfig;
use fxb_hub::HubConfig;
use fxb_pipeline::PipelineConfig;
use fxb_store::StoreConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Default tracing filter directive; `RUST_LOG` overrides it.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    /// Orders matched internally or routed to the LP.
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    /// Instrument catalog.
    #[serde(default)]
    pub symbols: Vec<SymbolSpec>,
    /// Symbols subscribed and streamed at startup; empty enables every
    /// catalog entry flagged `enabled`.
    #[serde(default)]
    pub enabled_symbols: Vec<Symbol>,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

fn default_log_filter() -> String {
    "info,fxb=debug".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter(),
            execution_mode: ExecutionMode::default(),
            symbols: Vec::new(),
            enabled_symbols: Vec::new(),
            gateway: GatewayConfig::default(),
            pipeline: PipelineConfig::default(),
            hub: HubConfig::default(),
            engine: EngineConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn from_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    /// The symbols the core starts streaming: the explicit list when
    /// given, otherwise every enabled catalog entry.
    pub fn startup_symbols(&self) -> Vec<Symbol> {
        if !self.enabled_symbols.is_empty() {
            return self.enabled_symbols.clone();
        }
        self.symbols
            .iter()
            .filter(|s| s.enabled)
            .map(|s| s.symbol.clone())
            .collect()
    }
}
