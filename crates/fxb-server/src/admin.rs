//! Thin admin surface.
//!
//! The HTTP CRUD layer lives elsewhere; this is the in-process contract it
//! calls into: symbol gating, execution-mode toggling and stats snapshots.

use fxb_core::Symbol;
use fxb_engine::{Engine, EngineResult, ExecutionMode};
use fxb_fix::{GatewayHandle, SessionState};
use fxb_hub::Hub;
use fxb_pipeline::{QualityCounters, QualitySnapshot};
use fxb_store::TickStore;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::info;

/// Aggregated health/stats for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub pipeline: QualitySnapshot,
    pub hub_clients: usize,
    pub store_symbols: usize,
    pub store_records_written: u64,
    pub store_records_coalesced: u64,
    pub fix_sessions: HashMap<String, String>,
    pub accounts: usize,
    pub execution_mode: ExecutionMode,
    pub unacked_lp_orders: usize,
}

/// Handle the admin layer drives the core through.
#[derive(Clone)]
pub struct AdminHandle {
    engine: Arc<Engine>,
    hub: Arc<Hub>,
    gateway: GatewayHandle,
    store: Arc<TickStore>,
    counters: Arc<QualityCounters>,
}

impl AdminHandle {
    pub fn new(
        engine: Arc<Engine>,
        hub: Arc<Hub>,
        gateway: GatewayHandle,
        store: Arc<TickStore>,
        counters: Arc<QualityCounters>,
    ) -> Self {
        Self {
            engine,
            hub,
            gateway,
            store,
            counters,
        }
    }

    /// Enable a symbol: order acceptance, streaming, LP subscription.
    pub async fn enable_symbol(&self, symbol: &Symbol) -> EngineResult<()> {
        self.engine.set_symbol_enabled(symbol, true)?;
        self.sync_enabled_set();
        if let Some(spec) = self.engine.symbol(symbol) {
            if let Err(e) = self.gateway.subscribe(&spec).await {
                tracing::warn!(%symbol, ?e, "LP subscribe failed");
            }
        }
        info!(%symbol, "symbol enabled");
        Ok(())
    }

    /// Disable a symbol: stop accepting orders, stop streaming, drop the
    /// LP subscription. Open positions remain and continue to reprice off
    /// the last cached quote until re-enabled.
    pub async fn disable_symbol(&self, symbol: &Symbol) -> EngineResult<()> {
        self.engine.set_symbol_enabled(symbol, false)?;
        self.sync_enabled_set();
        if let Err(e) = self.gateway.unsubscribe(symbol).await {
            tracing::warn!(%symbol, ?e, "LP unsubscribe failed");
        }
        info!(%symbol, "symbol disabled");
        Ok(())
    }

    fn sync_enabled_set(&self) {
        let enabled = self
            .engine
            .symbols()
            .into_iter()
            .filter(|s| s.enabled)
            .map(|s| s.symbol);
        self.hub.set_enabled_symbols(enabled);
    }

    pub fn set_execution_mode(&self, mode: ExecutionMode) {
        self.engine.set_execution_mode(mode);
    }

    /// Reset a (demo) account to a clean slate with the given balance.
    pub fn reset_account(
        &self,
        account: fxb_core::AccountId,
        balance: rust_decimal::Decimal,
    ) -> fxb_engine::EngineResult<()> {
        self.engine.reset_account(account, balance)
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        self.engine.execution_mode()
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        let writer_stats = self.store.writer().stats();
        StatsSnapshot {
            pipeline: self.counters.snapshot(),
            hub_clients: self.hub.client_count(),
            store_symbols: self.store.symbol_count(),
            store_records_written: writer_stats.records_written.load(Ordering::Relaxed),
            store_records_coalesced: writer_stats.records_coalesced.load(Ordering::Relaxed),
            fix_sessions: self
                .gateway
                .session_states()
                .into_iter()
                .map(|(name, state)| (name, session_state_str(state).to_string()))
                .collect(),
            accounts: self.engine.account_count(),
            execution_mode: self.engine.execution_mode(),
            unacked_lp_orders: self.gateway.unacked_orders(),
        }
    }
}

fn session_state_str(state: SessionState) -> &'static str {
    state.as_str()
}
