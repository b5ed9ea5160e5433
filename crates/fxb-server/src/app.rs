//! Application wiring.
//!
//! Builds every component, connects the channels between them, and owns
//! the spawned tasks. Components are explicit dependencies injected here
//! at startup; their lifetime is the process.

use crate::admin::AdminHandle;
use crate::config::AppConfig;
use fxb_core::Tick;
use fxb_engine::{Engine, LpFill, LpFillStatus};
use fxb_fix::messages::ExecStatus;
use fxb_fix::{FixGateway, FixSession, GatewayHandle, LpOrder, SessionEvent, TcpConnector};
use fxb_hub::Hub;
use fxb_pipeline::{QualityCounters, QuotePipeline};
use fxb_store::{run_retention_sweep, spawn_writer, TickStore};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Capacity of the pipeline-to-hub tick channel.
const HUB_TICK_CHANNEL: usize = 8192;
/// Capacity of the pipeline-to-engine tick channel.
const ENGINE_TICK_CHANNEL: usize = 8192;

/// The assembled broker core.
pub struct Application {
    config: AppConfig,
    shutdown: CancellationToken,
    engine: Arc<Engine>,
    store: Arc<TickStore>,
    hub: Arc<Hub>,
    gateway: GatewayHandle,
    counters: Arc<QualityCounters>,
    tasks: Vec<JoinHandle<()>>,
}

impl Application {
    /// Build every component and spawn the long-lived tasks.
    pub async fn start(config: AppConfig) -> anyhow::Result<Self> {
        let shutdown = CancellationToken::new();

        // Store: writer task, sweep task, façade.
        let (writer, writer_task) = spawn_writer(config.store.clone(), shutdown.clone());
        let store = TickStore::new(config.store.clone(), writer);
        let sweep_task = tokio::spawn(run_retention_sweep(
            config.store.clone(),
            shutdown.clone(),
        ));

        // Engine and its channels.
        let (engine, engine_events_rx, router_rx) = Engine::new(config.engine.clone());
        engine.set_execution_mode(config.execution_mode);
        for spec in &config.symbols {
            engine.upsert_symbol(spec.clone());
        }

        // Hub.
        let hub = Hub::new(config.hub.clone(), store.clone());
        hub.set_enabled_symbols(config.startup_symbols());

        // Gateway and its sessions.
        let (gateway, gateway_tick_rx, mut exec_rx) = FixGateway::new(&config.gateway);
        let (session_events_tx, session_events_rx) = mpsc::channel::<SessionEvent>(1024);
        let mut tasks = Vec::new();
        for session_config in &config.gateway.sessions {
            let connector = TcpConnector::new(session_config.host.clone(), session_config.port);
            let (handle, session) =
                FixSession::new(session_config.clone(), connector, session_events_tx.clone());
            gateway.attach_session(handle, session_config.market_data, session_config.orders);
            tasks.push(tokio::spawn(session.run(shutdown.clone())));
        }
        tasks.push(tokio::spawn(
            gateway.clone().pump_events(session_events_rx, shutdown.clone()),
        ));

        // Pipeline: gateway ticks in, hub/engine/store out.
        let (hub_tick_tx, hub_tick_rx) = mpsc::channel::<Tick>(HUB_TICK_CHANNEL);
        let (engine_tick_tx, mut engine_tick_rx) = mpsc::channel::<Tick>(ENGINE_TICK_CHANNEL);
        let pipeline = QuotePipeline::new(
            config.pipeline.clone(),
            store.clone(),
            hub_tick_tx,
            engine_tick_tx,
        );
        let counters = pipeline.counters();
        tasks.push(tokio::spawn(
            pipeline.run(gateway_tick_rx, shutdown.clone()),
        ));

        // Engine repricing feed.
        {
            let engine = engine.clone();
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        tick = engine_tick_rx.recv() => {
                            match tick {
                                Some(tick) => engine.on_tick(&tick),
                                None => return,
                            }
                        }
                        _ = shutdown.cancelled() => return,
                    }
                }
            }));
        }

        // A-book order routing: engine -> gateway.
        {
            let gateway = gateway.clone();
            let shutdown = shutdown.clone();
            let mut router_rx = router_rx;
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        routed = router_rx.recv() => {
                            let Some(routed) = routed else { return };
                            let order = LpOrder {
                                cl_ord_id: routed.cl_ord_id,
                                symbol: routed.order.symbol.clone(),
                                side: routed.order.side,
                                order_type: routed.order.order_type,
                                volume: routed.order.volume,
                                price: routed.order.price,
                                currency: routed.quote_currency,
                            };
                            if let Err(e) = gateway.send_order(order).await {
                                warn!(?e, "order routing failed");
                            }
                        }
                        _ = shutdown.cancelled() => return,
                    }
                }
            }));
        }

        // LP execution reports: gateway -> engine.
        {
            let engine = engine.clone();
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        execution = exec_rx.recv() => {
                            let Some(execution) = execution else { return };
                            let report = execution.report;
                            let status = match report.ord_status {
                                ExecStatus::Filled => LpFillStatus::Filled,
                                ExecStatus::Rejected | ExecStatus::Canceled => {
                                    LpFillStatus::Rejected
                                }
                                // Acks and partials: wait for the final state.
                                ExecStatus::New | ExecStatus::PartiallyFilled => continue,
                            };
                            engine.apply_lp_fill(LpFill {
                                cl_ord_id: report.cl_ord_id.clone(),
                                status,
                                price: report.avg_price.or(report.last_price),
                            });
                        }
                        _ = shutdown.cancelled() => return,
                    }
                }
            }));
        }

        // Hub feeds and server.
        tasks.push(tokio::spawn(
            hub.clone().run_tick_feed(hub_tick_rx, shutdown.clone()),
        ));
        tasks.push(tokio::spawn(
            hub.clone().run_event_feed(engine_events_rx, shutdown.clone()),
        ));
        {
            let hub = hub.clone();
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = fxb_hub::run_server(hub, shutdown).await {
                    warn!(?e, "hub server exited");
                }
            }));
        }
        tasks.push(writer_task);
        tasks.push(sweep_task);

        // Register startup subscriptions with the gateway; they go on the
        // wire once the market-data session logs on.
        for symbol in config.startup_symbols() {
            if let Some(spec) = engine.symbol(&symbol) {
                if let Err(e) = gateway.subscribe(&spec).await {
                    warn!(%symbol, ?e, "startup subscribe deferred");
                }
            }
        }

        info!(
            symbols = config.symbols.len(),
            sessions = config.gateway.sessions.len(),
            mode = ?config.execution_mode,
            "broker core started"
        );

        Ok(Self {
            config,
            shutdown,
            engine,
            store,
            hub,
            gateway,
            counters,
            tasks,
        })
    }

    pub fn admin(&self) -> AdminHandle {
        AdminHandle::new(
            self.engine.clone(),
            self.hub.clone(),
            self.gateway.clone(),
            self.store.clone(),
            self.counters.clone(),
        )
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn engine(&self) -> Arc<Engine> {
        self.engine.clone()
    }

    pub fn store(&self) -> Arc<TickStore> {
        self.store.clone()
    }

    pub fn hub(&self) -> Arc<Hub> {
        self.hub.clone()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until interrupted, then stop cleanly.
    pub async fn run(mut self) -> anyhow::Result<()> {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
            }
            _ = self.shutdown.cancelled() => {}
        }
        self.stop().await;
        Ok(())
    }

    /// Cancel every task, flush the store, wait for the tasks to end.
    pub async fn stop(&mut self) {
        info!("stopping broker core");
        self.hub.close_all();
        if let Err(e) = self.store.writer().flush().await {
            warn!(?e, "final store flush failed");
        }
        self.shutdown.cancel();
        for task in self.tasks.drain(..) {
            let _ = tokio::time::timeout(std::time::Duration::from_secs(5), task).await;
        }
        info!("broker core stopped");
    }
}
