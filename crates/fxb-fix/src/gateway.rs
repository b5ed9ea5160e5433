//! The gateway: session ownership, market-data plumbing, order routing.
//!
//! Owns one or more sessions (typically market data and order flow split
//! across two). Application messages from the sessions flow through
//! `pump_events`; accepted top-of-book changes leave as normalized ticks on
//! a bounded channel toward the pipeline. Orders submitted while a session
//! is down, or sent but not yet acknowledged, are replayed after resync.

use crate::book::QuoteBook;
use crate::config::{GatewayConfig, InstrumentRouting};
use crate::error::{FixError, FixResult};
use crate::fields::msg_type;
use crate::messages::{self, ExecutionReport, MarketDataUpdate};
use crate::session::{SessionEvent, SessionHandle, SessionState};
use dashmap::{DashMap, DashSet};
use fxb_core::{OrderSide, OrderType, Price, SourceTag, Symbol, SymbolSpec, Tick, Volume};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// An order routed to the liquidity provider (A-book).
#[derive(Debug, Clone, PartialEq)]
pub struct LpOrder {
    pub cl_ord_id: String,
    pub symbol: Symbol,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub volume: Volume,
    pub price: Option<Price>,
    /// Quote currency for the instrument routing fields.
    pub currency: String,
}

/// An execution report attributed to its session.
#[derive(Debug, Clone, PartialEq)]
pub struct LpExecution {
    pub session: String,
    pub report: ExecutionReport,
}

/// Shared gateway, cloned as `Arc`.
pub type GatewayHandle = Arc<FixGateway>;

pub struct FixGateway {
    routing: InstrumentRouting,
    sessions: RwLock<HashMap<String, SessionHandle>>,
    /// Name of the session carrying market data / orders.
    md_session: RwLock<Option<String>>,
    order_session: RwLock<Option<String>>,
    book: QuoteBook,
    tick_tx: mpsc::Sender<Tick>,
    /// Newest unsent tick per symbol when the channel is full; the oldest
    /// unsent value for the symbol is what gets dropped.
    tick_overflow: DashMap<Symbol, Tick>,
    exec_tx: mpsc::Sender<LpExecution>,
    /// Active subscriptions, replayed after every logon.
    subscribed: DashMap<Symbol, String>,
    /// Symbols already announced with a SecurityDefinitionRequest.
    announced: DashSet<Symbol>,
    /// Orders sent but not yet acknowledged by an ExecutionReport.
    unacked: DashMap<String, LpOrder>,
    next_req_id: AtomicU64,
}

impl FixGateway {
    /// Build the gateway plus the receiving ends of its output channels.
    pub fn new(
        config: &GatewayConfig,
    ) -> (GatewayHandle, mpsc::Receiver<Tick>, mpsc::Receiver<LpExecution>) {
        let (tick_tx, tick_rx) = mpsc::channel(config.tick_channel_capacity.max(1));
        let (exec_tx, exec_rx) = mpsc::channel(1024);
        let gateway = Arc::new(Self {
            routing: config.routing.clone(),
            sessions: RwLock::new(HashMap::new()),
            md_session: RwLock::new(None),
            order_session: RwLock::new(None),
            book: QuoteBook::new(),
            tick_tx,
            tick_overflow: DashMap::new(),
            exec_tx,
            subscribed: DashMap::new(),
            announced: DashSet::new(),
            unacked: DashMap::new(),
            next_req_id: AtomicU64::new(1),
        });
        (gateway, tick_rx, exec_rx)
    }

    /// Register a running session's handle and its roles.
    pub fn attach_session(&self, handle: SessionHandle, market_data: bool, orders: bool) {
        let name = handle.name.clone();
        if market_data {
            *self.md_session.write() = Some(name.clone());
        }
        if orders {
            *self.order_session.write() = Some(name.clone());
        }
        self.sessions.write().insert(name, handle);
    }

    pub fn session_states(&self) -> HashMap<String, SessionState> {
        self.sessions
            .read()
            .iter()
            .map(|(name, handle)| (name.clone(), handle.state()))
            .collect()
    }

    fn session(&self, name: &Option<String>) -> FixResult<SessionHandle> {
        let name = name
            .as_ref()
            .ok_or_else(|| FixError::UnknownSession("unassigned role".to_string()))?;
        self.sessions
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| FixError::UnknownSession(name.clone()))
    }

    fn next_req_id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next_req_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Subscribe top-of-book for a symbol.
    ///
    /// The first subscription for a symbol is preceded by a
    /// SecurityDefinitionRequest announcing the instrument.
    pub async fn subscribe(&self, spec: &SymbolSpec) -> FixResult<()> {
        let session = self.session(&self.md_session.read().clone())?;
        self.subscribed
            .insert(spec.symbol.clone(), spec.quote_currency.clone());
        self.send_subscribe(&session, &spec.symbol, &spec.quote_currency)
            .await
    }

    async fn send_subscribe(
        &self,
        session: &SessionHandle,
        symbol: &Symbol,
        currency: &str,
    ) -> FixResult<()> {
        if self.announced.insert(symbol.clone()) {
            let req_id = self.next_req_id("sd");
            session
                .send_app(
                    msg_type::SECURITY_DEFINITION_REQUEST,
                    messages::security_definition_request_body(
                        &req_id,
                        symbol.as_str(),
                        self.routing.product,
                        &self.routing.security_type,
                        &self.routing.security_exchange,
                        currency,
                    ),
                )
                .await?;
        }
        let req_id = self.next_req_id("md");
        session
            .send_app(
                msg_type::MARKET_DATA_REQUEST,
                messages::market_data_request_body(
                    &req_id,
                    true,
                    symbol.as_str(),
                    self.routing.product,
                    &self.routing.security_type,
                    &self.routing.security_exchange,
                    currency,
                ),
            )
            .await?;
        info!(%symbol, "subscribed top-of-book");
        Ok(())
    }

    /// Drop the subscription and the cached book for a symbol.
    pub async fn unsubscribe(&self, symbol: &Symbol) -> FixResult<()> {
        let Some((_, currency)) = self.subscribed.remove(symbol) else {
            return Ok(());
        };
        self.book.remove(symbol);
        let session = self.session(&self.md_session.read().clone())?;
        let req_id = self.next_req_id("md");
        session
            .send_app(
                msg_type::MARKET_DATA_REQUEST,
                messages::market_data_request_body(
                    &req_id,
                    false,
                    symbol.as_str(),
                    self.routing.product,
                    &self.routing.security_type,
                    &self.routing.security_exchange,
                    &currency,
                ),
            )
            .await?;
        info!(%symbol, "unsubscribed");
        Ok(())
    }

    /// Submit an order to the LP. Kept as unacknowledged until the first
    /// ExecutionReport references it; replayed after a reconnect.
    pub async fn send_order(&self, order: LpOrder) -> FixResult<()> {
        let session = self.session(&self.order_session.read().clone())?;
        self.unacked.insert(order.cl_ord_id.clone(), order.clone());
        self.write_order(&session, &order).await
    }

    async fn write_order(&self, session: &SessionHandle, order: &LpOrder) -> FixResult<()> {
        session
            .send_app(
                msg_type::NEW_ORDER_SINGLE,
                messages::new_order_single_body(
                    &order.cl_ord_id,
                    order.symbol.as_str(),
                    order.side,
                    order.order_type,
                    order.volume,
                    order.price,
                ),
            )
            .await
    }

    /// Number of orders awaiting their first ExecutionReport.
    pub fn unacked_orders(&self) -> usize {
        self.unacked.len()
    }

    /// Latest cached top-of-book for a symbol.
    pub fn top_of_book(&self, symbol: &Symbol) -> Option<(Price, Price)> {
        self.book.top(symbol)
    }

    /// Consume session events until shutdown.
    pub async fn pump_events(
        self: Arc<Self>,
        mut events_rx: mpsc::Receiver<SessionEvent>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                event = events_rx.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => return,
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("gateway event pump stopped");
                    return;
                }
            }
        }
    }

    /// React to one session event.
    pub async fn handle_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::StateChanged { session, state } => {
                debug!(%session, state = state.as_str(), "session state");
            }
            SessionEvent::LoggedOn { session } => {
                self.replay_after_logon(&session).await;
            }
            SessionEvent::AppMessage { session, message } => {
                let mt = message.msg_type().unwrap_or_default().to_string();
                match mt.as_str() {
                    msg_type::MARKET_DATA_SNAPSHOT | msg_type::MARKET_DATA_INCREMENTAL => {
                        match MarketDataUpdate::parse(&message) {
                            Ok(update) => self.emit_ticks(&session, &update).await,
                            Err(e) => warn!(%session, ?e, "bad market data message"),
                        }
                    }
                    msg_type::EXECUTION_REPORT => match ExecutionReport::parse(&message) {
                        Ok(report) => {
                            self.unacked.remove(&report.cl_ord_id);
                            if self
                                .exec_tx
                                .send(LpExecution { session, report })
                                .await
                                .is_err()
                            {
                                warn!("execution channel closed");
                            }
                        }
                        Err(e) => warn!(%session, ?e, "bad execution report"),
                    },
                    other => debug!(%session, msg_type = other, "unhandled app message"),
                }
            }
            SessionEvent::Halted { session, reason } => {
                error!(%session, %reason, "session halted, admin intervention required");
            }
        }
    }

    /// Emit the ticks produced by a book update, newest-wins under
    /// backpressure.
    async fn emit_ticks(&self, session: &str, update: &MarketDataUpdate) {
        let source = SourceTag::new(session);
        for tick in self.book.apply(update, &source) {
            // Retry anything parked by an earlier full channel first, so
            // per-symbol ordering holds.
            if let Some((_, parked)) = self.tick_overflow.remove(&tick.symbol) {
                if let Err(mpsc::error::TrySendError::Full(parked)) = self.tick_tx.try_send(parked)
                {
                    // Still full: the newer tick supersedes it.
                    drop(parked);
                }
            }
            if let Err(mpsc::error::TrySendError::Full(tick)) = self.tick_tx.try_send(tick) {
                debug!(symbol = %tick.symbol, "tick channel full, keeping newest");
                self.tick_overflow.insert(tick.symbol.clone(), tick);
            }
        }
    }

    /// After logon: re-announce and re-subscribe every active symbol, then
    /// replay unacknowledged orders.
    async fn replay_after_logon(&self, session_name: &str) {
        let is_md = self.md_session.read().as_deref() == Some(session_name);
        let is_orders = self.order_session.read().as_deref() == Some(session_name);

        if is_md {
            if let Ok(session) = self.session(&Some(session_name.to_string())) {
                let subs: Vec<(Symbol, String)> = self
                    .subscribed
                    .iter()
                    .map(|e| (e.key().clone(), e.value().clone()))
                    .collect();
                for (symbol, currency) in subs {
                    // Fresh connection, fresh announcement.
                    self.announced.remove(&symbol);
                    if let Err(e) = self.send_subscribe(&session, &symbol, &currency).await {
                        warn!(%symbol, ?e, "re-subscribe failed");
                    }
                }
            }
        }

        if is_orders {
            if let Ok(session) = self.session(&Some(session_name.to_string())) {
                let orders: Vec<LpOrder> =
                    self.unacked.iter().map(|e| e.value().clone()).collect();
                if !orders.is_empty() {
                    info!(count = orders.len(), "replaying unacknowledged orders");
                }
                for order in orders {
                    if let Err(e) = self.write_order(&session, &order).await {
                        warn!(cl_ord_id = %order.cl_ord_id, ?e, "order replay failed");
                    }
                }
            }
        }
    }
}
