//! The hub: client registry and broadcast routing.

use crate::auth::{Identity, TokenValidator};
use crate::client::{ClientHandle, CloseIntent};
use crate::config::HubConfig;
use dashmap::DashMap;
use fxb_core::{now_ms, StreamEvent, Symbol, Tick};
use fxb_store::TickStore;
use fxb_telemetry::metrics::{HUB_BROADCAST_TOTAL, HUB_CLIENTS, HUB_SLOW_CLOSED_TOTAL};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Client registry plus routing rules.
///
/// Serialization happens once per event; routing decides which client
/// queues receive the payload. Client queues are the only contended
/// resource, and all sends are non-blocking tries.
pub struct Hub {
    config: HubConfig,
    validator: TokenValidator,
    clients: DashMap<Uuid, Arc<ClientHandle>>,
    /// Symbols currently enabled for streaming; empty set streams all.
    enabled: RwLock<HashSet<Symbol>>,
    store: Arc<TickStore>,
}

impl Hub {
    pub fn new(config: HubConfig, store: Arc<TickStore>) -> Arc<Self> {
        Arc::new(Self {
            validator: TokenValidator::from_config(&config),
            config,
            clients: DashMap::new(),
            enabled: RwLock::new(HashSet::new()),
            store,
        })
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn authenticate(&self, token: &str) -> Option<Identity> {
        self.validator.validate(token)
    }

    /// Register a freshly authenticated connection.
    pub fn register(&self, identity: Identity) -> (Arc<ClientHandle>, mpsc::Receiver<String>) {
        let (client, rx) = ClientHandle::new(
            identity,
            self.config.queue_capacity,
            self.config.drop_threshold,
            Duration::from_secs(self.config.drop_window_secs),
        );
        self.clients.insert(client.id, client.clone());
        HUB_CLIENTS.set(self.clients.len() as i64);
        (client, rx)
    }

    pub fn deregister(&self, id: Uuid) {
        if let Some((_, client)) = self.clients.remove(&id) {
            if client.close_intent() == Some(CloseIntent::SlowConsumer) {
                HUB_SLOW_CLOSED_TOTAL.inc();
            }
        }
        HUB_CLIENTS.set(self.clients.len() as i64);
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    // === Enabled symbols ===

    pub fn set_enabled_symbols(&self, symbols: impl IntoIterator<Item = Symbol>) {
        *self.enabled.write() = symbols.into_iter().collect();
    }

    pub fn symbol_enabled(&self, symbol: &Symbol) -> bool {
        let enabled = self.enabled.read();
        enabled.is_empty() || enabled.contains(symbol)
    }

    /// Latest cached tick per enabled symbol, for snapshot-on-connect.
    pub fn snapshot_ticks(&self) -> Vec<Tick> {
        self.store
            .latest_all()
            .into_iter()
            .filter(|t| self.symbol_enabled(&t.symbol))
            .collect()
    }

    /// Latest cached ticks for an explicit list (the `snapshot` request).
    pub fn snapshot_for(&self, symbols: &[Symbol]) -> Vec<Tick> {
        symbols
            .iter()
            .filter(|s| self.symbol_enabled(s))
            .filter_map(|s| self.store.latest(s))
            .collect()
    }

    // === Broadcast ===

    /// Fan one event into every interested client queue.
    pub fn broadcast(&self, event: &StreamEvent) {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(_) => return,
        };
        HUB_BROADCAST_TOTAL.inc();
        for entry in self.clients.iter() {
            let client = entry.value();
            if self.should_deliver(client, event) {
                client.try_send(payload.clone());
            }
        }
    }

    /// Routing rules per event kind.
    fn should_deliver(&self, client: &ClientHandle, event: &StreamEvent) -> bool {
        match event {
            StreamEvent::Tick { symbol, .. } => client.is_subscribed(symbol),
            // Account-scoped events go to their owner and to admins on the
            // aggregated channels.
            StreamEvent::OrderNew { .. }
            | StreamEvent::OrderModify { .. }
            | StreamEvent::OrderClose { .. }
            | StreamEvent::PositionOpened { .. }
            | StreamEvent::PositionModified { .. }
            | StreamEvent::PositionClosed { .. }
            | StreamEvent::AccountUpdate { .. }
            | StreamEvent::MarginCall { .. } => {
                if client.wants_firehose() {
                    return true;
                }
                match (client.identity.account(), event.account()) {
                    (Some(mine), Some(theirs)) => mine == theirs,
                    _ => false,
                }
            }
            // Session-scoped messages are sent directly, never broadcast.
            StreamEvent::Heartbeat { .. }
            | StreamEvent::Subscribed { .. }
            | StreamEvent::Unsubscribed { .. }
            | StreamEvent::Error { .. } => false,
        }
    }

    /// Direct message to one client.
    pub fn send_to(&self, client: &ClientHandle, event: &StreamEvent) {
        if let Ok(payload) = serde_json::to_string(event) {
            client.try_send(payload);
        }
    }

    /// Consume pipeline ticks and broadcast them until shutdown.
    pub async fn run_tick_feed(
        self: Arc<Self>,
        mut tick_rx: mpsc::Receiver<Tick>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                tick = tick_rx.recv() => {
                    match tick {
                        Some(tick) => {
                            if self.symbol_enabled(&tick.symbol) {
                                self.broadcast(&StreamEvent::from_tick(&tick));
                            }
                        }
                        None => return,
                    }
                }
                _ = shutdown.cancelled() => return,
            }
        }
    }

    /// Consume engine events and broadcast them until shutdown.
    pub async fn run_event_feed(
        self: Arc<Self>,
        mut events_rx: mpsc::UnboundedReceiver<StreamEvent>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                event = events_rx.recv() => {
                    match event {
                        Some(event) => self.broadcast(&event),
                        None => return,
                    }
                }
                _ = shutdown.cancelled() => return,
            }
        }
    }

    /// Close every client (server shutdown).
    pub fn close_all(&self) {
        for entry in self.clients.iter() {
            entry.value().close(CloseIntent::Shutdown);
        }
    }

    /// Heartbeat event payload.
    pub fn heartbeat_event() -> StreamEvent {
        StreamEvent::Heartbeat {
            timestamp: now_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fxb_core::{AccountId, Price};
    use fxb_store::{spawn_writer, StoreConfig};
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    fn hub_with_store() -> (Arc<Hub>, Arc<TickStore>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store_config = StoreConfig {
            data_dir: dir.path().to_path_buf(),
            ..StoreConfig::default()
        };
        let (writer, _task) = spawn_writer(store_config.clone(), CancellationToken::new());
        let store = TickStore::new(store_config, writer);
        let mut config = HubConfig::default();
        config.queue_capacity = 4;
        config.drop_threshold = 8;
        config
            .trader_tokens
            .insert("t-1".to_string(), AccountId::new(1001));
        config.admin_tokens.push("a-1".to_string());
        (Hub::new(config, store.clone()), store, dir)
    }

    fn tick(symbol: &str, bid: rust_decimal::Decimal) -> Tick {
        Tick::new(symbol, Price::new(bid), Price::new(bid + dec!(0.0001)), now_ms(), "LP1")
    }

    #[tokio::test]
    async fn tick_routing_respects_subscriptions() {
        let (hub, _store, _dir) = hub_with_store();
        let (c1, mut rx1) = hub.register(Identity::Trader(AccountId::new(1001)));
        let (_c2, mut rx2) = hub.register(Identity::Trader(AccountId::new(1002)));
        c1.subscribe(&[Symbol::new("EURUSD")]);

        hub.broadcast(&StreamEvent::from_tick(&tick("EURUSD", dec!(1.0850))));
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn account_events_route_to_owner_and_admin() {
        let (hub, _store, _dir) = hub_with_store();
        let (_owner, mut owner_rx) = hub.register(Identity::Trader(AccountId::new(1001)));
        let (_other, mut other_rx) = hub.register(Identity::Trader(AccountId::new(1002)));
        let (_admin, mut admin_rx) = hub.register(Identity::Admin);

        let event = StreamEvent::MarginCall {
            login: AccountId::new(1001),
            margin_level: dec!(90),
            equity: dec!(90),
            margin: dec!(100),
            action: fxb_core::MarginCallAction::Warning,
            timestamp: now_ms(),
        };
        hub.broadcast(&event);

        assert!(owner_rx.try_recv().is_ok());
        assert!(other_rx.try_recv().is_err());
        assert!(admin_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn slow_client_does_not_affect_others() {
        let (hub, _store, _dir) = hub_with_store();
        let (slow, mut slow_rx) = hub.register(Identity::Trader(AccountId::new(1001)));
        let (fast, mut fast_rx) = hub.register(Identity::Trader(AccountId::new(1002)));
        slow.subscribe(&[Symbol::new("EURUSD")]);
        fast.subscribe(&[Symbol::new("EURUSD")]);

        // Queue capacity 4, drop threshold 8: flood 50 ticks, draining
        // only the fast client.
        let mut fast_received = 0;
        for i in 0..50u32 {
            hub.broadcast(&StreamEvent::from_tick(&tick(
                "EURUSD",
                dec!(1.0850) + rust_decimal::Decimal::new(i as i64, 6),
            )));
            while fast_rx.try_recv().is_ok() {
                fast_received += 1;
            }
        }

        assert_eq!(fast_received, 50, "fast client receives every broadcast");
        assert_eq!(slow.close_intent(), Some(CloseIntent::SlowConsumer));
        assert!(slow.dropped_total() > 0);
        assert_eq!(fast.dropped_total(), 0);
        // The slow client still holds its first queued messages.
        assert!(slow_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn snapshot_respects_enabled_set() {
        let (hub, store, _dir) = hub_with_store();
        store.record(&tick("EURUSD", dec!(1.0850))).await;
        store.record(&tick("GBPUSD", dec!(1.2700))).await;

        assert_eq!(hub.snapshot_ticks().len(), 2);
        hub.set_enabled_symbols([Symbol::new("EURUSD")]);
        let snapshot = hub.snapshot_ticks();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].symbol, Symbol::new("EURUSD"));

        let explicit = hub.snapshot_for(&[Symbol::new("EURUSD"), Symbol::new("GBPUSD")]);
        assert_eq!(explicit.len(), 1);
    }

    #[tokio::test]
    async fn deregister_updates_count() {
        let (hub, _store, _dir) = hub_with_store();
        let (c1, _rx1) = hub.register(Identity::Admin);
        assert_eq!(hub.client_count(), 1);
        hub.deregister(c1.id);
        assert_eq!(hub.client_count(), 0);
    }
}
