//! Per-client connection state.

use crate::auth::Identity;
use fxb_core::Symbol;
use fxb_telemetry::metrics::HUB_DROPPED_TOTAL;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Why the write task should close the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseIntent {
    /// Queue overflow persisted past the drop threshold.
    SlowConsumer,
    /// No inbound traffic within the idle window.
    Idle,
    /// Server shutdown.
    Shutdown,
}

/// The broadcaster's view of one connected client.
///
/// The bounded queue is the only place a broadcast may be dropped;
/// `try_send` keeps the broadcaster non-blocking.
pub struct ClientHandle {
    pub id: Uuid,
    pub identity: Identity,
    tx: mpsc::Sender<String>,
    subscriptions: RwLock<HashSet<Symbol>>,
    /// Admins may opt into the aggregated account/order/position stream.
    admin_firehose: RwLock<bool>,
    dropped_total: AtomicU64,
    window: Mutex<DropWindow>,
    drop_threshold: u64,
    drop_window: Duration,
    kill: CancellationToken,
    close_intent: Mutex<Option<CloseIntent>>,
    last_inbound: Mutex<Instant>,
}

struct DropWindow {
    started: Instant,
    drops: u64,
}

impl ClientHandle {
    pub fn new(
        identity: Identity,
        queue_capacity: usize,
        drop_threshold: u64,
        drop_window: Duration,
    ) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let handle = Arc::new(Self {
            id: Uuid::new_v4(),
            identity,
            tx,
            subscriptions: RwLock::new(HashSet::new()),
            admin_firehose: RwLock::new(identity.is_admin()),
            dropped_total: AtomicU64::new(0),
            window: Mutex::new(DropWindow {
                started: Instant::now(),
                drops: 0,
            }),
            drop_threshold: drop_threshold.max(1),
            drop_window,
            kill: CancellationToken::new(),
            close_intent: Mutex::new(None),
            last_inbound: Mutex::new(Instant::now()),
        });
        (handle, rx)
    }

    /// Non-blocking enqueue. Overflow increments counters and, past the
    /// threshold within the window, marks the client for closing.
    pub fn try_send(&self, payload: String) -> bool {
        match self.tx.try_send(payload) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped_total.fetch_add(1, Ordering::Relaxed);
                HUB_DROPPED_TOTAL.inc();
                let mut window = self.window.lock();
                if window.started.elapsed() > self.drop_window {
                    window.started = Instant::now();
                    window.drops = 0;
                }
                window.drops += 1;
                if window.drops >= self.drop_threshold {
                    self.close(CloseIntent::SlowConsumer);
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Request the write task to close the connection.
    pub fn close(&self, intent: CloseIntent) {
        let mut slot = self.close_intent.lock();
        if slot.is_none() {
            *slot = Some(intent);
        }
        drop(slot);
        self.kill.cancel();
    }

    pub fn close_intent(&self) -> Option<CloseIntent> {
        *self.close_intent.lock()
    }

    pub fn killed(&self) -> &CancellationToken {
        &self.kill
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }

    // === Subscriptions ===

    pub fn subscribe(&self, symbols: &[Symbol]) {
        let mut subs = self.subscriptions.write();
        for s in symbols {
            subs.insert(s.clone());
        }
    }

    pub fn unsubscribe(&self, symbols: &[Symbol]) {
        let mut subs = self.subscriptions.write();
        for s in symbols {
            subs.remove(s);
        }
    }

    pub fn is_subscribed(&self, symbol: &Symbol) -> bool {
        self.subscriptions.read().contains(symbol)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    pub fn wants_firehose(&self) -> bool {
        self.identity.is_admin() && *self.admin_firehose.read()
    }

    pub fn set_firehose(&self, on: bool) {
        *self.admin_firehose.write() = on;
    }

    // === Liveness ===

    pub fn record_inbound(&self) {
        *self.last_inbound.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_inbound.lock().elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fxb_core::AccountId;

    fn client(capacity: usize, threshold: u64) -> (Arc<ClientHandle>, mpsc::Receiver<String>) {
        ClientHandle::new(
            Identity::Trader(AccountId::new(1001)),
            capacity,
            threshold,
            Duration::from_secs(10),
        )
    }

    #[test]
    fn subscriptions() {
        let (c, _rx) = client(8, 8);
        c.subscribe(&[Symbol::new("EURUSD"), Symbol::new("GBPUSD")]);
        assert!(c.is_subscribed(&Symbol::new("EURUSD")));
        c.unsubscribe(&[Symbol::new("EURUSD")]);
        assert!(!c.is_subscribed(&Symbol::new("EURUSD")));
        assert_eq!(c.subscription_count(), 1);
    }

    #[test]
    fn overflow_marks_slow_consumer() {
        let (c, _rx) = client(2, 4);
        assert!(c.try_send("1".into()));
        assert!(c.try_send("2".into()));
        // Queue full: drops accumulate until the threshold closes it.
        for _ in 0..3 {
            assert!(!c.try_send("x".into()));
            assert!(c.close_intent().is_none());
        }
        assert!(!c.try_send("x".into()));
        assert_eq!(c.close_intent(), Some(CloseIntent::SlowConsumer));
        assert!(c.killed().is_cancelled());
        assert_eq!(c.dropped_total(), 4);
    }

    #[test]
    fn close_intent_is_sticky() {
        let (c, _rx) = client(2, 2);
        c.close(CloseIntent::Idle);
        c.close(CloseIntent::Shutdown);
        assert_eq!(c.close_intent(), Some(CloseIntent::Idle));
    }
}
