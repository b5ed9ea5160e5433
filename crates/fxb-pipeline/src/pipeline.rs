//! The pipeline consumer task and fan-out.

use crate::aggregate::BarAggregator;
use crate::config::PipelineConfig;
use crate::counters::QualityCounters;
use crate::stages::{DropReason, QuoteFilter};
use fxb_core::{OhlcBar, Tick};
use fxb_store::TickStore;
use fxb_telemetry::metrics::{
    TICKS_BROADCAST, TICKS_DEDUPED, TICKS_DROPPED_INVALID, TICKS_DROPPED_STALE, TICKS_RECEIVED,
    TICKS_THROTTLED,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// What happened to one raw tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Dropped(DropReason),
    Accepted {
        broadcast: bool,
        sealed_bars: usize,
    },
}

/// Single consumer of the gateway's tick channel.
///
/// Serial per tick by design: the stages are cheap, and running them on one
/// task preserves ordering within a symbol for every downstream consumer.
pub struct QuotePipeline {
    filter: QuoteFilter,
    aggregator: BarAggregator,
    counters: Arc<QualityCounters>,
    store: Arc<TickStore>,
    hub_tx: mpsc::Sender<Tick>,
    engine_tx: mpsc::Sender<Tick>,
    bars_tx: broadcast::Sender<OhlcBar>,
}

impl QuotePipeline {
    pub fn new(
        config: PipelineConfig,
        store: Arc<TickStore>,
        hub_tx: mpsc::Sender<Tick>,
        engine_tx: mpsc::Sender<Tick>,
    ) -> Self {
        let timeframes = config.timeframes.clone();
        let (bars_tx, _) = broadcast::channel(256);
        Self {
            filter: QuoteFilter::new(config),
            aggregator: BarAggregator::new(timeframes),
            counters: Arc::new(QualityCounters::default()),
            store,
            hub_tx,
            engine_tx,
            bars_tx,
        }
    }

    pub fn counters(&self) -> Arc<QualityCounters> {
        self.counters.clone()
    }

    /// Subscribe to sealed bars.
    pub fn subscribe_bars(&self) -> broadcast::Receiver<OhlcBar> {
        self.bars_tx.subscribe()
    }

    /// Run the quality stages and aggregation for one tick, then fan out.
    pub async fn process(&mut self, tick: Tick) -> TickOutcome {
        let symbol_label = tick.symbol.as_str().to_string();
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        TICKS_RECEIVED.with_label_values(&[&symbol_label]).inc();

        if let Err(reason) = self.filter.admit(&tick) {
            match reason {
                DropReason::Duplicate => {
                    self.counters.deduped.fetch_add(1, Ordering::Relaxed);
                    TICKS_DEDUPED.with_label_values(&[&symbol_label]).inc();
                }
                DropReason::Stale => {
                    self.counters.dropped_stale.fetch_add(1, Ordering::Relaxed);
                    TICKS_DROPPED_STALE.with_label_values(&[&symbol_label]).inc();
                }
                DropReason::Invalid => {
                    self.counters.dropped_invalid.fetch_add(1, Ordering::Relaxed);
                    TICKS_DROPPED_INVALID
                        .with_label_values(&[&symbol_label])
                        .inc();
                }
            }
            return TickOutcome::Dropped(reason);
        }

        // Fan-out: store and engine see every accepted tick.
        self.store.record(&tick).await;
        if self.engine_tx.send(tick.clone()).await.is_err() {
            warn!("engine tick channel closed");
        }

        let broadcast = self.filter.should_broadcast(&tick);
        if broadcast {
            self.counters.broadcast.fetch_add(1, Ordering::Relaxed);
            TICKS_BROADCAST.with_label_values(&[&symbol_label]).inc();
            // The hub never applies backpressure to the pipeline; its
            // per-client queues are the only legitimate drop point.
            if let Err(mpsc::error::TrySendError::Full(_)) = self.hub_tx.try_send(tick.clone()) {
                warn!(symbol = %tick.symbol, "hub ingress full, broadcast skipped");
            }
        } else {
            self.counters.throttled.fetch_add(1, Ordering::Relaxed);
            TICKS_THROTTLED.with_label_values(&[&symbol_label]).inc();
        }

        let sealed = self.aggregator.apply(&tick);
        let sealed_count = sealed.len();
        for bar in sealed {
            // Only fails when nobody listens, which is fine.
            let _ = self.bars_tx.send(bar);
        }

        TickOutcome::Accepted {
            broadcast,
            sealed_bars: sealed_count,
        }
    }

    /// Consume the ingress channel until shutdown.
    pub async fn run(mut self, mut rx: mpsc::Receiver<Tick>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                tick = rx.recv() => {
                    match tick {
                        Some(tick) => { self.process(tick).await; }
                        None => {
                            info!("pipeline ingress closed");
                            return;
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("pipeline stopped");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fxb_core::{now_ms, Price, Symbol, Timeframe};
    use fxb_store::{spawn_writer, StoreConfig};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    fn tick(ts: i64, bid: Decimal, ask: Decimal) -> Tick {
        Tick::new("EURUSD", Price::new(bid), Price::new(ask), ts, "LP1")
    }

    struct Fixture {
        pipeline: QuotePipeline,
        hub_rx: mpsc::Receiver<Tick>,
        engine_rx: mpsc::Receiver<Tick>,
        store: Arc<TickStore>,
        _dir: TempDir,
    }

    fn fixture(config: PipelineConfig) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store_config = StoreConfig {
            data_dir: dir.path().to_path_buf(),
            ..StoreConfig::default()
        };
        let shutdown = CancellationToken::new();
        let (writer, _task) = spawn_writer(store_config.clone(), shutdown);
        let store = TickStore::new(store_config, writer);
        let (hub_tx, hub_rx) = mpsc::channel(16_384);
        let (engine_tx, engine_rx) = mpsc::channel(16_384);
        let pipeline = QuotePipeline::new(config, store.clone(), hub_tx, engine_tx);
        Fixture {
            pipeline,
            hub_rx,
            engine_rx,
            store,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn throttle_scenario() {
        // 1000 ticks oscillating far below epsilon: store and engine see all,
        // the hub sees only the initial broadcast.
        let mut fx = fixture(PipelineConfig::default());
        let base = now_ms();
        let base_bid = dec!(1.0850);
        let base_ask = dec!(1.0851);
        for i in 0..1000i64 {
            let delta = if i % 2 == 0 {
                Decimal::ZERO
            } else {
                dec!(0.0000001)
            };
            fx.pipeline
                .process(tick(base + i, base_bid + delta, base_ask + delta))
                .await;
        }

        let snap = fx.pipeline.counters().snapshot();
        assert_eq!(snap.received, 1000);
        assert!(snap.broadcast <= 5, "broadcast {} > 5", snap.broadcast);
        assert_eq!(snap.broadcast + snap.throttled, 1000);

        // Engine observed every accepted tick.
        let mut engine_count = 0;
        while fx.engine_rx.try_recv().is_ok() {
            engine_count += 1;
        }
        assert_eq!(engine_count, 1000);

        // Hub observed only the broadcasts.
        let mut hub_count = 0;
        while fx.hub_rx.try_recv().is_ok() {
            hub_count += 1;
        }
        assert_eq!(hub_count as u64, snap.broadcast);

        // Store holds all accepted ticks in the hot ring.
        assert_eq!(fx.store.latest_n(&Symbol::new("EURUSD"), 2000).len(), 1000);
    }

    #[tokio::test]
    async fn full_tick_mode_broadcasts_all() {
        let mut fx = fixture(PipelineConfig {
            full_tick: true,
            ..PipelineConfig::default()
        });
        let base = now_ms();
        for i in 0..50i64 {
            fx.pipeline
                .process(tick(base + i, dec!(1.0850), dec!(1.0851) + Decimal::new(i, 7)))
                .await;
        }
        let snap = fx.pipeline.counters().snapshot();
        assert_eq!(snap.broadcast, 50);
        assert_eq!(snap.throttled, 0);
    }

    #[tokio::test]
    async fn dropped_ticks_never_reach_downstream() {
        let mut fx = fixture(PipelineConfig::default());
        let base = now_ms();
        fx.pipeline
            .process(tick(base, dec!(1.0850), dec!(1.0851)))
            .await;
        // Crossed, duplicate and backwards ticks.
        fx.pipeline
            .process(tick(base + 1000, dec!(1.0852), dec!(1.0851)))
            .await;
        fx.pipeline
            .process(tick(base, dec!(1.0850), dec!(1.0851)))
            .await;
        fx.pipeline
            .process(tick(base - 1000, dec!(1.0850), dec!(1.0851)))
            .await;

        let snap = fx.pipeline.counters().snapshot();
        assert_eq!(snap.received, 4);
        assert_eq!(snap.dropped_invalid, 1);
        assert_eq!(snap.deduped, 1);
        assert_eq!(snap.dropped_stale, 1);

        let mut engine_count = 0;
        while fx.engine_rx.try_recv().is_ok() {
            engine_count += 1;
        }
        assert_eq!(engine_count, 1);
    }

    #[tokio::test]
    async fn sealed_bars_are_published() {
        let mut fx = fixture(PipelineConfig {
            timeframes: vec![Timeframe::M1],
            ..PipelineConfig::default()
        });
        let mut bars = fx.pipeline.subscribe_bars();

        // Two ticks one bucket apart, both inside the freshness window.
        let bucket = Timeframe::M1.bucket_start(now_ms());
        fx.pipeline
            .process(tick(bucket, dec!(1.0850), dec!(1.0851)))
            .await;
        let outcome = fx
            .pipeline
            .process(tick(bucket + 60_000, dec!(1.0852), dec!(1.0853)))
            .await;
        assert_eq!(
            outcome,
            TickOutcome::Accepted {
                broadcast: true,
                sealed_bars: 1
            }
        );

        let bar = bars.try_recv().unwrap();
        assert_eq!(bar.bucket_start_ms, bucket);
        assert_eq!(bar.volume, 1);
    }
}
