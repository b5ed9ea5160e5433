//! The tick store façade: hot ring + cold files + historical queries.

use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::reader::read_day;
use crate::record::TickRecord;
use crate::ring::TickRing;
use crate::writer::{day_of, WriterHandle};
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use fxb_core::{now_ms, OhlcBar, Symbol, Tick, Timeframe};
use parking_lot::RwLock;
use std::sync::Arc;

/// Hard cap on `ticks` pagination offset.
pub const OFFSET_CAP: usize = 1_000_000;
/// Hard cap on `ticks` page size.
pub const LIMIT_CAP: usize = 50_000;
/// Page size used when the caller passes `limit = 0`.
pub const DEFAULT_PAGE: usize = 5_000;

/// Unique owner of tick and bar storage.
///
/// Writes go to the per-symbol hot ring synchronously and to the cold
/// writer queue asynchronously. Historical reads merge both tiers.
pub struct TickStore {
    config: StoreConfig,
    rings: DashMap<Symbol, RwLock<TickRing>>,
    writer: WriterHandle,
}

impl TickStore {
    pub fn new(config: StoreConfig, writer: WriterHandle) -> Arc<Self> {
        Arc::new(Self {
            config,
            rings: DashMap::new(),
            writer,
        })
    }

    /// Record an accepted tick: hot ring append plus cold write-through.
    pub async fn record(&self, tick: &Tick) {
        {
            let ring = self
                .rings
                .entry(tick.symbol.clone())
                .or_insert_with(|| RwLock::new(TickRing::new(self.config.ring_capacity)));
            ring.write().push(tick.clone());
        }
        self.writer
            .append(tick.symbol.clone(), TickRecord::from_tick(tick))
            .await;
    }

    /// Latest tick for a symbol, if any has been recorded.
    pub fn latest(&self, symbol: &Symbol) -> Option<Tick> {
        self.rings
            .get(symbol)
            .and_then(|ring| ring.read().latest().cloned())
    }

    /// Latest tick per symbol, for snapshot-on-connect.
    pub fn latest_all(&self) -> Vec<Tick> {
        self.rings
            .iter()
            .filter_map(|entry| entry.value().read().latest().cloned())
            .collect()
    }

    /// Up to `n` most recent ticks for a symbol, oldest first.
    pub fn latest_n(&self, symbol: &Symbol, n: usize) -> Vec<Tick> {
        self.rings
            .get(symbol)
            .map(|ring| ring.read().latest_n(n))
            .unwrap_or_default()
    }

    /// Number of symbols with at least one recorded tick.
    pub fn symbol_count(&self) -> usize {
        self.rings.len()
    }

    pub fn writer(&self) -> &WriterHandle {
        &self.writer
    }

    /// Paged tick records for one (symbol, UTC day), ordered by timestamp.
    ///
    /// Merges flushed day files with ring ticks from the same day that have
    /// not reached disk yet. `limit = 0` selects the recommended page size.
    pub async fn ticks(
        &self,
        symbol: &Symbol,
        date: &str,
        offset: usize,
        limit: usize,
    ) -> StoreResult<Vec<TickRecord>> {
        if offset > OFFSET_CAP {
            return Err(StoreError::QueryBounds(format!(
                "offset {offset} exceeds {OFFSET_CAP}"
            )));
        }
        let limit = match limit {
            0 => DEFAULT_PAGE,
            n => n.min(LIMIT_CAP),
        };
        NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .map_err(|e| StoreError::InvalidDate(format!("{date}: {e}")))?;

        let mut records = self.read_day_merged(symbol, date).await?;
        if offset >= records.len() {
            return Ok(Vec::new());
        }
        let end = (offset + limit).min(records.len());
        Ok(records.drain(offset..end).collect())
    }

    /// Bars re-aggregated from the underlying tick range.
    ///
    /// The live partial bar is included only when the requested range
    /// overlaps the present.
    pub async fn ohlc(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        from_ms: i64,
        to_ms: i64,
    ) -> StoreResult<Vec<OhlcBar>> {
        if from_ms > to_ms {
            return Err(StoreError::QueryBounds(format!(
                "from {from_ms} after to {to_ms}"
            )));
        }

        let mut ticks: Vec<TickRecord> = Vec::new();
        for day in days_between(from_ms, to_ms) {
            let day_records = self.read_day_merged(symbol, &day).await?;
            ticks.extend(
                day_records
                    .into_iter()
                    .filter(|r| r.timestamp_ms >= from_ms && r.timestamp_ms <= to_ms),
            );
        }

        let include_partial = to_ms >= now_ms();
        Ok(aggregate(symbol, timeframe, &ticks, include_partial))
    }

    /// Disk records for a day plus ring ticks newer than the disk tail.
    async fn read_day_merged(&self, symbol: &Symbol, day: &str) -> StoreResult<Vec<TickRecord>> {
        let dir = self.config.data_dir.clone();
        let sym = symbol.clone();
        let day_owned = day.to_string();
        let mut records =
            tokio::task::spawn_blocking(move || read_day(&dir, &sym, &day_owned)).await??;

        let last_disk_ts = records.last().map(|r| r.timestamp_ms).unwrap_or(i64::MIN);
        if let Some(ring) = self.rings.get(symbol) {
            let unflushed: Vec<TickRecord> = ring
                .read()
                .range(last_disk_ts.saturating_add(1), i64::MAX)
                .iter()
                .filter(|t| day_of(t.timestamp_ms) == day)
                .map(TickRecord::from_tick)
                .collect();
            records.extend(unflushed);
        }
        Ok(records)
    }
}

/// Fold tick records into sealed bars; optionally keep the last (live) bar.
fn aggregate(
    symbol: &Symbol,
    timeframe: Timeframe,
    ticks: &[TickRecord],
    include_partial: bool,
) -> Vec<OhlcBar> {
    let mut bars: Vec<OhlcBar> = Vec::new();
    let mut current: Option<OhlcBar> = None;

    for tick in ticks {
        let bucket = timeframe.bucket_start(tick.timestamp_ms);
        let mid = tick.mid();
        let same_bucket = current
            .as_ref()
            .map(|bar| bar.bucket_start_ms == bucket)
            .unwrap_or(false);
        if same_bucket {
            current.as_mut().expect("bar present").update(mid);
        } else {
            if let Some(sealed) = current.take() {
                bars.push(sealed);
            }
            current = Some(OhlcBar::open_bucket(symbol.clone(), timeframe, bucket, mid));
        }
    }

    if let Some(bar) = current {
        // The trailing bar is sealed when its bucket has already elapsed.
        let sealed = bar.bucket_start_ms + timeframe.duration_ms() <= now_ms();
        if sealed || include_partial {
            bars.push(bar);
        }
    }
    bars
}

/// UTC day strings covering [from_ms, to_ms].
fn days_between(from_ms: i64, to_ms: i64) -> Vec<String> {
    let from = DateTime::from_timestamp_millis(from_ms)
        .map(|d| d.date_naive())
        .unwrap_or_default();
    let to = DateTime::<Utc>::from_timestamp_millis(to_ms)
        .map(|d| d.date_naive())
        .unwrap_or_default();
    let mut days = Vec::new();
    let mut day = from;
    while day <= to {
        days.push(day.format("%Y-%m-%d").to_string());
        match day.succ_opt() {
            Some(next) => day = next,
            None => break,
        }
    }
    days
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::spawn_writer;
    use fxb_core::Price;
    use rust_decimal_macros::dec;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn tick(ts: i64, bid: rust_decimal::Decimal, ask: rust_decimal::Decimal) -> Tick {
        Tick::new("EURUSD", Price::new(bid), Price::new(ask), ts, "LP1")
    }

    fn store(dir: &TempDir) -> (Arc<TickStore>, CancellationToken) {
        let config = StoreConfig {
            data_dir: dir.path().to_path_buf(),
            flush_batch: 2,
            ..StoreConfig::default()
        };
        let shutdown = CancellationToken::new();
        let (writer, _task) = spawn_writer(config.clone(), shutdown.clone());
        (TickStore::new(config, writer), shutdown)
    }

    #[tokio::test]
    async fn latest_and_ring_reads() {
        let dir = TempDir::new().unwrap();
        let (store, _shutdown) = store(&dir);

        store.record(&tick(1, dec!(1.0850), dec!(1.0851))).await;
        store.record(&tick(2, dec!(1.0852), dec!(1.0853))).await;

        let latest = store.latest(&Symbol::new("EURUSD")).unwrap();
        assert_eq!(latest.timestamp_ms, 2);
        assert_eq!(store.latest_n(&Symbol::new("EURUSD"), 5).len(), 2);
        assert_eq!(store.symbol_count(), 1);
    }

    #[tokio::test]
    async fn ticks_query_merges_ring() {
        let dir = TempDir::new().unwrap();
        let (store, _shutdown) = store(&dir);
        let symbol = Symbol::new("EURUSD");

        // 2024-01-20; batch of 2 flushes, third stays in the ring.
        store
            .record(&tick(1_705_778_100_000, dec!(1.0850), dec!(1.0851)))
            .await;
        store
            .record(&tick(1_705_778_101_000, dec!(1.0852), dec!(1.0853)))
            .await;
        store.writer().flush().await.unwrap();
        store
            .record(&tick(1_705_778_102_000, dec!(1.0854), dec!(1.0855)))
            .await;

        let page = store.ticks(&symbol, "2024-01-20", 0, 10).await.unwrap();
        assert_eq!(page.len(), 3);
        assert_eq!(page[2].timestamp_ms, 1_705_778_102_000);

        let offset_page = store.ticks(&symbol, "2024-01-20", 2, 10).await.unwrap();
        assert_eq!(offset_page.len(), 1);

        assert!(store
            .ticks(&symbol, "2024-01-20", OFFSET_CAP + 1, 10)
            .await
            .is_err());
        assert!(store.ticks(&symbol, "not-a-date", 0, 10).await.is_err());
    }

    #[tokio::test]
    async fn ohlc_scenario_a() {
        let dir = TempDir::new().unwrap();
        let (store, _shutdown) = store(&dir);
        let symbol = Symbol::new("EURUSD");

        for (ts, bid, ask) in [
            (1_705_778_100_000i64, dec!(1.0850), dec!(1.0851)),
            (1_705_778_115_000, dec!(1.0852), dec!(1.0853)),
            (1_705_778_145_000, dec!(1.0849), dec!(1.0850)),
            (1_705_778_160_000, dec!(1.0851), dec!(1.0852)),
        ] {
            store.record(&tick(ts, bid, ask)).await;
        }
        store.writer().flush().await.unwrap();

        let bars = store
            .ohlc(&symbol, Timeframe::M1, 1_705_778_100_000, 1_705_778_219_999)
            .await
            .unwrap();
        assert_eq!(bars.len(), 2);

        let first = &bars[0];
        assert_eq!(first.bucket_start_ms, 1_705_778_100_000);
        assert_eq!(first.open.inner(), dec!(1.08505));
        assert_eq!(first.high.inner(), dec!(1.08525));
        assert_eq!(first.low.inner(), dec!(1.08495));
        assert_eq!(first.close.inner(), dec!(1.08495));
        assert_eq!(first.volume, 3);

        let second = &bars[1];
        assert_eq!(second.bucket_start_ms, 1_705_778_160_000);
        assert_eq!(second.open.inner(), dec!(1.08515));
        assert_eq!(second.volume, 1);
    }

    #[test]
    fn day_span() {
        let days = days_between(1_705_778_100_000, 1_705_950_000_000);
        assert_eq!(days, vec!["2024-01-20", "2024-01-21", "2024-01-22"]);
    }
}
