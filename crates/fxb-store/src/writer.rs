//! Asynchronous batched day-file writer.
//!
//! A dedicated task owns all open file handles. Ticks arrive on a bounded
//! queue; a flush happens when the batch size is reached or the flush
//! interval elapses. When the queue is full the producer coalesces to the
//! newest record per symbol, unless strict capture is configured, in which
//! case the producer waits.

use crate::config::StoreConfig;
use crate::error::StoreResult;
use crate::record::TickRecord;
use chrono::DateTime;
use dashmap::DashMap;
use fxb_core::Symbol;
use fxb_telemetry::metrics::{STORE_COALESCED_TOTAL, STORE_FLUSHED_RECORDS};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Commands accepted by the writer task.
enum WriteCmd {
    Record(Symbol, TickRecord),
    /// Force a flush and acknowledge once durable.
    Flush(oneshot::Sender<()>),
}

/// Counters shared between the handle and the admin surface.
#[derive(Debug, Default)]
pub struct WriterStats {
    pub records_written: AtomicU64,
    pub records_coalesced: AtomicU64,
}

/// Producer-side handle to the writer task.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<WriteCmd>,
    /// Newest-per-symbol overflow buffer used when the queue is full.
    coalesce: Arc<DashMap<Symbol, TickRecord>>,
    strict_capture: bool,
    stats: Arc<WriterStats>,
}

impl WriterHandle {
    /// Enqueue a record for flushing.
    ///
    /// Only waits when strict capture is on and the queue is full;
    /// otherwise a full queue degrades to newest-per-symbol coalescing.
    pub async fn append(&self, symbol: Symbol, record: TickRecord) {
        if self.strict_capture {
            if self.tx.send(WriteCmd::Record(symbol, record)).await.is_err() {
                warn!("tick writer stopped, record lost");
            }
            return;
        }
        match self.tx.try_send(WriteCmd::Record(symbol, record)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(WriteCmd::Record(symbol, record))) => {
                self.coalesce.insert(symbol, record);
                self.stats.records_coalesced.fetch_add(1, Ordering::Relaxed);
                STORE_COALESCED_TOTAL.inc();
            }
            Err(_) => warn!("tick writer stopped, record lost"),
        }
    }

    /// Flush everything buffered and wait for it to reach disk.
    pub async fn flush(&self) -> StoreResult<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(WriteCmd::Flush(ack_tx))
            .await
            .map_err(|_| crate::error::StoreError::WriterStopped)?;
        ack_rx
            .await
            .map_err(|_| crate::error::StoreError::WriterStopped)
    }

    pub fn stats(&self) -> &WriterStats {
        &self.stats
    }
}

/// Spawn the writer task. Returns the producer handle and the join handle.
pub fn spawn_writer(
    config: StoreConfig,
    shutdown: CancellationToken,
) -> (WriterHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(config.queue_capacity);
    let coalesce: Arc<DashMap<Symbol, TickRecord>> = Arc::new(DashMap::new());
    let stats = Arc::new(WriterStats::default());

    let handle = WriterHandle {
        tx,
        coalesce: coalesce.clone(),
        strict_capture: config.strict_capture,
        stats: stats.clone(),
    };

    let task = tokio::spawn(writer_loop(config, rx, coalesce, stats, shutdown));
    (handle, task)
}

async fn writer_loop(
    config: StoreConfig,
    mut rx: mpsc::Receiver<WriteCmd>,
    coalesce: Arc<DashMap<Symbol, TickRecord>>,
    stats: Arc<WriterStats>,
    shutdown: CancellationToken,
) {
    let mut files = FileSet::new(config.data_dir.clone(), config.max_records_per_file);
    let mut buffer: Vec<(Symbol, TickRecord)> = Vec::with_capacity(config.flush_batch);
    let mut interval =
        tokio::time::interval(Duration::from_secs(config.flush_interval_secs.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            cmd = rx.recv() => {
                match cmd {
                    Some(WriteCmd::Record(symbol, record)) => {
                        buffer.push((symbol, record));
                        if buffer.len() >= config.flush_batch {
                            flush(&mut files, &mut buffer, &coalesce, &stats);
                        }
                    }
                    Some(WriteCmd::Flush(ack)) => {
                        flush(&mut files, &mut buffer, &coalesce, &stats);
                        let _ = ack.send(());
                    }
                    None => break,
                }
            }
            _ = interval.tick() => {
                flush(&mut files, &mut buffer, &coalesce, &stats);
            }
            _ = shutdown.cancelled() => {
                // Drain whatever is still queued, then flush once.
                while let Ok(cmd) = rx.try_recv() {
                    match cmd {
                        WriteCmd::Record(symbol, record) => buffer.push((symbol, record)),
                        WriteCmd::Flush(ack) => { let _ = ack.send(()); }
                    }
                }
                flush(&mut files, &mut buffer, &coalesce, &stats);
                info!("tick writer stopped");
                return;
            }
        }
    }

    flush(&mut files, &mut buffer, &coalesce, &stats);
    info!("tick writer channel closed");
}

fn flush(
    files: &mut FileSet,
    buffer: &mut Vec<(Symbol, TickRecord)>,
    coalesce: &DashMap<Symbol, TickRecord>,
    stats: &WriterStats,
) {
    // Coalesced leftovers join this flush; newest-per-symbol only.
    if !coalesce.is_empty() {
        let keys: Vec<Symbol> = coalesce.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((symbol, record)) = coalesce.remove(&key) {
                buffer.push((symbol, record));
            }
        }
    }
    if buffer.is_empty() {
        return;
    }

    let count = buffer.len() as u64;
    for (symbol, record) in buffer.drain(..) {
        if let Err(e) = files.write(&symbol, &record) {
            warn!(%symbol, ?e, "failed to write tick record");
        }
    }
    files.flush_open();
    stats.records_written.fetch_add(count, Ordering::Relaxed);
    STORE_FLUSHED_RECORDS.inc_by(count);
    debug!(records = count, "flushed tick batch");
}

/// UTC day string (YYYY-MM-DD) for an epoch-millisecond timestamp.
pub fn day_of(timestamp_ms: i64) -> String {
    DateTime::from_timestamp_millis(timestamp_ms)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "1970-01-01".to_string())
}

/// Path of a day-file segment. Segment 0 is `<SYMBOL>/<YYYY-MM-DD>.jsonl`,
/// later segments insert the index before the extension.
pub fn segment_path(dir: &Path, symbol: &Symbol, day: &str, seq: usize) -> PathBuf {
    let name = if seq == 0 {
        format!("{day}.jsonl")
    } else {
        format!("{day}.{seq}.jsonl")
    };
    dir.join(symbol.as_str()).join(name)
}

struct ActiveFile {
    writer: BufWriter<File>,
    records: usize,
    seq: usize,
}

/// Open day files keyed by (symbol, day).
struct FileSet {
    dir: PathBuf,
    max_records: usize,
    open: HashMap<(Symbol, String), ActiveFile>,
}

impl FileSet {
    fn new(dir: PathBuf, max_records: usize) -> Self {
        Self {
            dir,
            max_records: max_records.max(1),
            open: HashMap::new(),
        }
    }

    fn write(&mut self, symbol: &Symbol, record: &TickRecord) -> StoreResult<()> {
        let day = day_of(record.timestamp_ms);
        let key = (symbol.clone(), day.clone());

        if !self.open.contains_key(&key) {
            let file = self.open_latest_segment(symbol, &day)?;
            // A new day closes the previous day's handle for this symbol.
            self.open.retain(|(s, _), _| s != symbol);
            self.open.insert(key.clone(), file);
        }

        let active = self.open.get_mut(&key).expect("just inserted");
        if active.records >= self.max_records {
            active.writer.flush()?;
            let seq = active.seq + 1;
            *active = open_segment(&self.dir, symbol, &day, seq)?;
        }

        let line = serde_json::to_string(record)?;
        writeln!(active.writer, "{line}")?;
        active.records += 1;
        Ok(())
    }

    fn flush_open(&mut self) {
        for ((symbol, _), active) in self.open.iter_mut() {
            if let Err(e) = active.writer.flush() {
                warn!(%symbol, ?e, "failed to flush day file");
            }
        }
    }

    /// Resume the highest existing segment for a day, honoring the record
    /// cap across restarts.
    fn open_latest_segment(&self, symbol: &Symbol, day: &str) -> StoreResult<ActiveFile> {
        let mut seq = 0;
        while segment_path(&self.dir, symbol, day, seq + 1).exists() {
            seq += 1;
        }
        let path = segment_path(&self.dir, symbol, day, seq);
        let existing = if path.exists() { count_lines(&path)? } else { 0 };
        let mut active = open_segment(&self.dir, symbol, day, seq)?;
        active.records = existing;
        Ok(active)
    }
}

fn open_segment(dir: &Path, symbol: &Symbol, day: &str, seq: usize) -> StoreResult<ActiveFile> {
    let path = segment_path(dir, symbol, day, seq);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    debug!(path = %path.display(), "opened day file segment");
    Ok(ActiveFile {
        writer: BufWriter::new(file),
        records: 0,
        seq,
    })
}

fn count_lines(path: &Path) -> StoreResult<usize> {
    let reader = BufReader::new(File::open(path)?);
    Ok(reader.lines().count())
}
