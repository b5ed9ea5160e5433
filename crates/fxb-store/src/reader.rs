//! Day-file reader, tolerant of corrupt tails.

use crate::error::StoreResult;
use crate::record::TickRecord;
use crate::writer::segment_path;
use fxb_core::Symbol;
use fxb_telemetry::metrics::STORE_CORRUPT_TAIL_TOTAL;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::warn;

/// Read every record of a (symbol, UTC day), across rotated segments,
/// ordered as written (non-decreasing timestamps).
///
/// A line that fails to parse is treated as a crash-truncated tail:
/// reading stops at the last complete record and a counter is incremented.
pub fn read_day(dir: &Path, symbol: &Symbol, day: &str) -> StoreResult<Vec<TickRecord>> {
    let mut records = Vec::new();
    let mut seq = 0;
    loop {
        let path = segment_path(dir, symbol, day, seq);
        if !path.exists() {
            break;
        }
        let reader = BufReader::new(File::open(&path)?);
        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<TickRecord>(&line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    STORE_CORRUPT_TAIL_TOTAL.inc();
                    warn!(
                        path = %path.display(),
                        ?e,
                        "corrupt record, stopping at last complete one"
                    );
                    return Ok(records);
                }
            }
        }
        seq += 1;
    }
    Ok(records)
}

/// Latest timestamp present on disk for a (symbol, day), None when absent.
pub fn last_timestamp(dir: &Path, symbol: &Symbol, day: &str) -> StoreResult<Option<i64>> {
    Ok(read_day(dir, symbol, day)?.last().map(|r| r.timestamp_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fxb_core::{Price, Tick};
    use rust_decimal_macros::dec;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_lines(path: &Path, lines: &[String]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut f = File::create(path).unwrap();
        for line in lines {
            writeln!(f, "{line}").unwrap();
        }
    }

    fn record_line(ts: i64) -> String {
        let rec = TickRecord::from_tick(&Tick::new(
            "EURUSD",
            Price::new(dec!(1.0850)),
            Price::new(dec!(1.0851)),
            ts,
            "LP1",
        ));
        serde_json::to_string(&rec).unwrap()
    }

    #[test]
    fn reads_across_segments() {
        let dir = TempDir::new().unwrap();
        let symbol = Symbol::new("EURUSD");
        write_lines(
            &segment_path(dir.path(), &symbol, "2024-01-20", 0),
            &[record_line(1), record_line(2)],
        );
        write_lines(
            &segment_path(dir.path(), &symbol, "2024-01-20", 1),
            &[record_line(3)],
        );

        let records = read_day(dir.path(), &symbol, "2024-01-20").unwrap();
        assert_eq!(
            records.iter().map(|r| r.timestamp_ms).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(
            last_timestamp(dir.path(), &symbol, "2024-01-20").unwrap(),
            Some(3)
        );
    }

    #[test]
    fn stops_at_corrupt_tail() {
        let dir = TempDir::new().unwrap();
        let symbol = Symbol::new("EURUSD");
        write_lines(
            &segment_path(dir.path(), &symbol, "2024-01-20", 0),
            &[
                record_line(1),
                record_line(2),
                r#"{"timestamp_ms":3,"bid":"1.08"#.to_string(),
            ],
        );

        let records = read_day(dir.path(), &symbol, "2024-01-20").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records.last().unwrap().timestamp_ms, 2);
    }

    #[test]
    fn missing_day_is_empty() {
        let dir = TempDir::new().unwrap();
        let symbol = Symbol::new("EURUSD");
        assert!(read_day(dir.path(), &symbol, "2024-01-20")
            .unwrap()
            .is_empty());
    }
}
