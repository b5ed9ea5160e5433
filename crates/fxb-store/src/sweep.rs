//! Retention sweep for aged day files.

use crate::config::StoreConfig;
use chrono::{NaiveDate, Utc};
use fxb_telemetry::metrics::STORE_SWEPT_FILES;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Periodically remove day files older than the retention horizon.
pub async fn run_retention_sweep(config: StoreConfig, shutdown: CancellationToken) {
    let mut interval =
        tokio::time::interval(Duration::from_secs(config.sweep_interval_secs.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let cutoff = Utc::now().date_naive()
                    - chrono::Duration::days(config.retention_days as i64);
                let removed = sweep_once(&config.data_dir, cutoff);
                if removed > 0 {
                    info!(removed, %cutoff, "retention sweep removed day files");
                }
            }
            _ = shutdown.cancelled() => {
                info!("retention sweep stopped");
                return;
            }
        }
    }
}

/// Remove every day-file segment strictly older than `cutoff`.
/// Returns the number of files removed.
pub fn sweep_once(dir: &Path, cutoff: NaiveDate) -> usize {
    let mut removed = 0;
    let symbol_dirs = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return 0,
    };
    for symbol_dir in symbol_dirs.flatten() {
        let path = symbol_dir.path();
        if !path.is_dir() {
            continue;
        }
        let Ok(files) = std::fs::read_dir(&path) else {
            continue;
        };
        for file in files.flatten() {
            let file_path = file.path();
            let Some(name) = file_path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            // Segment names start with YYYY-MM-DD.
            let Some(day) = name.get(..10) else { continue };
            let Ok(date) = NaiveDate::parse_from_str(day, "%Y-%m-%d") else {
                continue;
            };
            if date < cutoff {
                match std::fs::remove_file(&file_path) {
                    Ok(()) => {
                        removed += 1;
                        STORE_SWEPT_FILES.inc();
                    }
                    Err(e) => warn!(path = %file_path.display(), ?e, "failed to sweep file"),
                }
            }
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(dir: &Path, symbol: &str, name: &str) {
        let p = dir.join(symbol);
        std::fs::create_dir_all(&p).unwrap();
        std::fs::write(p.join(name), "{}\n").unwrap();
    }

    #[test]
    fn removes_only_aged_files() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "EURUSD", "2023-01-01.jsonl");
        touch(dir.path(), "EURUSD", "2023-01-01.1.jsonl");
        touch(dir.path(), "EURUSD", "2024-06-01.jsonl");
        touch(dir.path(), "GBPUSD", "2023-02-15.jsonl");

        let cutoff = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let removed = sweep_once(dir.path(), cutoff);
        assert_eq!(removed, 3);
        assert!(dir.path().join("EURUSD/2024-06-01.jsonl").exists());
        assert!(!dir.path().join("EURUSD/2023-01-01.jsonl").exists());
        assert!(!dir.path().join("GBPUSD/2023-02-15.jsonl").exists());
    }

    #[test]
    fn missing_dir_is_noop() {
        let dir = TempDir::new().unwrap();
        let cutoff = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert_eq!(sweep_once(&dir.path().join("absent"), cutoff), 0);
    }
}
