//! Logging setup: console output plus optional daily-rolling file output,
//! both with local-timezone timestamps, and a background task that deletes
//! log files past the retention window.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Local;
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const DEFAULT_LOG_FILTER: &str = "mux_server=info,mux_core=info";
const LOG_RETENTION_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

/// Initializes the global subscriber. Returns a `WorkerGuard` that must be
/// held for the process lifetime when file logging is enabled, flushing
/// buffered lines on drop.
pub fn init(log_dir: Option<&str>) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_ansi(true)
        .with_timer(LocalTimer);

    match log_dir {
        Some(dir) => {
            let path = PathBuf::from(dir);
            if let Err(e) = std::fs::create_dir_all(&path) {
                eprintln!("failed to create log directory {}: {e}", path.display());
            }
            let appender = tracing_appender::rolling::daily(&path, "mux-server.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_timer(LocalTimer);

            tracing_subscriber::registry()
                .with(filter)
                .with(console_layer)
                .with(file_layer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(console_layer)
                .init();
            None
        }
    }
}

/// Spawns a daily task that deletes `mux-server.log.YYYY-MM-DD` files older
/// than the retention window. No-op if `log_dir` is `None`.
pub fn spawn_retention_cleanup(log_dir: Option<String>, cancel: CancellationToken) {
    let Some(log_dir) = log_dir else { return };
    tokio::spawn(async move {
        let interval = Duration::from_secs(24 * 60 * 60);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = cleanup_old_logs(Path::new(&log_dir), LOG_RETENTION_DAYS).await {
                        tracing::warn!(error = %e, "failed to clean up old logs");
                    }
                }
            }
        }
    });
}

async fn cleanup_old_logs(log_dir: &Path, retention_days: i64) -> std::io::Result<()> {
    let cutoff = chrono::Utc::now() - chrono::Duration::days(retention_days);
    let mut entries = tokio::fs::read_dir(log_dir).await?;
    let mut deleted = 0;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(date_str) = name.strip_prefix("mux-server.log.") else {
            continue;
        };
        let Ok(file_date) = chrono::NaiveDate::parse_from_str(date_str, "%Y-%m-%d") else {
            continue;
        };
        let file_ts = file_date
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp())
            .unwrap_or(0);
        if file_ts < cutoff.timestamp() {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => deleted += 1,
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to delete old log"),
            }
        }
    }

    if deleted > 0 {
        tracing::info!(count = deleted, "cleaned up old log files");
    }
    Ok(())
}
