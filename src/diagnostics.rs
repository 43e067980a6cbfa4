//! Tracing subscriber setup: a daily rolling file layer plus stdout, both
//! through an `EnvFilter`, mirroring how the rest of the corpus wires
//! `tracing-subscriber` for a long-running service.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const MAX_LOG_AGE: Duration = Duration::from_secs(60 * 60 * 24 * 3);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Holds the non-blocking writer's background flush thread alive; drop it
/// only on process shutdown.
#[allow(dead_code)]
pub struct LoggerGuard(WorkerGuard);

/// Install the global tracing subscriber. `log_dir` receives `prefix.<date>.log`
/// files; `level` is the default directive, overridable per-module via
/// `RUST_LOG`.
pub fn init_tracing(log_dir: impl AsRef<Path>, prefix: &str, level: &str) -> LoggerGuard {
    let log_dir = log_dir.as_ref().to_path_buf();
    let level = normalize_level(level);

    let builder = EnvFilter::builder().with_default_directive(level.parse().unwrap());
    let env = std::env::var("RUST_LOG").unwrap_or_default();
    let console_filter = builder.clone().parse_lossy(&env);
    let file_filter = builder.parse_lossy(&env);

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .filename_suffix("log")
        .build(&log_dir)
        .expect("failed to create log file appender");
    let (non_blocking, guard) = NonBlocking::new(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_filter(file_filter);
    let stdout_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(true)
        .with_filter(console_filter);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stdout_layer)
        .init();

    spawn_log_cleanup(log_dir, prefix.to_string());

    LoggerGuard(guard)
}

fn normalize_level(level: &str) -> &str {
    match level {
        "trace" | "debug" | "info" | "warn" | "error" => level,
        _ => {
            tracing::warn!(requested = %level, "unknown log level, defaulting to info");
            "info"
        }
    }
}

fn spawn_log_cleanup(log_dir: PathBuf, prefix: String) {
    tokio::spawn(async move {
        loop {
            if let Err(err) = remove_old_logs(&log_dir, &prefix, MAX_LOG_AGE) {
                tracing::warn!("failed to clean up old log files: {err}");
            }
            tokio::time::sleep(CLEANUP_INTERVAL).await;
        }
    });
}

fn remove_old_logs(log_dir: &Path, prefix: &str, max_age: Duration) -> std::io::Result<()> {
    let now = SystemTime::now();
    for entry in fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
        if !name.starts_with(prefix) || !name.ends_with(".log") {
            continue;
        }
        let metadata = fs::metadata(&path)?;
        if let Ok(modified) = metadata.modified() {
            if now.duration_since(modified).unwrap_or_default() > max_age {
                fs::remove_file(&path)?;
                tracing::info!(file = %name, "removed stale gateway log file");
            }
        }
    }
    Ok(())
}
