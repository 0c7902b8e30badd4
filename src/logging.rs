//! Log sink for embedders.
//!
//! The library itself only emits `tracing` events and spans (one
//! `picture_bank` span per bank). [`init`] installs a subscriber for
//! programs that don't bring their own: journald on Linux when the journal
//! socket is reachable, otherwise a daily rolling file.

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the filter directives, e.g.
/// `PICBANK_LOG=picbank=debug,tantivy=warn`.
pub const LOG_ENV: &str = "PICBANK_LOG";

const DEFAULT_DIRECTIVES: &str = "info";
const LOG_FILE_PREFIX: &str = "picbank.log";

/// Keeps the file writer flushing until the process exits.
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Where [`init`] ended up sending events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSink {
    Journald,
    File(PathBuf),
}

fn filter_from(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_DIRECTIVES))
}

/// Default directory for log files when none is given.
pub fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("picbank")
        .join("logs")
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init(log_dir: Option<PathBuf>) -> Result<LogSink> {
    let directives = std::env::var(LOG_ENV).ok();
    let filter = filter_from(directives.as_deref());

    #[cfg(target_os = "linux")]
    {
        if let Ok(journald) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(filter)
                .with(journald)
                .try_init()?;
            tracing::info!("Logging to journald");
            return Ok(LogSink::Journald);
        }
    }

    let log_dir = log_dir.unwrap_or_else(default_log_dir);
    init_file(&log_dir, filter)?;
    Ok(LogSink::File(log_dir))
}

fn init_file(log_dir: &Path, filter: EnvFilter) -> Result<()> {
    std::fs::create_dir_all(log_dir)?;

    let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .try_init()?;

    let _ = FILE_GUARD.set(guard);
    tracing::info!(dir = %log_dir.display(), "Logging to rolling file");
    Ok(())
}
