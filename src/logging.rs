//! Logging setup for the launcher and the inline worker.
//!
//! With a log file, events are written as JSON lines (one object per event,
//! readable with `hl`); without one they go to stderr in the human format.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::path::Path;
use tracing::Dispatch;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::options::LogLevel;

/// Opens `path` for appending, creating it and its directory if needed.
pub fn open_append(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path.display()))
}

/// Initialize logging for an inline worker run.
/// `RUST_LOG` overrides `level`. Returns a guard that must be held for the
/// duration of the program when logging to a file.
pub fn init_worker_logging(
    level: LogLevel,
    logfile: Option<&Path>,
    no_color: bool,
) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.directive()));

    let (file_layer, guard) = match logfile {
        Some(path) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(open_append(path)?);
            let layer = fmt::layer()
                .json()
                .with_file(true)
                .with_line_number(true)
                .with_target(true)
                .with_writer(non_blocking);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let stderr_layer = logfile.is_none().then(|| {
        fmt::layer()
            .with_target(true)
            .with_ansi(!no_color)
            .with_writer(std::io::stderr)
    });

    if tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .is_err()
    {
        tracing::debug!("Log subscriber already installed");
    }

    Ok(guard)
}

/// Minimal ERROR-level sink for reporting a failed detach, writing to the
/// log file or to stderr when it cannot be opened. Installed with
/// `tracing::dispatcher::with_default` so it applies only to the report.
pub fn failure_dispatch(logfile: Option<&Path>) -> (Dispatch, Option<WorkerGuard>) {
    let env_filter = EnvFilter::new("error");

    match logfile.map(open_append) {
        Some(Ok(file)) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(file);
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_ansi(false).with_writer(non_blocking));
            (Dispatch::new(subscriber), Some(guard))
        }
        _ => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr));
            (Dispatch::new(subscriber), None)
        }
    }
}
