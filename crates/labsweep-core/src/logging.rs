//! Logging setup: process-wide console output plus a log file per run.

use std::fs::OpenOptions;
use std::path::Path;

use tracing::subscriber::DefaultGuard;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::Result;

/// Initialize console logging on stderr. Default level is INFO, overridable with RUST_LOG.
pub fn init() {
    init_with_level("info")
}

pub fn init_with_level(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .try_init();
}

/// Keeps a run's log file attached to the current thread. Dropping it detaches
/// the file and flushes pending lines.
pub struct RunLog {
    _subscriber: DefaultGuard,
    _writer: WorkerGuard,
}

/// Mirror every INFO+ event emitted on this thread into `path` until the
/// returned guard is dropped. Console output continues as before.
pub fn open_run_log(path: &Path) -> Result<RunLog> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let (writer, worker) = tracing_appender::non_blocking(file);

    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(false)
        .with_filter(LevelFilter::INFO);
    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));

    let subscriber = tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer);
    Ok(RunLog {
        _subscriber: tracing::subscriber::set_default(subscriber),
        _writer: worker,
    })
}
