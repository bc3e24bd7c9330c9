//! Structured logging for the applock CLI using tracing.
//!
//! Logs to `<root>/logs/applock.{date}.log` with daily rotation, keeping 7
//! days. Level is controlled via `RUST_LOG`. Falls back to stderr when the
//! log directory cannot be used; stdout is reserved for replay output.

use applock_core::StorageConfig;
use fs_err as fs;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs the global subscriber. Keep the returned guard alive until exit
/// so buffered lines are flushed.
pub fn init(storage: &StorageConfig) -> Option<WorkerGuard> {
    let logs_dir = storage.logs_dir();
    let _ = fs::create_dir_all(&logs_dir);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("applock=info,applock_core=info"));

    match create_file_appender(&logs_dir) {
        Ok(file_appender) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .with_writer(non_blocking)
                        .with_timer(fmt::time::UtcTime::rfc_3339())
                        .with_ansi(false),
                )
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_timer(fmt::time::UtcTime::rfc_3339())
                        .with_ansi(true),
                )
                .init();
            None
        }
    }
}

fn create_file_appender(
    logs_dir: &Path,
) -> Result<RollingFileAppender, tracing_appender::rolling::InitError> {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("applock")
        .filename_suffix("log")
        .max_log_files(7)
        .build(logs_dir)
}
