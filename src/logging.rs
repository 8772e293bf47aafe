use std::env;
use std::path::{Path, PathBuf};

use sync_shutter::AppConfig;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_LOG_NAME: &str = "sync-shutter.log";

/// Console plus file logging. Device workers run on threads named `cam-<id>`,
/// so both layers print thread names to keep interleaved cameras apart.
///
/// Keep the returned guard alive until exit or buffered file lines are lost.
pub fn init_logger(config: &AppConfig) -> WorkerGuard {
    let filter = env::var("TRACING_LEVEL").unwrap_or_else(|_| "info".to_string());
    let log_file = env::var("LOG_FILE_PATH").unwrap_or_else(|_| config.log_file.clone());
    let (dir, file_name) = split_log_path(&log_file);

    let file_appender = tracing_appender::rolling::never(&dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stdout)
                .compact()
                .with_target(false)
                .with_thread_names(true)
                .without_time()
                .with_ansi(true),
        )
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_thread_names(true)
                .with_ansi(false),
        )
        .with(EnvFilter::new(filter))
        .init();

    info!("Logging to stdout and {}", dir.join(file_name).display());

    guard
}

/// Splits a log path into the directory the appender creates and the file
/// name inside it. A path without a file name gets the default one.
fn split_log_path(path: &str) -> (PathBuf, &str) {
    let path = Path::new(path);
    let dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(DEFAULT_LOG_NAME);
    (dir, file_name)
}
