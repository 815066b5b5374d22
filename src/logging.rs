//! Structured logging: stderr console plus a daily rolling file. Stdout
//! stays free for command output.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_FILTER: &str = "info,pos_sync=debug";
const LOG_FILE_PREFIX: &str = "sync";
/// Daily log files kept on disk.
const MAX_LOG_FILES: usize = 14;

/// Install the global subscriber. Keep the returned guard alive for the
/// life of the process; dropping it flushes the file writer.
pub fn init(log_dir: &Path, json: bool) -> WorkerGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    if let Err(e) = fs::create_dir_all(log_dir) {
        eprintln!("Failed to create log dir {}: {e}", log_dir.display());
    }

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let (console_layer, file_layer) = if json {
        (
            fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_target(true)
                .boxed(),
            fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true)
                .boxed(),
        )
    } else {
        (
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .boxed(),
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true)
                .boxed(),
        )
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    let pruned = prune_old_logs(log_dir, MAX_LOG_FILES);
    if pruned > 0 {
        tracing::debug!(pruned, "Pruned old log files");
    }
    guard
}

/// Remove all but the `keep` newest log files. Returns how many were removed.
pub fn prune_old_logs(log_dir: &Path, keep: usize) -> usize {
    let Ok(entries) = fs::read_dir(log_dir) else {
        return 0;
    };

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = entries
        .flatten()
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX))
        })
        .filter_map(|entry| {
            let meta = entry.metadata().ok()?;
            meta.is_file().then(|| {
                (
                    entry.path(),
                    meta.modified().unwrap_or(std::time::UNIX_EPOCH),
                )
            })
        })
        .collect();

    // Newest first.
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    let mut removed = 0;
    for (path, _) in log_files.iter().skip(keep) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to prune log file {}: {e}", path.display()),
        }
    }
    removed
}
