//! Logging setup and about-info.
//!
//! Structured logging to console plus a daily-rolling file in the data
//! directory, with pruning of old log files. Library users may install
//! their own subscriber instead; the CLI calls [`init_logging`].

use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

/// Log directory under the data dir.
pub fn log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

/// Returns version, build timestamp, git SHA, and platform info.
pub fn about() -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "buildTimestamp": env!("BUILD_TIMESTAMP"),
        "gitSha": env!("BUILD_GIT_SHA"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
    })
}

/// Delete the oldest log files beyond [`MAX_LOG_FILES`].
pub fn prune_old_logs(log_dir: &Path) {
    let Ok(entries) = fs::read_dir(log_dir) else {
        return;
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    if files.len() <= MAX_LOG_FILES {
        return;
    }
    // Names embed the date, so lexicographic order is chronological.
    files.sort();
    let excess = files.len() - MAX_LOG_FILES;
    for path in files.into_iter().take(excess) {
        let _ = fs::remove_file(&path);
    }
}

/// Initialize structured logging (console + rolling file).
///
/// Returns the appender guard; dropping it flushes buffered log lines, so
/// hold it for the lifetime of the process.
pub fn init_logging(data_dir: &Path) -> tracing_appender::non_blocking::WorkerGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tableside=debug"));

    let dir = log_dir(data_dir);
    prune_old_logs(&dir);
    fs::create_dir_all(&dir).ok();

    let file_appender = tracing_appender::rolling::daily(&dir, "tableside");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("Tableside client v{}", env!("CARGO_PKG_VERSION"));
    guard
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    // Installs the process-global tracing subscriber; keep serial so no
    // other test races the global registry.
    #[test]
    #[serial]
    fn test_init_logging_creates_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let _guard = init_logging(dir.path());
        assert!(log_dir(dir.path()).is_dir());
        info!("logging smoke line");
    }

    #[test]
    fn test_about_has_version() {
        let about = about();
        assert_eq!(about["version"], env!("CARGO_PKG_VERSION"));
        assert!(about["platform"].as_str().is_some());
    }

    #[test]
    fn test_prune_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..(MAX_LOG_FILES + 4) {
            fs::write(dir.path().join(format!("tableside.2026-07-{:02}", i + 1)), b"x").unwrap();
        }
        prune_old_logs(dir.path());
        let remaining = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(remaining, MAX_LOG_FILES);
        // Oldest were removed
        assert!(!dir.path().join("tableside.2026-07-01").exists());
        assert!(dir.path().join(format!("tableside.2026-07-{:02}", MAX_LOG_FILES + 4)).exists());
    }
}
