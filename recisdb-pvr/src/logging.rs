//! Logging with console and rolling file output.
//!
//! Application code logs through the `log` macros; `tracing-log` bridges
//! them into the `tracing` subscriber configured here. Log files rotate
//! daily and files older than the retention period are removed at startup.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use chrono::Local;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingSettings;

/// Base name of the rolling log file.
const LOG_FILE_NAME: &str = "recisdb-pvr.log";

/// Initialize console and file logging.
///
/// `RUST_LOG` overrides the configured level. `verbose` selects `debug`
/// when neither is set.
pub fn init_logging(settings: &LoggingSettings) -> Result<(), Box<dyn std::error::Error>> {
    fs::create_dir_all(&settings.log_dir)?;
    clean_old_logs(&settings.log_dir, settings.retention_days)?;

    let file_appender = tracing_appender::rolling::daily(&settings.log_dir, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer guard alive for the program lifetime
    let _ = Box::leak(Box::new(Arc::new(guard)));

    let default_level = match (settings.verbose, settings.level.as_deref()) {
        (true, _) => "debug",
        (false, Some(level)) => level,
        (false, None) => "info",
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(io::stdout)
                .with_target(true)
                .with_level(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_timer(LocalTimeTimer),
        )
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_target(true)
                .with_level(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(false)
                .with_timer(LocalTimeTimer),
        );

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| format!("Failed to set default subscriber: {}", e))?;

    tracing_log::LogTracer::init().map_err(|e| format!("Failed to initialize LogTracer: {}", e))?;

    Ok(())
}

/// Remove log files last modified more than `retention_days` ago.
/// Returns the number of files removed.
fn clean_old_logs(log_dir: &Path, retention_days: u64) -> io::Result<usize> {
    if !log_dir.exists() {
        return Ok(0);
    }

    let cutoff = Local::now() - chrono::Duration::days(retention_days as i64);
    let mut removed = 0;

    for entry in fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();
        let is_log = path
            .file_name()
            .and_then(|name| name.to_str())
            .map_or(false, |name| name.starts_with(LOG_FILE_NAME));
        if !path.is_file() || !is_log {
            continue;
        }

        let modified = match entry.metadata().and_then(|m| m.modified()) {
            Ok(modified) => chrono::DateTime::<Local>::from(modified),
            Err(_) => continue,
        };
        if modified < cutoff {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                // The subscriber is not installed yet.
                Err(e) => eprintln!("Failed to remove old log file {:?}: {}", path, e),
            }
        }
    }

    Ok(removed)
}

/// Local-time timestamps for log lines.
#[derive(Debug, Clone, Copy)]
struct LocalTimeTimer;

impl fmt::time::FormatTime for LocalTimeTimer {
    fn format_time(&self, w: &mut fmt::format::Writer) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.6f"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_old_logs_only_touches_log_files() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join(format!("{}.2024-01-01", LOG_FILE_NAME));
        let other = dir.path().join("reserves.json");
        fs::write(&log, b"old").unwrap();
        fs::write(&other, b"[]").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));

        assert_eq!(clean_old_logs(dir.path(), 7).unwrap(), 0);
        assert!(log.exists());

        assert_eq!(clean_old_logs(dir.path(), 0).unwrap(), 1);
        assert!(!log.exists());
        assert!(other.exists());
    }

    #[test]
    fn test_clean_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(clean_old_logs(&dir.path().join("none"), 7).unwrap(), 0);
    }
}
