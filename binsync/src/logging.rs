//! Logging infrastructure.
//!
//! Structured logging through `tracing`, with dual output: a non-blocking
//! file writer plus stdout for interactive tailing. Filtering is driven by
//! `RUST_LOG`, defaulting to `info`.

use std::fs;
use std::io;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Guard that must be kept alive for the duration of logging.
///
/// Dropping it flushes and closes the log file writer.
pub struct LoggingGuard {
    _file_guard: WorkerGuard,
}

/// Initializes the global logging subscriber.
///
/// Creates the log directory when needed and truncates the previous log
/// file, so every worker session starts from a clean log.
///
/// # Errors
///
/// Returns an error when the directory cannot be created or the log file
/// cannot be truncated.
pub fn init_logging(log_dir: &str, log_file: &str) -> Result<LoggingGuard, io::Error> {
    fs::create_dir_all(log_dir)?;
    let log_path = Path::new(log_dir).join(log_file);
    fs::write(&log_path, "")?;

    let file_appender = tracing_appender::rolling::never(log_dir, log_file);
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false);

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_ansi(true);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

/// Default log directory.
pub fn default_log_dir() -> &'static str {
    "logs"
}

/// Default log file name.
pub fn default_log_file() -> &'static str {
    "binsync.log"
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_paths() {
        assert_eq!(default_log_dir(), "logs");
        assert_eq!(default_log_file(), "binsync.log");
    }

    #[test]
    fn log_file_is_truncated_on_setup() {
        // init_logging installs a global subscriber and can only run once
        // per process, so only the file handling is exercised here.
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("binsync.log");
        fs::write(&path, "old session").unwrap();

        fs::create_dir_all(dir.path()).unwrap();
        fs::write(&path, "").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "");
    }
}
