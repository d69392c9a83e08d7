//! # Local Logger
//!
//! Installs the process-wide `tracing` subscriber: a human-readable layer on
//! the TTY plus, when a log directory is configured, a JSON layer written to
//! a daily rolling file.
//!
//! `RUST_LOG` wins over the configured level when it is set, so operators can
//! turn up a single target (`RUST_LOG=lib_common::core=debug`) without
//! touching configuration.

use std::path::PathBuf;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// # Logger Local Options
///
/// Controls where and how log messages are written.
#[derive(Debug, Clone)]
pub struct LoggerLocalOptions {
    /// Default filter when `RUST_LOG` is unset (e.g. `info`, `debug`).
    pub level: String,
    /// Whether to print to the console.
    pub use_tty: bool,
    /// Directory for rolling JSON log files. `None` disables file output.
    pub log_dir: Option<PathBuf>,
    /// How many daily files to keep before the oldest is deleted.
    pub max_log_files: usize,
}

impl Default for LoggerLocalOptions {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            use_tty: true,
            log_dir: None,
            max_log_files: 7,
        }
    }
}

/// Installs the global subscriber for `app_name`.
///
/// The returned guard flushes the file writer on drop; keep it alive for the
/// life of the process.
pub fn setup_logging(app_name: &str, options: &LoggerLocalOptions) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&options.level))
        .with_context(|| format!("invalid log level `{}`", options.level))?;

    let tty_layer = options.use_tty.then(|| fmt::layer().with_target(true));

    let (file_layer, guard) = match &options.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("cannot create log directory {}", dir.display()))?;
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(app_name)
                .filename_suffix("log")
                .max_log_files(options.max_log_files)
                .build(dir)
                .context("cannot open rolling log file")?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tty_layer)
        .with(file_layer)
        .try_init()
        .context("a global tracing subscriber is already installed")?;

    tracing::info!(app = app_name, "logging initialised");
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_logging_creates_directory_and_file() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temporary directory");
        let log_dir = temp_dir.path().join("logs");
        let options = LoggerLocalOptions {
            level: "info".into(),
            use_tty: false,
            log_dir: Some(log_dir.clone()),
            max_log_files: 2,
        };

        let guard = setup_logging("test_app", &options).expect("logging setup");
        tracing::warn!(code = 101, "This is a warning message");
        drop(guard);

        let files: Vec<_> = std::fs::read_dir(&log_dir)
            .expect("Failed to read log directory")
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .collect();
        assert_eq!(files.len(), 1, "one daily file");

        let contents = std::fs::read_to_string(&files[0]).unwrap();
        assert!(contents.contains("This is a warning message"));
        assert!(contents.contains(r#""code":101"#));
    }
}
