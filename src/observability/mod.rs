//! Logging and metrics installation.
//!
//! The kernel only emits `tracing` events and `metrics` samples; embedding
//! applications decide whether to install a subscriber and recorder. These
//! helpers wire up the defaults.

mod logging;
mod metrics;

pub use logging::{DEFAULT_LOG_FILTER, LogFormat, LoggingConfig};
pub use self::metrics::{DEFAULT_METRICS_PORT, MetricsConfig, install_metrics};

use crate::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

static LOGGING_INIT: OnceLock<()> = OnceLock::new();

/// Installs the global `tracing` subscriber.
///
/// # Errors
///
/// Returns [`Error::Validation`] if logging was already initialized or the
/// filter is invalid, and [`Error::Storage`] if the log file cannot be opened.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    if LOGGING_INIT.get().is_some() {
        return Err(Error::Validation("logging already initialized".to_string()));
    }
    let filter = config.env_filter()?;

    match (&config.file, config.format) {
        (Some(path), LogFormat::Json) => {
            let writer = open_log_file(path)?;
            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(writer)
                        .with_current_span(true)
                        .with_span_list(true)
                        .with_target(true)
                        .with_thread_ids(true),
                )
                .with(filter)
                .try_init()
                .map_err(init_error)?;
        },
        (Some(path), LogFormat::Pretty) => {
            let writer = open_log_file(path)?;
            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false)
                        .with_target(true)
                        .with_thread_ids(true),
                )
                .with(filter)
                .try_init()
                .map_err(init_error)?;
        },
        (None, LogFormat::Json) => {
            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(io::stderr)
                        .with_current_span(true)
                        .with_span_list(true)
                        .with_target(true)
                        .with_thread_ids(true),
                )
                .with(filter)
                .try_init()
                .map_err(init_error)?;
        },
        (None, LogFormat::Pretty) => {
            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .pretty()
                        .with_writer(io::stderr)
                        .with_target(true)
                        .with_thread_names(true),
                )
                .with(filter)
                .try_init()
                .map_err(init_error)?;
        },
    }

    let _ = LOGGING_INIT.set(());
    tracing::debug!(format = ?config.format, "Logging initialized");
    Ok(())
}

/// Shared append-only log file.
#[derive(Clone)]
struct LogFileWriter {
    file: Arc<Mutex<File>>,
}

impl Write for LogFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file
            .lock()
            .map_err(|e| io::Error::other(e.to_string()))?
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file
            .lock()
            .map_err(|e| io::Error::other(e.to_string()))?
            .flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogFileWriter {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn open_log_file(path: &Path) -> Result<LogFileWriter> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(Error::storage("create_log_dir"))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(Error::storage("open_log_file"))?;
    Ok(LogFileWriter {
        file: Arc::new(Mutex::new(file)),
    })
}

#[allow(clippy::needless_pass_by_value)]
fn init_error(e: tracing_subscriber::util::TryInitError) -> Error {
    Error::Validation(format!("logging already initialized: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_writer_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("kernel.log");
        let mut writer = open_log_file(&path).unwrap();
        writer.write_all(b"one\n").unwrap();
        let mut second = open_log_file(&path).unwrap();
        second.write_all(b"two\n").unwrap();
        second.flush().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "one\ntwo\n");
    }

    #[test]
    fn test_invalid_filter_rejected_before_install() {
        let config = LoggingConfig::default().with_filter("swarmkernel=[");
        assert!(matches!(init_logging(&config), Err(Error::Validation(_))));
    }
}
