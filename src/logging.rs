//! Tracing subscriber installation for the binary.

use std::fs::File;
use std::io;
use std::sync::Mutex;

use camino::Utf8Path;
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Errors raised while installing the global subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    /// Raised when neither `RUST_LOG` nor the configured level parse.
    #[error("invalid log filter {filter:?}: {message}")]
    Filter {
        /// Filter directive that failed to parse.
        filter: String,
        /// Parser message.
        message: String,
    },
    /// Raised when the log file cannot be created or truncated.
    #[error("failed to open log file {path}: {source}")]
    File {
        /// Log file path.
        path: String,
        /// Underlying IO error.
        source: io::Error,
    },
    /// Raised when a global subscriber is already installed.
    #[error("failed to install tracing subscriber: {0}")]
    Install(String),
}

/// Installs a stderr `fmt` layer and, when `log_file` is set, a second
/// plain-text layer writing to that file. The file only keeps the current
/// run.
///
/// `RUST_LOG` takes precedence over `level`.
///
/// # Errors
///
/// Returns [`LoggingError`] when the filter is invalid, the file cannot be
/// opened, or a subscriber is already installed.
pub fn init_logging(level: &str, log_file: Option<&Utf8Path>) -> Result<(), LoggingError> {
    let filter = build_filter(level)?;

    let file_layer = match log_file {
        Some(path) => {
            let file = open_log_file(path)?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(io::stderr))
        .with(file_layer)
        .try_init()
        .map_err(|err| LoggingError::Install(err.to_string()))
}

fn open_log_file(path: &Utf8Path) -> Result<File, LoggingError> {
    File::create(path).map_err(|source| LoggingError::File {
        path: path.to_string(),
        source,
    })
}

fn build_filter(level: &str) -> Result<EnvFilter, LoggingError> {
    EnvFilter::try_from_default_env().or_else(|_| {
        EnvFilter::try_new(level).map_err(|err| LoggingError::Filter {
            filter: level.to_owned(),
            message: err.to_string(),
        })
    })
}
