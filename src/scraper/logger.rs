//! Structured logging for the image scraper
//!
//! Terminal output always goes through a `fmt` layer on stderr, written around any active
//! progress bar. When enabled in the config, every event is also written to a daily rolling
//! file in line or JSON format.

use std::path::Path;

use thiserror::Error;
use tracing::info;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::scraper::AppConfig;
use crate::scraper::tui::BarAwareStderr;

/// Error types for logging
#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Logging error: {0}")]
    Logging(String),
}

/// Result type for logging operations
pub type LoggerResult<T> = Result<T, LoggerError>;

/// Keeps the non-blocking file writer alive for the lifetime of the program.
pub struct Logger {
    _guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

impl Logger {
    /// Installs the global subscriber described by `config.logging`.
    pub fn new(config: &AppConfig) -> LoggerResult<Self> {
        let logging = &config.logging;

        // RUST_LOG wins over the configured level
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&logging.log_level))
            .map_err(|e| LoggerError::Logging(e.to_string()))?;

        let terminal = fmt::layer().with_target(false).with_writer(BarAwareStderr);

        let (file_layer, guard) = if logging.log_to_file {
            let log_dir = config
                .log_directory()
                .map_err(|e| LoggerError::Config(e.to_string()))?;
            let (layer, guard) = Self::file_layer(&log_dir, &logging.log_format)?;
            (Some(layer), Some(guard))
        } else {
            (None, None)
        };

        tracing_subscriber::registry()
            .with(filter)
            .with(terminal)
            .with(file_layer)
            .try_init()
            .map_err(|e| LoggerError::Logging(e.to_string()))?;

        info!(
            log_format = %logging.log_format,
            log_level = %logging.log_level,
            log_to_file = logging.log_to_file,
            "Logger initialized"
        );

        Ok(Self { _guard: guard })
    }

    fn file_layer<S>(
        log_dir: &Path,
        format: &str,
    ) -> LoggerResult<(
        Box<dyn tracing_subscriber::Layer<S> + Send + Sync>,
        tracing_appender::non_blocking::WorkerGuard,
    )>
    where
        S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    {
        if !log_dir.exists() {
            std::fs::create_dir_all(log_dir)?;
        }

        let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, "image_scraper.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let layer = match format {
            "json" => fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_ansi(false)
                .boxed(),
            _ => fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .boxed(),
        };

        Ok((layer, guard))
    }
}

/// Installs the global subscriber and returns the guard holder.
pub fn init_logger(config: &AppConfig) -> LoggerResult<Logger> {
    Logger::new(config)
}
