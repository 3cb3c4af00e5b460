//! Logging setup
//!
//! All diagnostics of this crate go through `tracing`. Applications that do not
//! install their own subscriber can use [`setup_logging`].

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::Error;
use crate::Result;

/// Configuration for the logging system
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// The log level to use
    pub level: Level,
    /// Whether to include file and line information
    pub file_info: bool,
    /// Whether to log span enter/exit
    pub log_spans: bool,
    /// Whether to include the thread name of the emitting task
    pub thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: Level::INFO,
            file_info: false,
            log_spans: false,
            thread_names: false,
        }
    }
}

impl LoggingConfig {
    /// Create a new logging configuration
    pub fn new(level: Level) -> Self {
        LoggingConfig {
            level,
            ..Default::default()
        }
    }

    /// Enable file and line information in logs
    pub fn with_file_info(mut self) -> Self {
        self.file_info = true;
        self
    }

    /// Enable span logging
    pub fn with_spans(mut self) -> Self {
        self.log_spans = true;
        self
    }

    /// Include thread names
    pub fn with_thread_names(mut self) -> Self {
        self.thread_names = true;
        self
    }
}

/// Install a `fmt` subscriber with an environment filter
///
/// `RUST_LOG` directives are honoured on top of the configured level. Returns
/// `Ok(false)` when a global subscriber was already installed, which keeps
/// repeated calls from tests harmless.
pub fn setup_logging(config: LoggingConfig) -> Result<bool> {
    let filter = EnvFilter::from_default_env().add_directive(config.level.into());

    let span_events = if config.log_spans {
        FmtSpan::ACTIVE
    } else {
        FmtSpan::NONE
    };

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_span_events(span_events)
        .with_file(config.file_info)
        .with_line_number(config.file_info)
        .with_thread_names(config.thread_names);

    Ok(subscriber.try_init().is_ok())
}

/// Parse a log level from a string
pub fn parse_log_level(level: &str) -> Result<Level> {
    Level::from_str(level).map_err(|_| Error::ConfigError(format!("Invalid log level: {}", level)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("debug").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level("WARN").unwrap(), Level::WARN);
        assert!(parse_log_level("loud").is_err());
    }

    #[test]
    fn test_setup_logging_is_repeatable() {
        let _ = setup_logging(LoggingConfig::new(Level::DEBUG).with_file_info());
        // A second installation must not fail
        assert!(setup_logging(LoggingConfig::default()).is_ok());
    }
}
