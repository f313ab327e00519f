//! Logging setup for applications embedding the phone core

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{PhoneError, PhoneResult};

/// Configuration for the logging system
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// The log level to use
    pub level: Level,
    /// Whether to enable JSON formatting
    pub json: bool,
    /// Whether to include file and line information
    pub file_info: bool,
    /// Whether to log span open/close
    pub log_spans: bool,
    /// Application name logged at startup
    pub app_name: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: Level::INFO,
            json: false,
            file_info: false,
            log_spans: false,
            app_name: "duplex".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn new(level: Level, app_name: impl Into<String>) -> Self {
        LoggingConfig {
            level,
            app_name: app_name.into(),
            ..Default::default()
        }
    }
}

/// Install a global fmt subscriber
///
/// `RUST_LOG` directives are honored on top of `config.level`. Fails
/// without panicking if a global subscriber is already installed.
pub fn setup_logging(config: LoggingConfig) -> PhoneResult<()> {
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
        .with_line_number(config.file_info);

    let installed = if config.json {
        subscriber.with_writer(std::io::stdout).json().try_init()
    } else {
        subscriber.try_init()
    };
    installed.map_err(|err| PhoneError::config(format!("failed to install subscriber: {}", err)))?;

    tracing::info!("Starting {} v{}", config.app_name, env!("CARGO_PKG_VERSION"));
    Ok(())
}

/// Parse a log level from a string
pub fn parse_log_level(level: &str) -> PhoneResult<Level> {
    Level::from_str(level).map_err(|_| PhoneError::config(format!("Invalid log level: {}", level)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_levels() {
        assert_eq!(parse_log_level("debug").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level("WARN").unwrap(), Level::WARN);
        assert!(matches!(
            parse_log_level("loud"),
            Err(PhoneError::Configuration { .. })
        ));
    }

    #[test]
    #[serial_test::serial]
    fn second_install_fails_without_panicking() {
        let _ = setup_logging(LoggingConfig::default());
        let err = setup_logging(LoggingConfig::default()).unwrap_err();
        assert!(matches!(err, PhoneError::Configuration { .. }));
    }

    #[test]
    fn new_keeps_plain_output() {
        let config = LoggingConfig::new(Level::DEBUG, "test");
        assert_eq!(config.level, Level::DEBUG);
        assert!(!config.json && !config.file_info && !config.log_spans);
        assert_eq!(config.app_name, "test");
    }
}
