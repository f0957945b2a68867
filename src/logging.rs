//! `tracing` setup for the CLI.
//!
//! `RUST_LOG` wins over `[application] log_level`. Installing twice is a
//! no-op, so tests that call [`init`] do not fight over the global subscriber.
//!
//! ```no_run
//! use nomic_ops::{config::ObservingConfig, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ObservingConfig::load()?;
//! logging::init_from_config(&config)?;
//! tracing::info!(nod_throw = config.telescope.nod_throw, "configuration loaded");
//! # Ok(())
//! # }
//! ```

use crate::config::{LogFormat, ObservingConfig};
use crate::error::{AppResult, NomicError};
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

/// Subscriber settings.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Default level when `RUST_LOG` is unset.
    pub level: Level,
    /// Output format.
    pub format: LogFormat,
    /// Colors, pretty format only.
    pub ansi: bool,
    /// Source file and line on every event.
    pub source_location: bool,
}

impl LogOptions {
    /// Options with colors on and no source locations.
    pub fn new(level: Level, format: LogFormat) -> Self {
        Self {
            level,
            format,
            ansi: true,
            source_location: false,
        }
    }

    /// Options from the `[application]` section.
    pub fn from_config(config: &ObservingConfig) -> AppResult<Self> {
        let level = parse_log_level(&config.application.log_level)?;
        Ok(Self::new(level, config.application.log_format))
    }
}

/// Install the subscriber described by `[application]`.
pub fn init_from_config(config: &ObservingConfig) -> AppResult<()> {
    init(LogOptions::from_config(config)?)
}

/// Install the global subscriber unless one is installed already.
pub fn init(options: LogOptions) -> AppResult<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(options.level.as_str().to_lowercase()));

    let layer = match options.format {
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_ansi(options.ansi)
            .with_file(options.source_location)
            .with_line_number(options.source_location)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(false)
            .with_ansi(false)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_file(options.source_location)
            .with_line_number(options.source_location)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()
        .map_err(|e| NomicError::Configuration(format!("cannot install logger: {}", e)))
}

/// Case-insensitive `trace`..`error`.
pub fn parse_log_level(level: &str) -> AppResult<Level> {
    Level::from_str(level.trim()).map_err(|_| {
        NomicError::Configuration(format!(
            "log_level '{}' is not one of trace, debug, info, warn, error",
            level
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_levels_parse_case_insensitively() {
        assert_eq!(parse_log_level("trace").unwrap(), Level::TRACE);
        assert_eq!(parse_log_level("Debug").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level(" warn ").unwrap(), Level::WARN);
        assert!(parse_log_level("chatty").is_err());
    }

    #[test]
    fn options_follow_application_section() {
        let mut config = ObservingConfig::default();
        config.application.log_level = "debug".to_string();
        config.application.log_format = LogFormat::Json;
        let options = LogOptions::from_config(&config).unwrap();
        assert_eq!(options.level, Level::DEBUG);
        assert_eq!(options.format, LogFormat::Json);
        assert!(!options.source_location);
    }
}
