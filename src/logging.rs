//! Tracing subscriber setup.

use serde::Deserialize;
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Console,
    Json,
}

/// `[log]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// An [`EnvFilter`] directive, e.g. `info` or `perfflux=debug,reqwest=warn`.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: LogFormat::Console }
    }
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Invalid log filter; err={0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),
    #[error("Install subscriber; err={0}")]
    Install(#[from] TryInitError),
}

/// Installs the global subscriber.
///
/// `RUST_LOG` wins over `override_level`, which wins over the config.
///
/// # Errors
///
/// Errors on an invalid filter directive or if a subscriber is already set.
pub fn init(config: &LogConfig, override_level: Option<&str>) -> Result<(), LoggingError> {
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) => EnvFilter::try_new(directives)?,
        Err(_) => EnvFilter::try_new(override_level.unwrap_or(&config.level))?,
    };

    let (console, json) = match config.format {
        LogFormat::Console => (Some(fmt::layer().with_target(true)), None),
        LogFormat::Json => (None, Some(fmt::layer().json().with_current_span(false))),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(json)
        .try_init()?;

    Ok(())
}
