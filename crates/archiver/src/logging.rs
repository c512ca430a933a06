//! Tracing subscriber setup

use crate::config::LoggingConfig;
use crate::ArchiverError;
use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, Layer, Registry};

/// Parses the configured level.  `quiet` caps it at `warn`.
pub fn max_level(config: &LoggingConfig, quiet: bool) -> Result<Level, ArchiverError> {
    let level: Level = config
        .level
        .parse()
        .map_err(|_| ArchiverError::Logging(format!("Unknown log level \"{}\"", config.level)))?;
    Ok(if quiet { level.min(Level::WARN) } else { level })
}

/// Installs the global fmt subscriber.
pub fn init_logging(config: &LoggingConfig, quiet: bool) -> Result<(), ArchiverError> {
    let level = max_level(config, quiet)?;
    let layer: Box<dyn Layer<Registry> + Send + Sync> = match (config.json, config.timestamps) {
        (true, true) => fmt::layer().json().with_target(true).boxed(),
        (true, false) => fmt::layer().json().with_target(true).without_time().boxed(),
        (false, true) => fmt::layer().with_target(true).boxed(),
        (false, false) => fmt::layer().with_target(true).without_time().boxed(),
    };
    tracing_subscriber::registry()
        .with(layer.with_filter(LevelFilter::from_level(level)))
        .try_init()
        .map_err(|err| ArchiverError::Logging(err.to_string()))
}
