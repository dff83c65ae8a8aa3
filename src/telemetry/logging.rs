use tracing::Level;
use tracing_subscriber::{
    fmt,
    EnvFilter, Registry,
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::config::TelemetryConfig;
use crate::error::Error;
use crate::types::Result;

/// Parse a configured log level, defaulting to INFO
fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Initialize the logging system.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_logging(config: &TelemetryConfig) -> Result<()> {
    let level = parse_level(&config.log_level);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let registry = Registry::default().with(filter);

    let result = if config.structured_logging {
        registry
            .with(fmt::layer().with_target(true).json())
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .try_init()
    };

    result.map_err(|e| Error::Internal(format!("Failed to set global default subscriber: {}", e)))
}

/// Create a test logging subscriber
#[cfg(test)]
pub fn init_test_logging() {
    let filter = EnvFilter::from_default_env()
        .add_directive(Level::DEBUG.into());

    let fmt_layer = fmt::layer()
        .with_test_writer()
        .with_target(true)
        .with_ansi(false);

    let _ = Registry::default()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}
