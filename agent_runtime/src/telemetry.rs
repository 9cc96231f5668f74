//! Logging initialization.

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Layer, Registry};

use crate::settings::LoggingConfig;

/// `RUST_LOG` wins over the configured level.
fn env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .with_context(|| format!("Invalid log level '{}'", config.level))
}

/// Install the global subscriber. Fails if one is already set.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = env_filter(config)?;

    let fmt_layer = match config.format.as_str() {
        "json" => tracing_subscriber::fmt::layer()
            .json()
            .with_target(config.enable_target)
            .with_thread_ids(config.enable_thread_ids)
            .boxed(),
        _ => tracing_subscriber::fmt::layer()
            .with_target(config.enable_target)
            .with_thread_ids(config.enable_thread_ids)
            .boxed(),
    };

    let subscriber = Registry::default().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).context("Logging already initialized")?;

    tracing::debug!(level = %config.level, format = %config.format, "logging initialized");
    Ok(())
}
