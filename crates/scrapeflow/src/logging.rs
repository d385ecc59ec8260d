//! Process-wide tracing setup.
//!
//! `RUST_LOG` wins over the configured level. Records emitted through the
//! `log` facade are forwarded into tracing, so both macro families end up
//! in the same output.

use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::LoggingConfig;

static INITIALIZED: AtomicBool = AtomicBool::new(false);

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Invalid log filter '{filter}': {reason}")]
    Filter { filter: String, reason: String },

    #[error("Failed to install logger: {0}")]
    Install(String),
}

fn build_filter(level: &str) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(level).map_err(|e| LoggingError::Filter {
        filter: level.to_string(),
        reason: e.to_string(),
    })
}

/// Installs the global subscriber. Returns `Ok(false)` when logging was
/// already set up by an earlier call.
pub fn init_logging(config: &LoggingConfig) -> Result<bool, LoggingError> {
    let filter = build_filter(&config.level)?;

    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return Ok(false);
    }

    let output = if config.json {
        fmt::layer().json().with_current_span(true).boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    };
    let subscriber = tracing_subscriber::registry().with(output).with(filter);

    tracing_log::LogTracer::init().map_err(|e| LoggingError::Install(e.to_string()))?;
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| LoggingError::Install(e.to_string()))?;

    tracing::debug!(level = %config.level, json = config.json, "Logging initialized");
    Ok(true)
}
