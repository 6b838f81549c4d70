//! Tracing setup.
//!
//! One fmt subscriber for the whole process. The filter comes from the
//! `RUST_LOG` environment variable when set, otherwise from the configured
//! log level.

use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

/// Initializes the global tracing subscriber.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn init(default_level: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow!("failed to initialize tracing: {err}"))
}
