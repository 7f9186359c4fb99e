//! Logging initialization for the agent.

use tracing_subscriber::EnvFilter;

/// Initialize the logging system.
///
/// Sets up a tracing subscriber with the level taken from `RUST_LOG`
/// when present, falling back to the provided default.
///
/// # Example
///
/// ```ignore
/// init_logging("info");
/// tracing::info!("Agent started");
/// ```
pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
