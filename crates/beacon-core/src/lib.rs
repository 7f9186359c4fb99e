//! Core types, configuration, and utilities for the Beacon agent.

mod config;
mod error;
mod logging;
mod paths;

pub use config::{Config, TransportMode, DEFAULT_LOG_LEVEL, DEFAULT_MQTT_PORT};
pub use error::{CoreError, CoreResult};
pub use logging::init_logging;
pub use paths::Paths;
