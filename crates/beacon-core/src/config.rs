//! Configuration management for the agent.

use crate::{CoreError, CoreResult, Paths};
use serde::{Deserialize, Serialize};
use std::path::Path;
use url::Url;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Default MQTT broker port (TLS).
pub const DEFAULT_MQTT_PORT: u16 = 8883;

fn default_mqtt_port() -> u16 {
    DEFAULT_MQTT_PORT
}

fn default_use_tls() -> bool {
    true
}

fn default_http_scheme() -> String {
    "https".to_string()
}

fn default_dispatch_interval_ms() -> u64 {
    1_000
}

fn default_batch_size() -> usize {
    50
}

fn default_claim_window_secs() -> u64 {
    60
}

/// Which delivery transport the agent runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    Mqtt,
    Http,
}

impl Default for TransportMode {
    fn default() -> Self {
        Self::Mqtt
    }
}

impl TransportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mqtt => "mqtt",
            Self::Http => "http",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "http" => Self::Http,
            _ => Self::Mqtt,
        }
    }
}

/// Main agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Device identifier, used as MQTT client id, topic segment, and
    /// certificate subject.
    pub device_id: String,
    /// Cloud endpoint host (broker and HTTP API share it).
    pub server: String,
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Delivery transport.
    #[serde(default)]
    pub transport: TransportMode,
    /// MQTT broker port.
    #[serde(default = "default_mqtt_port")]
    pub mqtt_port: u16,
    /// Whether the MQTT link uses TLS with the client certificate.
    #[serde(default = "default_use_tls")]
    pub use_tls: bool,
    /// Scheme for the HTTP delivery endpoint (https in production,
    /// http for local development).
    #[serde(default = "default_http_scheme")]
    pub http_scheme: String,
    /// Delivery dispatcher tick interval in milliseconds.
    #[serde(default = "default_dispatch_interval_ms")]
    pub dispatch_interval_ms: u64,
    /// Samples drained per HTTP batch cycle.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Seconds an in-flight claim may stay unacknowledged before it is
    /// released for re-dispatch.
    #[serde(default = "default_claim_window_secs")]
    pub claim_window_secs: u64,
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_id: "reference-device".to_string(),
            server: "127.0.0.1".to_string(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            transport: TransportMode::default(),
            mqtt_port: DEFAULT_MQTT_PORT,
            use_tls: true,
            http_scheme: default_http_scheme(),
            dispatch_interval_ms: default_dispatch_interval_ms(),
            batch_size: default_batch_size(),
            claim_window_secs: default_claim_window_secs(),
        }
    }
}

impl Config {
    /// Load configuration from the config file, falling back to defaults,
    /// then apply environment overrides.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env();
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to the config file.
    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.config_file(), content)?;
        Ok(())
    }

    /// Override configuration from environment variables.
    fn load_from_env(&mut self) {
        if let Ok(level) = std::env::var("BEACON_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Ok(device_id) = std::env::var("BEACON_DEVICE_ID") {
            self.device_id = device_id;
        }
        if let Ok(server) = std::env::var("BEACON_SERVER") {
            self.server = server;
        }
        if let Ok(transport) = std::env::var("BEACON_TRANSPORT") {
            self.transport = TransportMode::from_str(&transport);
        }
    }

    fn validate(&self) -> CoreResult<()> {
        if self.device_id.is_empty() {
            return Err(CoreError::Config("device_id must not be empty".to_string()));
        }
        if self.server.is_empty() {
            return Err(CoreError::Config("server must not be empty".to_string()));
        }
        Ok(())
    }

    /// The HTTP API base as a parsed URL.
    pub fn api_url(&self) -> CoreResult<Url> {
        Url::parse(&format!("{}://{}", self.http_scheme, self.server)).map_err(CoreError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.log_level, DEFAULT_LOG_LEVEL);
        assert_eq!(config.mqtt_port, DEFAULT_MQTT_PORT);
        assert_eq!(config.transport, TransportMode::Mqtt);
        assert!(config.use_tls);
    }

    #[test]
    fn test_config_load_from_file() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.json");

        let config_json = r#"{
            "device_id": "unit-0042",
            "server": "hive.example.net",
            "transport": "http",
            "log_level": "debug"
        }"#;

        std::fs::write(&config_path, config_json).unwrap();

        let config = Config::load_from_file(&config_path).unwrap();
        assert_eq!(config.device_id, "unit-0042");
        assert_eq!(config.server, "hive.example.net");
        assert_eq!(config.transport, TransportMode::Http);
        assert_eq!(config.log_level, "debug");
        // Defaults fill the omitted fields
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.claim_window_secs, 60);
    }

    #[test]
    fn test_config_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        let mut config = Config::default();
        config.device_id = "unit-0001".to_string();
        config.http_scheme = "http".to_string();

        config.save(&paths).unwrap();

        let loaded = Config::load(&paths).unwrap();
        assert_eq!(loaded.device_id, "unit-0001");
        assert_eq!(loaded.http_scheme, "http");
    }

    #[test]
    fn test_config_api_url() {
        let mut config = Config::default();
        config.server = "hive.example.net".to_string();
        let url = config.api_url().unwrap();
        assert_eq!(url.scheme(), "https");
        assert_eq!(url.host_str().unwrap(), "hive.example.net");
    }

    #[test]
    fn test_config_rejects_empty_device_id() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        let mut config = Config::default();
        config.device_id = String::new();
        config.save(&paths).unwrap();

        assert!(Config::load(&paths).is_err());
    }
}
