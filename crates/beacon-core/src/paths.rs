//! File system paths for the agent.

use crate::{CoreError, CoreResult};
use std::path::PathBuf;

/// Client certificate filename under the base directory.
const CLIENT_CERT_NAME: &str = "client.crt";
/// Client private key filename under the base directory.
const CLIENT_KEY_NAME: &str = "client.key";
/// Durable database filename under the base directory.
const DATABASE_NAME: &str = "beacon.db";

/// Manages file system paths for the agent.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Base directory for agent runtime files (~/.beacon)
    base_dir: PathBuf,
}

impl Paths {
    /// Create a new Paths instance rooted at `~/.beacon`.
    pub fn new() -> CoreResult<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| CoreError::Path("Could not determine home directory".to_string()))?;

        Ok(Self {
            base_dir: home.join(".beacon"),
        })
    }

    /// Create a new Paths instance with a custom base directory.
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Get the base directory (~/.beacon).
    pub fn base_dir(&self) -> &PathBuf {
        &self.base_dir
    }

    /// Get the config file path (~/.beacon/config.json).
    pub fn config_file(&self) -> PathBuf {
        self.base_dir.join("config.json")
    }

    /// Get the durable database file path (~/.beacon/beacon.db).
    pub fn database_file(&self) -> PathBuf {
        self.base_dir.join(DATABASE_NAME)
    }

    /// Get the client certificate path (~/.beacon/client.crt).
    pub fn certificate_file(&self) -> PathBuf {
        self.base_dir.join(CLIENT_CERT_NAME)
    }

    /// Get the client private key path (~/.beacon/client.key).
    pub fn private_key_file(&self) -> PathBuf {
        self.base_dir.join(CLIENT_KEY_NAME)
    }

    /// Get the broker CA certificate path (~/.beacon/ca.crt).
    pub fn ca_certificate_file(&self) -> PathBuf {
        self.base_dir.join("ca.crt")
    }

    /// Ensure all required directories exist.
    pub fn ensure_dirs(&self) -> CoreResult<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new().expect("Failed to determine home directory")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_with_base_dir() {
        let base = PathBuf::from("/tmp/test-beacon");
        let paths = Paths::with_base_dir(base.clone());

        assert_eq!(paths.base_dir(), &base);
        assert_eq!(paths.config_file(), base.join("config.json"));
        assert_eq!(paths.database_file(), base.join("beacon.db"));
        assert_eq!(paths.certificate_file(), base.join("client.crt"));
        assert_eq!(paths.private_key_file(), base.join("client.key"));
        assert_eq!(paths.ca_certificate_file(), base.join("ca.crt"));
    }
}
