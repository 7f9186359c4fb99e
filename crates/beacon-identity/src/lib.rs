//! Device identity lifecycle for the Beacon agent.
//!
//! Manages the short-lived X.509 client certificate: loading it from disk,
//! caching its content hash (used as a bearer token) and expiry, and
//! renewing it through the automated enrollment endpoint. Renewal failure
//! is never fatal: the agent keeps operating with the old credential and
//! the next dispatch cycle retries.

use chrono::{DateTime, TimeZone, Utc};
use rcgen::{CertificateParams, DnType, KeyPair};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::RwLock;
use thiserror::Error;
use tracing::{info, warn};
use x509_parser::pem::parse_x509_pem;

/// Identity error type.
#[derive(Error, Debug)]
pub enum IdentityError {
    /// Certificate file could not be parsed
    #[error("Certificate parse error: {0}")]
    Parse(String),

    /// Private key handling failed
    #[error("Key error: {0}")]
    Key(String),

    /// Enrollment failed; the previous credential stays in use
    #[error("Provisioning failed: {0}")]
    Provisioning(String),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using IdentityError.
pub type IdentityResult<T> = Result<T, IdentityError>;

/// Lifecycle state, for logging and the dispatcher's cycle gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityState {
    /// No certificate has been loaded.
    Unloaded,
    /// Certificate loaded and within its validity window.
    Valid,
    /// Certificate loaded but past `notAfter`.
    Expired,
}

/// A loaded client certificate.
#[derive(Debug, Clone)]
struct LoadedCertificate {
    /// Hex SHA-256 of the DER encoding; doubles as the bearer token.
    hash: String,
    not_after: DateTime<Utc>,
}

/// Manages the device certificate and its renewal.
pub struct IdentityManager {
    device_id: String,
    /// Base URL of the provisioning API, e.g. `https://hive.example.net`.
    api_base: String,
    certificate_path: PathBuf,
    key_path: PathBuf,
    client: reqwest::Client,
    loaded: RwLock<Option<LoadedCertificate>>,
    /// Serializes renewals; the dispatcher gate is the only caller, but
    /// the lock keeps that a local property rather than a global one.
    renew_lock: tokio::sync::Mutex<()>,
}

impl IdentityManager {
    /// Create a manager and load the certificate file if one exists.
    pub fn new(
        device_id: &str,
        api_base: &str,
        certificate_path: PathBuf,
        key_path: PathBuf,
    ) -> Self {
        let manager = Self {
            device_id: device_id.to_string(),
            api_base: api_base.trim_end_matches('/').to_string(),
            certificate_path,
            key_path,
            client: reqwest::Client::new(),
            loaded: RwLock::new(None),
            renew_lock: tokio::sync::Mutex::new(()),
        };

        if manager.certificate_path.exists() {
            match manager.load() {
                Ok(()) => info!("Loaded existing client certificate"),
                Err(e) => warn!(error = %e, "Could not load client certificate"),
            }
        }

        manager
    }

    /// Parse the certificate file and cache its hash and expiry.
    pub fn load(&self) -> IdentityResult<()> {
        let pem_bytes = std::fs::read(&self.certificate_path)?;

        let (_, pem) = parse_x509_pem(&pem_bytes)
            .map_err(|e| IdentityError::Parse(format!("invalid PEM: {e}")))?;
        let certificate = pem
            .parse_x509()
            .map_err(|e| IdentityError::Parse(format!("invalid X.509: {e}")))?;

        let not_after = certificate.validity().not_after.timestamp();
        let not_after = Utc
            .timestamp_opt(not_after, 0)
            .single()
            .ok_or_else(|| IdentityError::Parse("notAfter out of range".to_string()))?;

        let hash = hex_digest(&pem.contents);

        let mut loaded = self.loaded.write().unwrap_or_else(|e| e.into_inner());
        *loaded = Some(LoadedCertificate { hash, not_after });

        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self, now: DateTime<Utc>) -> IdentityState {
        let loaded = self.loaded.read().unwrap_or_else(|e| e.into_inner());
        match loaded.as_ref() {
            None => IdentityState::Unloaded,
            Some(cert) if now < cert.not_after => IdentityState::Valid,
            Some(_) => IdentityState::Expired,
        }
    }

    /// Whether the current certificate passes the delivery gate.
    /// Absent counts as expired.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.state(now) == IdentityState::Valid
    }

    /// The bearer token (hex SHA-256 of the certificate's DER encoding),
    /// when a certificate is loaded.
    pub fn bearer_token(&self) -> Option<String> {
        let loaded = self.loaded.read().unwrap_or_else(|e| e.into_inner());
        loaded.as_ref().map(|cert| cert.hash.clone())
    }

    /// Expiry of the loaded certificate.
    pub fn not_after(&self) -> Option<DateTime<Utc>> {
        let loaded = self.loaded.read().unwrap_or_else(|e| e.into_inner());
        loaded.as_ref().map(|cert| cert.not_after)
    }

    /// Run one enrollment round: build a CSR for the device, submit it,
    /// and on success persist and reload the returned certificate.
    ///
    /// The previous credential authenticates the request when one exists.
    /// Any non-200 outcome leaves the old identity in place.
    pub async fn renew(&self) -> IdentityResult<()> {
        let _guard = self.renew_lock.lock().await;

        let key_pair = self.load_or_generate_key()?;
        let csr_pem = self.build_csr(&key_pair)?;

        let url = format!(
            "{}/device/{}/certificate",
            self.api_base, self.device_id
        );

        info!(url = %url, "Requesting certificate");

        let mut request = self.client.post(&url).body(csr_pem);
        if let Some(token) = self.bearer_token() {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(IdentityError::Provisioning(format!(
                "HTTP {status}: {body}"
            )));
        }

        let certificate_pem = response.text().await?;
        std::fs::write(&self.certificate_path, certificate_pem)?;

        self.load()?;
        info!(
            not_after = ?self.not_after(),
            "Client certificate renewed"
        );
        Ok(())
    }

    /// Reuse the on-disk private key, or generate and persist a fresh one.
    fn load_or_generate_key(&self) -> IdentityResult<KeyPair> {
        if self.key_path.exists() {
            let pem = std::fs::read_to_string(&self.key_path)?;
            return KeyPair::from_pem(&pem)
                .map_err(|e| IdentityError::Key(format!("could not read key file: {e}")));
        }

        let key_pair = KeyPair::generate()
            .map_err(|e| IdentityError::Key(format!("key generation failed: {e}")))?;
        std::fs::write(&self.key_path, key_pair.serialize_pem())?;
        info!(path = %self.key_path.display(), "Generated device key");
        Ok(key_pair)
    }

    /// Build the PEM certificate signing request carrying the device id.
    fn build_csr(&self, key_pair: &KeyPair) -> IdentityResult<String> {
        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, &self.device_id);
        params
            .distinguished_name
            .push(DnType::OrganizationName, "beacon");

        let csr = params
            .serialize_request(key_pair)
            .map_err(|e| IdentityError::Key(format!("CSR build failed: {e}")))?;
        csr.pem()
            .map_err(|e| IdentityError::Key(format!("CSR encoding failed: {e}")))
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().fold(String::with_capacity(64), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_certificate(path: &std::path::Path, expiry_year: i32) {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, "unit-test");
        params.not_after = rcgen::date_time_ymd(expiry_year, 1, 1);
        let certificate = params.self_signed(&key).unwrap();
        std::fs::write(path, certificate.pem()).unwrap();
    }

    fn manager_for(dir: &std::path::Path) -> IdentityManager {
        IdentityManager::new(
            "unit-test",
            "https://hive.example.net",
            dir.join("client.crt"),
            dir.join("client.key"),
        )
    }

    #[test]
    fn test_unloaded_without_certificate_file() {
        let dir = tempdir().unwrap();
        let manager = manager_for(dir.path());

        assert_eq!(manager.state(Utc::now()), IdentityState::Unloaded);
        assert!(!manager.is_valid(Utc::now()));
        assert!(manager.bearer_token().is_none());
    }

    #[test]
    fn test_valid_certificate_passes_gate() {
        let dir = tempdir().unwrap();
        write_certificate(
            &dir.path().join("client.crt"),
            2042,
        );

        let manager = manager_for(dir.path());
        assert_eq!(manager.state(Utc::now()), IdentityState::Valid);
        assert!(manager.is_valid(Utc::now()));

        let token = manager.bearer_token().unwrap();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_expired_certificate_fails_gate() {
        let dir = tempdir().unwrap();
        write_certificate(
            &dir.path().join("client.crt"),
            2020,
        );

        let manager = manager_for(dir.path());
        assert_eq!(manager.state(Utc::now()), IdentityState::Expired);
        assert!(!manager.is_valid(Utc::now()));
        // An expired certificate still yields a token; it authenticates
        // the renewal request
        assert!(manager.bearer_token().is_some());
    }

    #[test]
    fn test_reload_replaces_identity_wholesale() {
        let dir = tempdir().unwrap();
        let cert_path = dir.path().join("client.crt");
        write_certificate(&cert_path, 2020);

        let manager = manager_for(dir.path());
        let old_token = manager.bearer_token().unwrap();
        assert!(!manager.is_valid(Utc::now()));

        // A renewed certificate lands on disk and gets reloaded
        write_certificate(&cert_path, 2042);
        manager.load().unwrap();

        assert!(manager.is_valid(Utc::now()));
        assert_ne!(manager.bearer_token().unwrap(), old_token);
    }

    #[test]
    fn test_key_is_reused_across_renewals() {
        let dir = tempdir().unwrap();
        let manager = manager_for(dir.path());

        let first = manager.load_or_generate_key().unwrap();
        let second = manager.load_or_generate_key().unwrap();
        assert_eq!(first.serialize_pem(), second.serialize_pem());
    }

    #[test]
    fn test_csr_is_pem_encoded() {
        let dir = tempdir().unwrap();
        let manager = manager_for(dir.path());

        let key = manager.load_or_generate_key().unwrap();
        let csr = manager.build_csr(&key).unwrap();
        assert!(csr.starts_with("-----BEGIN CERTIFICATE REQUEST-----"));
    }

    #[test]
    fn test_hex_digest_is_stable() {
        let digest = hex_digest(b"beacon");
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, hex_digest(b"beacon"));
        assert_ne!(digest, hex_digest(b"beacon2"));
    }
}
