//! The uniform driver configuration envelope.
//!
//! Every driver is configured with the same outer shape — endpoint,
//! credential, tunables, feature flags — plus a backend-specific payload it
//! deserializes itself. Credentials may arrive as clear text or as
//! `encrypted:<ciphertext>`; resolution goes through a [`CredentialDecryptor`]
//! collaborator and fails closed when decryption is required but unavailable.
//! The core never reads process environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};
use crate::records::DriverKind;

/// Prefix marking an encrypted credential.
pub const ENCRYPTED_PREFIX: &str = "encrypted:";

/// Resolves `encrypted:<ciphertext>` credentials.
pub trait CredentialDecryptor: Send + Sync {
    fn decrypt(&self, ciphertext: &str) -> anyhow::Result<String>;
}

/// A credential as it appears in configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawCredential {
    Clear(String),
    Encrypted(String),
}

impl RawCredential {
    pub fn parse(raw: &str) -> RawCredential {
        match raw.strip_prefix(ENCRYPTED_PREFIX) {
            Some(ct) => RawCredential::Encrypted(ct.to_string()),
            None => RawCredential::Clear(raw.to_string()),
        }
    }

    /// Resolve to clear text, failing closed when a decryptor is needed but
    /// absent.
    pub fn resolve(&self, decryptor: Option<&dyn CredentialDecryptor>) -> Result<String> {
        match self {
            RawCredential::Clear(s) => Ok(s.clone()),
            RawCredential::Encrypted(ct) => match decryptor {
                Some(d) => d.decrypt(ct).map_err(|e| {
                    StorageError::invalid_config(format!("credential decryption failed: {e}"))
                }),
                None => Err(StorageError::invalid_config(
                    "credential is encrypted but no decryptor was provided",
                )),
            },
        }
    }
}

/// Tunables common to every driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverOptions {
    /// Minimum spacing between serialized writes.
    #[serde(default = "default_write_throttle", with = "humantime_serde")]
    pub write_throttle: Duration,
    /// Maximum attempts for retryable reads.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Backoff cap for retries.
    #[serde(default = "default_retry_max_delay", with = "humantime_serde")]
    pub retry_max_delay: Duration,
    /// Preferred part size for multipart uploads, when the backend does not
    /// dictate one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part_size: Option<u64>,
    /// Page limit override for tree listings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tree_page_limit: Option<u32>,
    /// Upload concurrency for drivers gated by a shared semaphore.
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: u32,
    #[serde(default = "default_true")]
    pub use_paths_info: bool,
    #[serde(default)]
    pub use_xet: bool,
    #[serde(default)]
    pub delete_lfs_on_remove: bool,
    #[serde(default)]
    pub tls_skip_verify: bool,
}

fn default_write_throttle() -> Duration {
    Duration::from_secs(1)
}

fn default_retry_attempts() -> u32 {
    4
}

fn default_retry_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_upload_concurrency() -> u32 {
    2
}

fn default_true() -> bool {
    true
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            write_throttle: default_write_throttle(),
            retry_attempts: default_retry_attempts(),
            retry_max_delay: default_retry_max_delay(),
            part_size: None,
            tree_page_limit: None,
            upload_concurrency: default_upload_concurrency(),
            use_paths_info: true,
            use_xet: false,
            delete_lfs_on_remove: false,
            tls_skip_verify: false,
        }
    }
}

/// The uniform configuration envelope. Immutable after initialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Stable mount name; also keys process-wide shared resources.
    pub name: String,
    pub kind: DriverKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Clear text or `encrypted:<ciphertext>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
    #[serde(default)]
    pub options: DriverOptions,
    /// Backend-specific payload; each driver deserializes its own shape.
    #[serde(default)]
    pub backend: serde_json::Value,
}

impl DriverConfig {
    pub fn new(name: impl Into<String>, kind: DriverKind) -> Self {
        Self {
            name: name.into(),
            kind,
            endpoint: None,
            credential: None,
            options: DriverOptions::default(),
            backend: serde_json::Value::Null,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    pub fn with_backend(mut self, backend: serde_json::Value) -> Self {
        self.backend = backend;
        self
    }

    /// Resolve the credential through an optional decryptor.
    ///
    /// Returns `Ok(None)` when no credential is configured.
    pub fn resolve_credential(
        &self,
        decryptor: Option<&dyn CredentialDecryptor>,
    ) -> Result<Option<String>> {
        match &self.credential {
            None => Ok(None),
            Some(raw) => RawCredential::parse(raw).resolve(decryptor).map(Some),
        }
    }

    /// Deserialize the backend-specific payload.
    pub fn backend_config<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.backend.clone()).map_err(|e| {
            StorageError::invalid_config(format!(
                "invalid backend configuration for driver '{}': {e}",
                self.name
            ))
        })
    }

    /// Endpoint with any trailing slash trimmed, or an error when required.
    pub fn require_endpoint(&self) -> Result<String> {
        self.endpoint
            .as_deref()
            .map(|e| e.trim_end_matches('/').to_string())
            .filter(|e| !e.is_empty())
            .ok_or_else(|| {
                StorageError::invalid_config(format!("driver '{}' requires an endpoint", self.name))
            })
    }
}
