//! Configuration management for the usage monitor.
//!
//! Configuration is read once at startup from environment variables:
//! - `HOST` - Optional. Server host. Defaults to `0.0.0.0`.
//! - `PORT` - Optional. Server port. Defaults to `8000`.
//! - `STORAGE_DIR` - Optional. Root for the local file backend. Defaults to the current directory.
//! - `BLOB_READ_WRITE_TOKEN` - Optional. Selects the blob backend.
//! - `BLOB_API_URL` - Optional. Blob REST endpoint. Defaults to `https://blob.vercel-storage.com`.
//! - `KV_REST_API_URL` / `KV_REST_API_TOKEN` - Optional. Select the key-value backend.
//! - `FACTORY_API_KEYS` / `API_KEYS` - Optional. JSON array of credentials used to bootstrap an empty store.
//! - `ADMIN_PASSWORD` - Optional. Shared admin password. A random one is generated when unset.
//! - `ENCRYPTION_SECRET` - Optional. Passphrase for credential encryption.
//! - `ENCRYPTION_SECRET_PREVIOUS` / `ADMIN_PASSWORD_PREVIOUS` - Optional. Old secrets kept for decryption after a rotation.
//! - `USAGE_API_URL` - Optional. Metering endpoint queried for each credential.
//! - `USAGE_TIMEOUT_SECS` - Optional. Per-request timeout for the metering endpoint. Defaults to `10`.
//!
//! # Security notes
//! When `ENCRYPTION_SECRET` is not set, the passphrase is derived from the admin
//! password plus a fixed suffix. Anyone who knows the admin password can then
//! decrypt stored credentials, and changing the admin password without listing
//! the old one in `ADMIN_PASSWORD_PREVIOUS` makes existing ciphertexts unreadable.

use std::path::PathBuf;
use std::time::Duration;

use rand::RngCore;
use serde::Serialize;
use thiserror::Error;

use crate::storage::BackendKind;
use crate::util::non_empty;

/// Suffix appended to the admin password when deriving the fallback passphrase.
pub const PASSPHRASE_SUFFIX: &str = "::usage-monitor-credentials";

/// Default metering endpoint.
pub const DEFAULT_USAGE_API_URL: &str = "https://app.factory.ai/api/organization/members/chat-usage";

/// Default blob REST endpoint.
pub const DEFAULT_BLOB_API_URL: &str = "https://blob.vercel-storage.com";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Where the credential passphrase came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassphraseSource {
    /// `ENCRYPTION_SECRET` was set.
    Explicit,
    /// Derived from an operator-supplied `ADMIN_PASSWORD`.
    AdminPassword,
    /// Derived from an admin password generated at startup; does not survive restarts.
    GeneratedPassword,
}

/// Passphrases used by the secret codec.
#[derive(Clone)]
pub struct PassphraseConfig {
    /// Passphrase used for all new encryptions.
    pub current: String,
    /// Older passphrases still accepted for decryption, tried in order.
    pub previous: Vec<String>,
    pub source: PassphraseSource,
}

impl std::fmt::Debug for PassphraseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassphraseConfig")
            .field("current", &"<redacted>")
            .field("previous", &self.previous.len())
            .field("source", &self.source)
            .finish()
    }
}

/// Blob backend connection settings.
#[derive(Debug, Clone)]
pub struct BlobConfig {
    pub token: Option<String>,
    pub api_url: String,
}

/// Key-value backend connection settings.
#[derive(Debug, Clone, Default)]
pub struct KvConfig {
    pub url: Option<String>,
    pub token: Option<String>,
}

/// Metering endpoint settings.
#[derive(Debug, Clone)]
pub struct UsageConfig {
    pub url: String,
    pub timeout: Duration,
}

/// Process configuration, computed once at startup and shared by reference.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: PathBuf,
    /// Persistence backend selected from the environment.
    pub backend: BackendKind,
    pub blob: BlobConfig,
    pub kv: KvConfig,
    /// Raw JSON credential list used when the store holds no configuration yet.
    pub bootstrap_keys: Option<String>,
    pub admin_password: String,
    /// True when `admin_password` was generated because `ADMIN_PASSWORD` was unset.
    pub admin_password_generated: bool,
    pub passphrase: PassphraseConfig,
    pub usage: UsageConfig,
}

impl AppConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = non_empty(&lookup, "HOST").unwrap_or_else(|| "0.0.0.0".to_string());

        let port = match non_empty(&lookup, "PORT") {
            Some(raw) => raw
                .parse()
                .map_err(|e| ConfigError::InvalidValue("PORT".to_string(), format!("{}", e)))?,
            None => 8000,
        };

        let storage_dir = non_empty(&lookup, "STORAGE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        let timeout_secs: u64 = match non_empty(&lookup, "USAGE_TIMEOUT_SECS") {
            Some(raw) => raw.parse().map_err(|e| {
                ConfigError::InvalidValue("USAGE_TIMEOUT_SECS".to_string(), format!("{}", e))
            })?,
            None => 10,
        };
        if timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "USAGE_TIMEOUT_SECS".to_string(),
                "must be greater than zero".to_string(),
            ));
        }

        let (admin_password, admin_password_generated) = match non_empty(&lookup, "ADMIN_PASSWORD")
        {
            Some(password) => (password, false),
            None => (generate_password(), true),
        };

        let passphrase = resolve_passphrase(&lookup, &admin_password, admin_password_generated);

        Ok(Self {
            host,
            port,
            storage_dir,
            backend: BackendKind::select(&lookup),
            blob: BlobConfig {
                token: non_empty(&lookup, "BLOB_READ_WRITE_TOKEN"),
                api_url: non_empty(&lookup, "BLOB_API_URL")
                    .unwrap_or_else(|| DEFAULT_BLOB_API_URL.to_string()),
            },
            kv: KvConfig {
                url: non_empty(&lookup, "KV_REST_API_URL"),
                token: non_empty(&lookup, "KV_REST_API_TOKEN"),
            },
            bootstrap_keys: non_empty(&lookup, "FACTORY_API_KEYS")
                .or_else(|| non_empty(&lookup, "API_KEYS")),
            admin_password,
            admin_password_generated,
            passphrase,
            usage: UsageConfig {
                url: non_empty(&lookup, "USAGE_API_URL")
                    .unwrap_or_else(|| DEFAULT_USAGE_API_URL.to_string()),
                timeout: Duration::from_secs(timeout_secs),
            },
        })
    }
}

fn resolve_passphrase<F>(lookup: &F, admin_password: &str, generated: bool) -> PassphraseConfig
where
    F: Fn(&str) -> Option<String>,
{
    let mut previous = Vec::new();
    if let Some(old) = non_empty(lookup, "ENCRYPTION_SECRET_PREVIOUS") {
        previous.push(old);
    }
    if let Some(old) = non_empty(lookup, "ADMIN_PASSWORD_PREVIOUS") {
        previous.push(derive_from_admin_password(&old));
    }

    match non_empty(lookup, "ENCRYPTION_SECRET") {
        Some(secret) => {
            // Credentials written before an explicit secret was configured
            // were encrypted under the admin-password derivation.
            if !generated {
                previous.push(derive_from_admin_password(admin_password));
            }
            PassphraseConfig {
                current: secret,
                previous,
                source: PassphraseSource::Explicit,
            }
        }
        None => PassphraseConfig {
            current: derive_from_admin_password(admin_password),
            previous,
            source: if generated {
                PassphraseSource::GeneratedPassword
            } else {
                PassphraseSource::AdminPassword
            },
        },
    }
}

/// Fallback passphrase derivation from the admin password.
pub fn derive_from_admin_password(admin_password: &str) -> String {
    format!("{}{}", admin_password, PASSPHRASE_SUFFIX)
}

fn generate_password() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_environment_is_empty() {
        let config = AppConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8000);
        assert_eq!(config.backend, BackendKind::Local);
        assert_eq!(config.usage.timeout, Duration::from_secs(10));
        assert_eq!(config.usage.url, DEFAULT_USAGE_API_URL);
        assert!(config.admin_password_generated);
        assert_eq!(config.admin_password.len(), 32);
        assert_eq!(
            config.passphrase.source,
            PassphraseSource::GeneratedPassword
        );
    }

    #[test]
    fn invalid_port_is_rejected() {
        let err = AppConfig::from_lookup(lookup_from(&[("PORT", "eighty")])).unwrap_err();
        assert!(err.to_string().contains("PORT"));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        assert!(AppConfig::from_lookup(lookup_from(&[("USAGE_TIMEOUT_SECS", "0")])).is_err());
    }

    #[test]
    fn passphrase_derives_from_admin_password() {
        let config =
            AppConfig::from_lookup(lookup_from(&[("ADMIN_PASSWORD", "hunter2")])).unwrap();
        assert_eq!(config.passphrase.current, "hunter2::usage-monitor-credentials");
        assert_eq!(config.passphrase.source, PassphraseSource::AdminPassword);
        assert!(config.passphrase.previous.is_empty());
    }

    #[test]
    fn explicit_secret_keeps_admin_derivation_for_decryption() {
        let config = AppConfig::from_lookup(lookup_from(&[
            ("ADMIN_PASSWORD", "hunter2"),
            ("ENCRYPTION_SECRET", "s3cret"),
            ("ADMIN_PASSWORD_PREVIOUS", "old-pass"),
        ]))
        .unwrap();
        assert_eq!(config.passphrase.current, "s3cret");
        assert_eq!(config.passphrase.source, PassphraseSource::Explicit);
        assert_eq!(
            config.passphrase.previous,
            vec![
                derive_from_admin_password("old-pass"),
                derive_from_admin_password("hunter2"),
            ]
        );
    }

    #[test]
    fn bootstrap_keys_prefer_factory_variable() {
        let config = AppConfig::from_lookup(lookup_from(&[
            ("FACTORY_API_KEYS", "[1]"),
            ("API_KEYS", "[2]"),
        ]))
        .unwrap();
        assert_eq!(config.bootstrap_keys.as_deref(), Some("[1]"));

        let config = AppConfig::from_lookup(lookup_from(&[("API_KEYS", "[2]")])).unwrap();
        assert_eq!(config.bootstrap_keys.as_deref(), Some("[2]"));
    }

    #[test]
    fn debug_output_redacts_passphrase() {
        let config =
            AppConfig::from_lookup(lookup_from(&[("ENCRYPTION_SECRET", "topsecret")])).unwrap();
        let rendered = format!("{:?}", config.passphrase);
        assert!(!rendered.contains("topsecret"));
    }
}
