//! Document storage with pluggable backends.
//!
//! Supports:
//! - `local`: JSON files on disk
//! - `blob`: cloud object store with randomized object names (latest-wins reads)
//! - `kv`: remote key-value store with expiring keys
//!
//! The [`Storage`] facade is the only entry point used by the rest of the
//! crate. It applies default-config synthesis and the history retention policy
//! the same way for every backend, and converts backend failures into
//! `false`/default results instead of errors.

mod blob;
mod kv;
mod local;
#[cfg(test)]
pub(crate) mod memory;
pub mod retention;
mod types;

pub use blob::{BlobBackend, BlobObject, BlobStore, HttpBlobStore};
pub use kv::{HttpKvTransport, KvBackend, KvClient, KvTransport};
pub use local::LocalBackend;
pub use retention::{HistoryBound, MAX_HISTORY_ENTRIES};
pub use types::*;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::config::AppConfig;
use crate::util::{non_empty, now_millis};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed document: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("remote error: {0}")]
    Remote(String),

    #[error("{0} is not configured")]
    NotConfigured(&'static str),
}

/// The two documents the monitor persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Document {
    Config,
    History,
}

impl Document {
    /// Logical name: file name, blob pathname before the random suffix.
    pub fn file_name(&self) -> &'static str {
        match self {
            Document::Config => "config.json",
            Document::History => "history.json",
        }
    }

    /// Fixed key-value key and blob prefix.
    pub fn key(&self) -> &'static str {
        match self {
            Document::Config => "config",
            Document::History => "history",
        }
    }
}

/// Physical persistence backend, chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Local,
    Blob,
    Kv,
}

impl BackendKind {
    /// Decide the backend from environment signals.
    ///
    /// A blob token wins over a key-value endpoint; with neither, the local
    /// filesystem is used.
    pub fn select<F>(lookup: &F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if non_empty(lookup, "BLOB_READ_WRITE_TOKEN").is_some() {
            BackendKind::Blob
        } else if non_empty(lookup, "KV_REST_API_URL").is_some() {
            BackendKind::Kv
        } else {
            BackendKind::Local
        }
    }

    pub fn mode(&self) -> &'static str {
        match self {
            BackendKind::Local => "local-file",
            BackendKind::Blob => "vercel-blob",
            BackendKind::Kv => "vercel-kv",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            BackendKind::Local => "Local filesystem",
            BackendKind::Blob => "Cloud object storage (latest object wins)",
            BackendKind::Kv => "Cloud key-value storage (history expires by TTL)",
        }
    }
}

/// Backend trait - implemented by all storage backends.
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Read a document. `Ok(None)` means it was never written.
    async fn read_document(&self, document: Document) -> Result<Option<Value>, StorageError>;

    /// Replace a document. `ttl_secs` is honoured only by expiring backends.
    async fn write_document(
        &self,
        document: Document,
        value: &Value,
        ttl_secs: Option<u64>,
    ) -> Result<(), StorageError>;

    /// Store `body` as the backup copy of `document`, replacing any earlier
    /// backup. Called before a stored document that could not be read in full
    /// is overwritten.
    async fn preserve_copy(&self, document: Document, body: &str) -> Result<(), StorageError>;

    /// How this backend keeps the history document bounded.
    fn history_bound(&self) -> HistoryBound {
        HistoryBound::Capped(MAX_HISTORY_ENTRIES)
    }
}

/// Create the backend selected in `config`.
pub fn create_backend(config: &AppConfig) -> Arc<dyn Backend> {
    match config.backend {
        BackendKind::Local => Arc::new(LocalBackend::new(config.storage_dir.clone())),
        BackendKind::Blob => Arc::new(BlobBackend::new(Arc::new(HttpBlobStore::new(
            &config.blob.api_url,
            config.blob.token.clone(),
        )))),
        BackendKind::Kv => Arc::new(KvBackend::new(KvClient::new(Arc::new(
            HttpKvTransport::new(config.kv.url.clone(), config.kv.token.clone()),
        )))),
    }
}

/// Storage mode summary for the API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageInfo {
    pub mode: &'static str,
    pub backend: BackendKind,
    pub description: &'static str,
    pub persistent: bool,
    /// `null` when history is bounded by expiry instead of a count.
    pub max_history_entries: Option<usize>,
}

/// Storage facade over the active backend.
#[derive(Clone)]
pub struct Storage {
    backend: Arc<dyn Backend>,
    bootstrap_keys: Option<String>,
}

impl Storage {
    pub fn new(backend: Arc<dyn Backend>, bootstrap_keys: Option<String>) -> Self {
        Self {
            backend,
            bootstrap_keys,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(create_backend(config), config.bootstrap_keys.clone())
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn default_settings() -> Settings {
        Settings::default()
    }

    pub fn default_config() -> ConfigDocument {
        ConfigDocument {
            settings: Self::default_settings(),
            ..ConfigDocument::default()
        }
    }

    pub fn storage_info(&self) -> StorageInfo {
        let kind = self.kind();
        StorageInfo {
            mode: kind.mode(),
            backend: kind,
            description: kind.description(),
            persistent: true,
            max_history_entries: self.backend.history_bound().cap(),
        }
    }

    /// Load the configuration document, synthesizing and persisting one if
    /// none exists or the stored one is malformed.
    ///
    /// A stored document is only replaced after the backend has kept a copy of
    /// it. When the backend itself fails, defaults are returned without being
    /// written so an outage cannot overwrite stored credentials.
    pub async fn load_config(&self) -> ConfigDocument {
        match self.backend.read_document(Document::Config).await {
            Ok(Some(value)) => match ConfigDocument::from_stored(&value) {
                Ok((config, repairs)) if repairs.is_empty() => return config,
                Ok((config, repairs)) => {
                    for repair in &repairs {
                        tracing::warn!("Stored config: {}", repair);
                    }
                    if self.preserve(Document::Config, &value).await
                        && !self.save_config(&config).await
                    {
                        tracing::warn!("Could not persist repaired config");
                    }
                    return config;
                }
                Err(e) => {
                    tracing::warn!("Stored config is malformed ({}); regenerating", e);
                    if !self.preserve(Document::Config, &value).await {
                        return Self::default_config();
                    }
                }
            },
            Ok(None) => tracing::debug!("No stored config; bootstrapping"),
            Err(StorageError::Malformed(e)) => {
                tracing::warn!("Stored config is not valid JSON ({}); regenerating", e)
            }
            Err(e) => {
                tracing::warn!("Failed to load config: {}; using defaults", e);
                return Self::default_config();
            }
        }

        let config = self.bootstrap_config();
        if !self.save_config(&config).await {
            tracing::warn!("Could not persist bootstrapped config");
        }
        config
    }

    /// Keep a backup of a stored document before it is rewritten.
    async fn preserve(&self, document: Document, value: &Value) -> bool {
        let result = match serde_json::to_string_pretty(value) {
            Ok(body) => self.backend.preserve_copy(document, &body).await,
            Err(e) => Err(e.into()),
        };
        match result {
            Ok(()) => {
                tracing::warn!("Kept a copy of the stored {} before rewriting it", document.key());
                true
            }
            Err(e) => {
                tracing::error!("Failed to back up stored {}: {}; leaving it in place", document.key(), e);
                false
            }
        }
    }

    fn bootstrap_config(&self) -> ConfigDocument {
        let Some(raw) = self.bootstrap_keys.as_deref() else {
            return Self::default_config();
        };
        match serde_json::from_str::<Vec<Credential>>(raw) {
            Ok(api_keys) => {
                tracing::info!(
                    "Bootstrapping config with {} credential(s) from environment",
                    api_keys.len()
                );
                let mut config = Self::default_config();
                for credential in api_keys {
                    if config.contains_id(&credential.id) {
                        tracing::warn!(
                            "Skipping duplicate bootstrap credential id {}",
                            credential.id
                        );
                        continue;
                    }
                    config.api_keys.push(credential);
                }
                config
            }
            Err(e) => {
                tracing::error!("Failed to parse bootstrap credential list: {}", e);
                Self::default_config()
            }
        }
    }

    /// Persist the configuration document.
    pub async fn save_config(&self, config: &ConfigDocument) -> bool {
        match self.try_write(Document::Config, config, None).await {
            Ok(()) => {
                tracing::debug!("Saved config to {} storage", self.kind().mode());
                true
            }
            Err(e) => {
                tracing::error!("Failed to save config: {}", e);
                false
            }
        }
    }

    /// Load the history sequence; missing or unreadable history is empty.
    pub async fn load_history(&self) -> Vec<HistoryEntry> {
        match self.backend.read_document(Document::History).await {
            Ok(Some(value)) => serde_json::from_value(value).unwrap_or_else(|e| {
                tracing::warn!("Stored history is malformed ({}); treating as empty", e);
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::warn!("Failed to load history: {}", e);
                Vec::new()
            }
        }
    }

    /// Apply the retention policy and persist the history sequence.
    pub async fn save_history(&self, entries: Vec<HistoryEntry>) -> bool {
        let days = self.load_config().await.settings.retention_days();
        let bound = self.backend.history_bound();
        let before = entries.len();
        let retained = retention::apply_retention(entries, days, now_millis(), bound.cap());
        if retained.len() < before {
            tracing::debug!("Evicted {} history entries", before - retained.len());
        }

        let ttl = match bound {
            HistoryBound::Expiring => Some(retention::history_ttl_secs(days)),
            HistoryBound::Capped(_) => None,
        };
        match self.try_write(Document::History, &retained, ttl).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Failed to save history: {}", e);
                false
            }
        }
    }

    async fn try_write<T: Serialize>(
        &self,
        document: Document,
        payload: &T,
        ttl_secs: Option<u64>,
    ) -> Result<(), StorageError> {
        let value = serde_json::to_value(payload)?;
        self.backend.write_document(document, &value, ttl_secs).await
    }
}
