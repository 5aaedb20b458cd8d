//! Credential management over the encrypted configuration store.
//!
//! [`CredentialStore`] is the only path by which credentials reach storage.
//! Keys are decrypted on load and encrypted on save, so everything above this
//! module works with plaintext while every backend only ever sees envelopes.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::crypto::{is_encrypted, SecretCodec};
use crate::storage::{ConfigDocument, Credential, Storage, DEFAULT_GROUP, DEFAULT_VIEW_PASSWORD};
use crate::util::{constant_time_eq, mask_key};

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("{0}")]
    Validation(String),

    #[error("Key ID already exists")]
    Conflict,

    #[error("Key not found")]
    NotFound,

    #[error("Invalid view password")]
    Forbidden,

    #[error("Failed to persist configuration")]
    Persist,
}

// ─────────────────────────────────────────────────────────────────────────────
// Request / result types
// ─────────────────────────────────────────────────────────────────────────────

/// Fields accepted when adding a credential.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewCredential {
    pub id: String,
    pub key: String,
    pub alias: String,
    pub group: Option<String>,
    pub note: String,
    pub view_password: Option<String>,
}

/// Partial update. Absent fields are left untouched; `id` is never changed.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CredentialPatch {
    pub key: Option<String>,
    pub alias: Option<String>,
    pub group: Option<String>,
    pub note: Option<String>,
    pub enabled: Option<bool>,
    pub view_password: Option<String>,
}

impl CredentialPatch {
    /// Merge into `credential`. A key that is only a placeholder for the
    /// current one (see [`is_placeholder`]) leaves the stored key in place.
    fn apply(&self, credential: &mut Credential, include_key: bool) {
        if include_key {
            if let Some(key) = self.key.as_deref() {
                if !is_placeholder(key, &credential.key) {
                    credential.key = key.trim().to_string();
                }
            }
        }
        if let Some(alias) = &self.alias {
            credential.alias = alias.clone();
        }
        if let Some(group) = &self.group {
            credential.group = group_or_default(Some(group));
        }
        if let Some(note) = &self.note {
            credential.note = note.clone();
        }
        if let Some(enabled) = self.enabled {
            credential.enabled = enabled;
        }
        if let Some(view_password) = &self.view_password {
            credential.view_password = view_password.clone();
        }
    }
}

/// Which ids a batch operation touched and which were unknown.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchOutcome {
    pub succeeded: Vec<String>,
    pub missing: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ImportRequest {
    pub keys: Vec<String>,
    /// Free-form text; keys separated by whitespace or commas.
    pub text: Option<String>,
    pub group: Option<String>,
}

impl ImportRequest {
    fn raw_keys(&self) -> Vec<String> {
        let from_text = self
            .text
            .iter()
            .flat_map(|text| text.split(|c: char| c.is_whitespace() || c == ','));
        self.keys
            .iter()
            .map(String::as_str)
            .chain(from_text)
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportedKey {
    pub id: String,
    pub masked_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportFailure {
    /// Masked form of the rejected key.
    pub key: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportReport {
    pub imported: Vec<ImportedKey>,
    pub failed: Vec<ImportFailure>,
}

/// Shown in place of a key that no configured passphrase can decrypt.
pub const UNDECRYPTABLE_MARKER: &str = "(undecryptable)";

/// Display form of a loaded key: masked plaintext, or the marker when the key
/// is still an envelope.
pub fn display_key(key: &str) -> String {
    if is_encrypted(key) {
        UNDECRYPTABLE_MARKER.to_string()
    } else {
        mask_key(key)
    }
}

/// Whether `incoming` stands for the stored key rather than replacing it:
/// blank, or the display form the listing returned for it.
fn is_placeholder(incoming: &str, stored: &str) -> bool {
    let incoming = incoming.trim();
    incoming.is_empty()
        || incoming == display_key(stored)
        || incoming == mask_key(stored)
        || (is_encrypted(stored) && incoming == UNDECRYPTABLE_MARKER)
}

fn key_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^fk-[A-Za-z0-9_-]+$").expect("valid key pattern"))
}

fn group_or_default(group: Option<&String>) -> String {
    group
        .map(|g| g.trim())
        .filter(|g| !g.is_empty())
        .unwrap_or(DEFAULT_GROUP)
        .to_string()
}

fn generate_id(config: &ConfigDocument, taken: &HashSet<String>) -> String {
    loop {
        let simple = Uuid::new_v4().simple().to_string();
        let id = format!("key-{}", &simple[..8]);
        if !config.contains_id(&id) && !taken.contains(&id) {
            return id;
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Store
// ─────────────────────────────────────────────────────────────────────────────

/// Storage facade wrapped with the secret codec.
#[derive(Clone)]
pub struct CredentialStore {
    storage: Storage,
    codec: SecretCodec,
}

impl CredentialStore {
    pub fn new(storage: Storage, codec: SecretCodec) -> Self {
        Self { storage, codec }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Load the configuration with plaintext keys.
    ///
    /// Keys found in plaintext at rest, or readable only with a previous
    /// passphrase, are written back encrypted under the current passphrase.
    pub async fn load_config(&self) -> ConfigDocument {
        let mut config = self.storage.load_config().await;
        let report = self.codec.decrypt_config(&mut config);
        if report.failed > 0 {
            tracing::warn!(
                "{} credential(s) could not be decrypted with any configured passphrase",
                report.failed
            );
        }
        if report.needs_reseal() {
            tracing::info!(
                "Re-encrypting stored credentials ({} plaintext, {} from a previous passphrase)",
                report.plaintext,
                report.rotated
            );
            if !self.save_config(&config).await {
                tracing::warn!("Could not re-encrypt stored credentials");
            }
        }
        config
    }

    /// Encrypt every key and persist. The caller's document is left plaintext.
    pub async fn save_config(&self, config: &ConfigDocument) -> bool {
        let mut sealed = config.clone();
        if let Err(e) = self.codec.encrypt_config(&mut sealed) {
            tracing::error!("Failed to encrypt credentials: {}", e);
            return false;
        }
        self.storage.save_config(&sealed).await
    }

    async fn persist(&self, config: &ConfigDocument) -> Result<(), KeyError> {
        if self.save_config(config).await {
            Ok(())
        } else {
            Err(KeyError::Persist)
        }
    }

    /// Configuration with every key masked, safe to return to clients.
    pub async fn list_masked(&self) -> ConfigDocument {
        let mut config = self.load_config().await;
        for credential in config.api_keys.iter_mut() {
            credential.key = display_key(&credential.key);
        }
        config
    }

    /// Replace the whole configuration document.
    ///
    /// Entries whose key is a placeholder for the stored key keep the stored
    /// key (including envelopes nobody can decrypt), so a listing can be
    /// edited and posted back.
    pub async fn replace_config(&self, mut incoming: ConfigDocument) -> Result<(), KeyError> {
        let mut seen = HashSet::new();
        for credential in &incoming.api_keys {
            if credential.id.trim().is_empty() {
                return Err(KeyError::Validation("Every key needs an id".to_string()));
            }
            if !seen.insert(credential.id.as_str()) {
                return Err(KeyError::Validation(format!(
                    "Duplicate key id: {}",
                    credential.id
                )));
            }
        }

        let current = self.load_config().await;
        for credential in incoming.api_keys.iter_mut() {
            if let Some(existing) = current.find(&credential.id) {
                if is_placeholder(&credential.key, &existing.key) {
                    credential.key = existing.key.clone();
                }
            }
            let key = credential.key.trim();
            if key.is_empty() || key == UNDECRYPTABLE_MARKER {
                return Err(KeyError::Validation(format!(
                    "Missing key for id: {}",
                    credential.id
                )));
            }
        }
        self.persist(&incoming).await
    }

    pub async fn add(&self, new: NewCredential) -> Result<(), KeyError> {
        let id = new.id.trim();
        let key = new.key.trim();
        if id.is_empty() || key.is_empty() {
            return Err(KeyError::Validation(
                "Missing required fields: id, key".to_string(),
            ));
        }

        let mut config = self.load_config().await;
        if config.contains_id(id) {
            return Err(KeyError::Conflict);
        }
        config.api_keys.push(Credential {
            id: id.to_string(),
            key: key.to_string(),
            alias: new.alias,
            group: group_or_default(new.group.as_ref()),
            note: new.note,
            enabled: true,
            view_password: new
                .view_password
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| DEFAULT_VIEW_PASSWORD.to_string()),
        });
        self.persist(&config).await?;
        tracing::info!("Added key {}", id);
        Ok(())
    }

    pub async fn update(&self, id: &str, patch: CredentialPatch) -> Result<(), KeyError> {
        let mut config = self.load_config().await;
        let credential = config.find_mut(id).ok_or(KeyError::NotFound)?;
        patch.apply(credential, true);
        self.persist(&config).await?;
        tracing::info!("Updated key {}", id);
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<(), KeyError> {
        let mut config = self.load_config().await;
        let before = config.api_keys.len();
        config.api_keys.retain(|c| c.id != id);
        if config.api_keys.len() == before {
            return Err(KeyError::NotFound);
        }
        self.persist(&config).await?;
        tracing::info!("Deleted key {}", id);
        Ok(())
    }

    /// Apply the metadata fields of `patch` to every listed credential.
    /// Keys are never changed in bulk.
    pub async fn batch_update(
        &self,
        ids: &[String],
        patch: CredentialPatch,
    ) -> Result<BatchOutcome, KeyError> {
        let mut config = self.load_config().await;
        let mut outcome = BatchOutcome::default();
        for id in ids {
            match config.find_mut(id) {
                Some(credential) => {
                    patch.apply(credential, false);
                    outcome.succeeded.push(id.clone());
                }
                None => outcome.missing.push(id.clone()),
            }
        }
        if !outcome.succeeded.is_empty() {
            self.persist(&config).await?;
        }
        tracing::info!(
            "Batch update: {} updated, {} missing",
            outcome.succeeded.len(),
            outcome.missing.len()
        );
        Ok(outcome)
    }

    pub async fn batch_delete(&self, ids: &[String]) -> Result<BatchOutcome, KeyError> {
        let mut config = self.load_config().await;
        let mut outcome = BatchOutcome::default();
        for id in ids {
            if config.contains_id(id) {
                config.api_keys.retain(|c| &c.id != id);
                outcome.succeeded.push(id.clone());
            } else {
                outcome.missing.push(id.clone());
            }
        }
        if !outcome.succeeded.is_empty() {
            self.persist(&config).await?;
        }
        tracing::info!(
            "Batch delete: {} deleted, {} missing",
            outcome.succeeded.len(),
            outcome.missing.len()
        );
        Ok(outcome)
    }

    /// Add every well-formed key that is not already managed.
    pub async fn import(&self, request: ImportRequest) -> Result<ImportReport, KeyError> {
        let raw_keys = request.raw_keys();
        if raw_keys.is_empty() {
            return Err(KeyError::Validation("No keys provided".to_string()));
        }

        let mut config = self.load_config().await;
        let group = group_or_default(request.group.as_ref());
        let mut known: HashSet<String> = config.api_keys.iter().map(|c| c.key.clone()).collect();
        let mut new_ids = HashSet::new();
        let mut report = ImportReport::default();

        for key in raw_keys {
            let reason = if !key_pattern().is_match(&key) {
                Some("invalid format")
            } else if known.contains(&key) {
                Some("duplicate")
            } else {
                None
            };
            if let Some(reason) = reason {
                report.failed.push(ImportFailure {
                    key: mask_key(&key),
                    reason: reason.to_string(),
                });
                continue;
            }

            let id = generate_id(&config, &new_ids);
            let mut credential = Credential::new(&id, &key);
            credential.group = group.clone();
            report.imported.push(ImportedKey {
                id: id.clone(),
                masked_key: mask_key(&key),
            });
            known.insert(key);
            new_ids.insert(id);
            config.api_keys.push(credential);
        }

        if !report.imported.is_empty() {
            self.persist(&config).await?;
        }
        tracing::info!(
            "Imported {} key(s), {} rejected",
            report.imported.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Return the plaintext key when `view_password` matches the credential's.
    pub async fn reveal(&self, id: &str, view_password: &str) -> Result<String, KeyError> {
        let config = self.load_config().await;
        let credential = config.find(id).ok_or(KeyError::NotFound)?;
        if !constant_time_eq(view_password, &credential.view_password) {
            tracing::warn!("Rejected reveal of key {}: wrong view password", id);
            return Err(KeyError::Forbidden);
        }
        if is_encrypted(&credential.key) {
            return Err(KeyError::Validation(
                "Stored key cannot be decrypted with the current passphrase".to_string(),
            ));
        }
        Ok(credential.key.clone())
    }
}
