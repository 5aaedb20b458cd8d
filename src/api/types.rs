//! API request and response types.

use serde::{Deserialize, Serialize};

use crate::config::PassphraseSource;
use crate::keys::{BatchOutcome, CredentialPatch, ImportFailure, ImportReport, ImportedKey};
use crate::storage::StorageInfo;

/// Outcome of a management call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiMessage {
    pub success: bool,
    pub message: String,
}

impl ApiMessage {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub storage: StorageInfo,
    /// Where the encryption passphrase comes from.
    pub encryption: PassphraseSource,
}

/// Request to apply one set of changes to several keys.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchUpdateRequest {
    pub ids: Vec<String>,
    #[serde(default)]
    pub updates: CredentialPatch,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchDeleteRequest {
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResponse {
    pub success: bool,
    pub message: String,
    #[serde(flatten)]
    pub outcome: BatchOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportResponse {
    pub success: bool,
    pub message: String,
    pub imported: Vec<ImportedKey>,
    pub failed: Vec<ImportFailure>,
}

impl From<ImportReport> for ImportResponse {
    fn from(report: ImportReport) -> Self {
        Self {
            success: !report.imported.is_empty(),
            message: format!(
                "Imported {} key(s), {} failed",
                report.imported.len(),
                report.failed.len()
            ),
            imported: report.imported,
            failed: report.failed,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevealRequest {
    #[serde(default)]
    pub view_password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RevealResponse {
    pub success: bool,
    pub key: String,
}

/// Ad-hoc check of a key that need not be managed.
#[derive(Debug, Clone, Deserialize)]
pub struct TestKeyRequest {
    #[serde(default)]
    pub key: String,
    pub id: Option<String>,
}
