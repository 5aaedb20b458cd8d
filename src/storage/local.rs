//! JSON file-based storage.
//!
//! `config.json` lives at the storage root and `history.json` under `data/`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::fs;
use uuid::Uuid;

use super::{Backend, BackendKind, Document, StorageError};

#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn path_for(&self, document: Document) -> PathBuf {
        match document {
            Document::Config => self.root.join(document.file_name()),
            Document::History => self.root.join("data").join(document.file_name()),
        }
    }

    fn backup_path(path: &Path) -> PathBuf {
        path.with_extension("json.corrupt")
    }

    /// Copy an unparseable document aside, byte for byte.
    async fn preserve_corrupt(path: &Path) -> Result<(), StorageError> {
        let backup = Self::backup_path(path);
        fs::copy(path, &backup).await?;
        tracing::warn!("Copied unparseable {} to {}", path.display(), backup.display());
        Ok(())
    }

    /// Write `data` to `path` through a temp file of its own, so concurrent
    /// writers never share or clobber each other's temp file.
    async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StorageError> {
        let mut tmp_name = path.as_os_str().to_owned();
        tmp_name.push(format!(".{}.tmp", Uuid::new_v4().simple()));
        let tmp_path = PathBuf::from(tmp_name);
        let written = match fs::write(&tmp_path, data).await {
            Ok(()) => fs::rename(&tmp_path, path).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn read_document(&self, document: Document) -> Result<Option<Value>, StorageError> {
        let path = self.path_for(document);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                Self::preserve_corrupt(&path).await?;
                Err(e.into())
            }
        }
    }

    async fn write_document(
        &self,
        document: Document,
        value: &Value,
        _ttl_secs: Option<u64>,
    ) -> Result<(), StorageError> {
        let path = self.path_for(document);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let data = serde_json::to_vec_pretty(value)?;
        Self::write_atomic(&path, &data).await
    }

    async fn preserve_copy(&self, document: Document, body: &str) -> Result<(), StorageError> {
        let path = self.path_for(document);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let backup = Self::backup_path(&path);
        Self::write_atomic(&backup, body.as_bytes()).await?;
        tracing::warn!("Saved a copy of {} to {}", path.display(), backup.display());
        Ok(())
    }
}
