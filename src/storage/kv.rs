//! Remote key-value storage backend.
//!
//! Each operation is one command POSTed as a JSON array (`["GET", key]`,
//! `["SETEX", key, ttl, value]`, ...) with a bearer token; the reply is
//! `{"result": ...}` or `{"error": "..."}`. Documents are stored as JSON strings
//! under fixed keys.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use super::retention::HistoryBound;
use super::{Backend, BackendKind, Document, StorageError};

/// One request/response exchange with the key-value service.
#[async_trait]
pub trait KvTransport: Send + Sync {
    async fn command(&self, args: Vec<Value>) -> Result<Value, StorageError>;
}

#[derive(Debug, Deserialize)]
struct CommandReply {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
}

/// REST transport for the key-value service.
pub struct HttpKvTransport {
    client: Client,
    url: Option<String>,
    token: Option<String>,
}

impl HttpKvTransport {
    pub fn new(url: Option<String>, token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            url,
            token,
        }
    }
}

#[async_trait]
impl KvTransport for HttpKvTransport {
    async fn command(&self, args: Vec<Value>) -> Result<Value, StorageError> {
        let url = self
            .url
            .as_deref()
            .ok_or(StorageError::NotConfigured("KV_REST_API_URL"))?;
        let token = self
            .token
            .as_deref()
            .ok_or(StorageError::NotConfigured("KV_REST_API_TOKEN"))?;

        let resp = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {}", token))
            .json(&args)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(StorageError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        let reply: CommandReply = serde_json::from_str(&text)?;
        match reply.error {
            Some(error) => Err(StorageError::Remote(error)),
            None => Ok(reply.result),
        }
    }
}

/// Typed get/set/delete over a [`KvTransport`].
#[derive(Clone)]
pub struct KvClient {
    transport: Arc<dyn KvTransport>,
}

impl KvClient {
    pub fn new(transport: Arc<dyn KvTransport>) -> Self {
        Self { transport }
    }

    pub async fn try_get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        match self.try_get_raw(key).await? {
            None => Ok(None),
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        }
    }

    /// The stored string under `key`, unparsed.
    pub async fn try_get_raw(&self, key: &str) -> Result<Option<String>, StorageError> {
        match self.transport.command(vec![json!("GET"), json!(key)]).await? {
            Value::Null => Ok(None),
            Value::String(raw) => Ok(Some(raw)),
            other => Ok(Some(other.to_string())),
        }
    }

    pub async fn try_set_raw(&self, key: &str, raw: &str) -> Result<(), StorageError> {
        self.transport
            .command(vec![json!("SET"), json!(key), json!(raw)])
            .await?;
        Ok(())
    }

    pub async fn try_set(
        &self,
        key: &str,
        value: &Value,
        ttl_secs: Option<u64>,
    ) -> Result<(), StorageError> {
        let serialized = serde_json::to_string(value)?;
        let args = match ttl_secs {
            Some(ttl) => vec![json!("SETEX"), json!(key), json!(ttl), json!(serialized)],
            None => vec![json!("SET"), json!(key), json!(serialized)],
        };
        self.transport.command(args).await?;
        Ok(())
    }

    /// Fetch and parse the value under `key`; failures read as missing.
    pub async fn get(&self, key: &str) -> Option<Value> {
        self.try_get(key).await.unwrap_or_else(|e| {
            tracing::error!("Failed to get KV key {}: {}", key, e);
            None
        })
    }

    /// Store `value` under `key`, expiring after `ttl_secs` when given.
    pub async fn set(&self, key: &str, value: &Value, ttl_secs: Option<u64>) -> bool {
        match self.try_set(key, value, ttl_secs).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Failed to set KV key {}: {}", key, e);
                false
            }
        }
    }

    pub async fn delete(&self, key: &str) -> bool {
        match self.transport.command(vec![json!("DEL"), json!(key)]).await {
            Ok(_) => true,
            Err(e) => {
                tracing::error!("Failed to delete KV key {}: {}", key, e);
                false
            }
        }
    }
}

pub struct KvBackend {
    client: KvClient,
}

impl KvBackend {
    pub fn new(client: KvClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Backend for KvBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Kv
    }

    async fn read_document(&self, document: Document) -> Result<Option<Value>, StorageError> {
        let Some(raw) = self.client.try_get_raw(document.key()).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                self.preserve_copy(document, &raw).await?;
                Err(e.into())
            }
        }
    }

    async fn write_document(
        &self,
        document: Document,
        value: &Value,
        ttl_secs: Option<u64>,
    ) -> Result<(), StorageError> {
        self.client.try_set(document.key(), value, ttl_secs).await
    }

    async fn preserve_copy(&self, document: Document, body: &str) -> Result<(), StorageError> {
        let key = format!("{}:corrupt", document.key());
        self.client.try_set_raw(&key, body).await?;
        tracing::warn!("Saved a copy of {} under {}", document.key(), key);
        Ok(())
    }

    fn history_bound(&self) -> HistoryBound {
        HistoryBound::Expiring
    }
}
