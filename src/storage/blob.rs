//! Cloud object storage backend.
//!
//! Object names are not stable: every upload gets a random suffix
//! (`config.json` is stored as `config-<random>.json`). A document is therefore
//! written by deleting every object sharing its prefix and uploading a new one,
//! and read by listing the prefix and taking the most recently uploaded object.
//!
//! Deletes during a write are best-effort. If some fail, several objects share
//! the prefix until the next successful write; reads still return the newest,
//! so the store converges without coordination.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

use super::{Backend, BackendKind, Document, StorageError};

/// Metadata for one stored object.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobObject {
    pub url: String,
    pub pathname: String,
    #[serde(default)]
    pub uploaded_at: Option<DateTime<Utc>>,
}

/// Object store operations used by [`BlobBackend`].
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// List objects whose pathname starts with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<BlobObject>, StorageError>;

    /// Fetch an object's body.
    async fn fetch(&self, object: &BlobObject) -> Result<String, StorageError>;

    /// Upload a new object; the store appends a random suffix to `pathname`.
    async fn put(&self, pathname: &str, body: String) -> Result<BlobObject, StorageError>;

    async fn delete(&self, object: &BlobObject) -> Result<(), StorageError>;
}

/// Whether `pathname` is a physical object of the logical document `stem`.
fn belongs_to(pathname: &str, stem: &str) -> bool {
    match pathname.strip_prefix(stem) {
        Some(".json") => true,
        Some(rest) => rest.starts_with('-') && rest.ends_with(".json"),
        None => false,
    }
}

pub struct BlobBackend {
    store: Arc<dyn BlobStore>,
}

impl BlobBackend {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }

    async fn objects_for(&self, stem: &str) -> Result<Vec<BlobObject>, StorageError> {
        let mut objects: Vec<BlobObject> = self
            .store
            .list(stem)
            .await?
            .into_iter()
            .filter(|o| belongs_to(&o.pathname, stem))
            .collect();
        // Newest first; objects without a timestamp sort last.
        objects.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at));
        Ok(objects)
    }

    /// Delete every object under `stem`, then upload `body` as `<stem>.json`.
    async fn replace(&self, stem: &str, body: String) -> Result<BlobObject, StorageError> {
        match self.objects_for(stem).await {
            Ok(existing) => {
                for object in existing {
                    if let Err(e) = self.store.delete(&object).await {
                        tracing::warn!("Failed to delete stale blob {}: {}", object.pathname, e);
                    }
                }
            }
            Err(e) => tracing::warn!("Failed to list blobs for {}: {}", stem, e),
        }
        self.store.put(&format!("{}.json", stem), body).await
    }
}

fn backup_stem(document: Document) -> String {
    format!("{}.corrupt", document.key())
}

#[async_trait]
impl Backend for BlobBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Blob
    }

    async fn read_document(&self, document: Document) -> Result<Option<Value>, StorageError> {
        let objects = self.objects_for(document.key()).await?;
        let Some(latest) = objects.first() else {
            return Ok(None);
        };
        if objects.len() > 1 {
            tracing::debug!(
                "{} objects share prefix {}; reading {}",
                objects.len(),
                document.key(),
                latest.pathname
            );
        }
        let body = self.store.fetch(latest).await?;
        match serde_json::from_str(&body) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                self.preserve_copy(document, &body).await?;
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
        let body = serde_json::to_string_pretty(value)?;
        let created = self.replace(document.key(), body).await?;
        tracing::debug!("Uploaded {}", created.pathname);
        Ok(())
    }

    async fn preserve_copy(&self, document: Document, body: &str) -> Result<(), StorageError> {
        let created = self.replace(&backup_stem(document), body.to_string()).await?;
        tracing::warn!("Saved a copy of {} as {}", document.key(), created.pathname);
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    blobs: Vec<BlobObject>,
    #[serde(default)]
    cursor: Option<String>,
    #[serde(default)]
    has_more: bool,
}

/// Blob REST API client.
pub struct HttpBlobStore {
    client: Client,
    api_url: String,
    token: Option<String>,
}

impl HttpBlobStore {
    pub fn new(api_url: &str, token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn token(&self) -> Result<&str, StorageError> {
        self.token
            .as_deref()
            .ok_or(StorageError::NotConfigured("BLOB_READ_WRITE_TOKEN"))
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, StorageError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(StorageError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn list(&self, prefix: &str) -> Result<Vec<BlobObject>, StorageError> {
        let token = self.token()?;
        let mut objects = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut query = vec![("prefix", prefix.to_string()), ("limit", "1000".to_string())];
            if let Some(c) = &cursor {
                query.push(("cursor", c.clone()));
            }
            let resp = self
                .client
                .get(&self.api_url)
                .header("Authorization", format!("Bearer {}", token))
                .query(&query)
                .send()
                .await?;
            let page: ListResponse = Self::check(resp).await?.json().await?;
            objects.extend(page.blobs);
            match page.cursor {
                Some(next) if page.has_more => cursor = Some(next),
                _ => break,
            }
        }
        Ok(objects)
    }

    async fn fetch(&self, object: &BlobObject) -> Result<String, StorageError> {
        let resp = self.client.get(&object.url).send().await?;
        Ok(Self::check(resp).await?.text().await?)
    }

    async fn put(&self, pathname: &str, body: String) -> Result<BlobObject, StorageError> {
        let token = self.token()?;
        let resp = self
            .client
            .put(format!("{}/{}", self.api_url, pathname))
            .header("Authorization", format!("Bearer {}", token))
            .header("x-content-type", "application/json")
            .header("x-add-random-suffix", "1")
            .body(body)
            .send()
            .await?;
        let mut object: BlobObject = Self::check(resp).await?.json().await?;
        if object.uploaded_at.is_none() {
            object.uploaded_at = Some(Utc::now());
        }
        Ok(object)
    }

    async fn delete(&self, object: &BlobObject) -> Result<(), StorageError> {
        let token = self.token()?;
        let resp = self
            .client
            .post(format!("{}/delete", self.api_url))
            .header("Authorization", format!("Bearer {}", token))
            .json(&serde_json::json!({ "urls": [object.url] }))
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::memory::MemoryBlobStore;
    use super::*;
    use axum::{
        extract::{Path, Query, State},
        http::{HeaderMap, StatusCode},
        routing::{get, post, put},
        Json, Router,
    };
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;
    use tokio::sync::Mutex;

    #[test]
    fn pathname_membership() {
        assert!(belongs_to("config.json", "config"));
        assert!(belongs_to("config-HcJbdeVwxdFL9S5m.json", "config"));
        assert!(!belongs_to("configuration.json", "config"));
        assert!(!belongs_to("config-abc.txt", "config"));
        assert!(!belongs_to("history-abc.json", "config"));
        assert!(!belongs_to("config.corrupt-abc.json", "config"));
        assert!(belongs_to("config.corrupt-abc.json", "config.corrupt"));
    }

    #[tokio::test]
    async fn unparseable_blob_is_copied_aside() {
        let store = Arc::new(MemoryBlobStore::new());
        store.put("config.json", "{ broken".to_string()).await.unwrap();
        let backend = BlobBackend::new(store.clone());

        assert!(matches!(
            backend.read_document(Document::Config).await,
            Err(StorageError::Malformed(_))
        ));
        assert_eq!(store.latest_body("config.corrupt").as_deref(), Some("{ broken"));

        // Backups never shadow the live document.
        backend
            .write_document(Document::Config, &json!({"apiKeys": []}), None)
            .await
            .unwrap();
        assert_eq!(
            backend.read_document(Document::Config).await.unwrap(),
            Some(json!({"apiKeys": []}))
        );
        assert_eq!(store.pathnames_with_prefix("config.corrupt").len(), 1);
    }

    #[tokio::test]
    async fn missing_document_reads_as_none() {
        let backend = BlobBackend::new(Arc::new(MemoryBlobStore::new()));
        assert!(backend.read_document(Document::Config).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn writing_twice_leaves_one_object() {
        let store = Arc::new(MemoryBlobStore::new());
        let backend = BlobBackend::new(store.clone());

        backend
            .write_document(Document::Config, &json!({"version": 1}), None)
            .await
            .unwrap();
        backend
            .write_document(Document::Config, &json!({"version": 2}), None)
            .await
            .unwrap();

        let paths = store.pathnames_with_prefix("config");
        assert_eq!(paths.len(), 1);
        assert!(paths[0].starts_with("config-") && paths[0].ends_with(".json"));
        assert_eq!(
            backend.read_document(Document::Config).await.unwrap(),
            Some(json!({"version": 2}))
        );
    }

    #[tokio::test]
    async fn failed_deletes_self_heal_through_latest_wins() {
        let store = Arc::new(MemoryBlobStore::new());
        let backend = BlobBackend::new(store.clone());

        backend
            .write_document(Document::History, &json!([1]), None)
            .await
            .unwrap();
        store.fail_deletes.store(true, Ordering::SeqCst);
        backend
            .write_document(Document::History, &json!([1, 2]), None)
            .await
            .unwrap();

        assert_eq!(store.pathnames_with_prefix("history").len(), 2);
        assert_eq!(
            backend.read_document(Document::History).await.unwrap(),
            Some(json!([1, 2]))
        );

        store.fail_deletes.store(false, Ordering::SeqCst);
        backend
            .write_document(Document::History, &json!([1, 2, 3]), None)
            .await
            .unwrap();
        assert_eq!(store.pathnames_with_prefix("history").len(), 1);
        assert_eq!(
            backend.read_document(Document::History).await.unwrap(),
            Some(json!([1, 2, 3]))
        );
    }

    #[tokio::test]
    async fn documents_do_not_interfere() {
        let store = Arc::new(MemoryBlobStore::new());
        let backend = BlobBackend::new(store.clone());
        backend
            .write_document(Document::Config, &json!({"apiKeys": []}), None)
            .await
            .unwrap();
        backend
            .write_document(Document::History, &json!([]), None)
            .await
            .unwrap();
        assert_eq!(
            backend.read_document(Document::Config).await.unwrap(),
            Some(json!({"apiKeys": []}))
        );
    }

    #[tokio::test]
    async fn failed_upload_is_an_error() {
        let store = Arc::new(MemoryBlobStore::new());
        store.fail_puts.store(true, Ordering::SeqCst);
        let backend = BlobBackend::new(store);
        assert!(backend
            .write_document(Document::Config, &json!({}), None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn missing_token_is_not_configured() {
        let store = HttpBlobStore::new("http://127.0.0.1:9", None);
        assert!(matches!(
            store.list("config").await,
            Err(StorageError::NotConfigured(_))
        ));
    }

    // Minimal stand-in for the blob REST API.
    #[derive(Default)]
    struct MockApi {
        base: String,
        objects: HashMap<String, (String, String)>,
        counter: u64,
    }

    type Shared = Arc<Mutex<MockApi>>;

    fn authorized(headers: &HeaderMap) -> bool {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(|v| v == "Bearer test-token")
            .unwrap_or(false)
    }

    async fn mock_list(
        State(api): State<Shared>,
        headers: HeaderMap,
        Query(params): Query<HashMap<String, String>>,
    ) -> Result<Json<Value>, StatusCode> {
        if !authorized(&headers) {
            return Err(StatusCode::FORBIDDEN);
        }
        let api = api.lock().await;
        let prefix = params.get("prefix").cloned().unwrap_or_default();
        let blobs: Vec<Value> = api
            .objects
            .iter()
            .filter(|(path, _)| path.starts_with(&prefix))
            .map(|(path, (_, uploaded))| {
                json!({
                    "url": format!("{}/files/{}", api.base, path),
                    "pathname": path,
                    "uploadedAt": uploaded,
                })
            })
            .collect();
        Ok(Json(json!({ "blobs": blobs, "hasMore": false })))
    }

    async fn mock_put(
        State(api): State<Shared>,
        headers: HeaderMap,
        Path(pathname): Path<String>,
        body: String,
    ) -> Result<Json<Value>, StatusCode> {
        if !authorized(&headers) {
            return Err(StatusCode::FORBIDDEN);
        }
        let mut api = api.lock().await;
        api.counter += 1;
        let stem = pathname.trim_end_matches(".json");
        let stored = format!("{}-{:08}.json", stem, api.counter);
        let uploaded = format!("2026-01-01T00:00:{:02}Z", api.counter);
        api.objects.insert(stored.clone(), (body, uploaded.clone()));
        Ok(Json(json!({
            "url": format!("{}/files/{}", api.base, stored),
            "pathname": stored,
            "uploadedAt": uploaded,
        })))
    }

    async fn mock_delete(
        State(api): State<Shared>,
        headers: HeaderMap,
        Json(req): Json<Value>,
    ) -> StatusCode {
        if !authorized(&headers) {
            return StatusCode::FORBIDDEN;
        }
        let mut api = api.lock().await;
        for url in req["urls"].as_array().cloned().unwrap_or_default() {
            if let Some(path) = url.as_str().and_then(|u| u.rsplit('/').next()) {
                api.objects.remove(path);
            }
        }
        StatusCode::OK
    }

    async fn mock_file(
        State(api): State<Shared>,
        Path(pathname): Path<String>,
    ) -> Result<String, StatusCode> {
        let api = api.lock().await;
        api.objects
            .get(&pathname)
            .map(|(body, _)| body.clone())
            .ok_or(StatusCode::NOT_FOUND)
    }

    async fn spawn_mock_api() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let state: Shared = Arc::new(Mutex::new(MockApi {
            base: base.clone(),
            ..MockApi::default()
        }));
        let app = Router::new()
            .route("/", get(mock_list))
            .route("/delete", post(mock_delete))
            .route("/files/:pathname", get(mock_file))
            .route("/:pathname", put(mock_put))
            .with_state(state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        base
    }

    #[tokio::test]
    async fn http_store_round_trips_through_rest_api() {
        let base = spawn_mock_api().await;
        let store = Arc::new(HttpBlobStore::new(&base, Some("test-token".to_string())));
        let backend = BlobBackend::new(store.clone());

        backend
            .write_document(Document::Config, &json!({"apiKeys": [], "n": 1}), None)
            .await
            .unwrap();
        backend
            .write_document(Document::Config, &json!({"apiKeys": [], "n": 2}), None)
            .await
            .unwrap();

        let listed = store.list("config").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(
            backend.read_document(Document::Config).await.unwrap(),
            Some(json!({"apiKeys": [], "n": 2}))
        );
    }

    #[tokio::test]
    async fn http_store_rejects_bad_token() {
        let base = spawn_mock_api().await;
        let store = HttpBlobStore::new(&base, Some("wrong".to_string()));
        assert!(matches!(
            store.list("config").await,
            Err(StorageError::Status { status: 403, .. })
        ));
    }
}
