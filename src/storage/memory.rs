//! In-memory blob and key-value stores (non-persistent, for testing).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::DateTime;
use serde_json::Value;

use super::blob::{BlobObject, BlobStore};
use super::kv::KvTransport;
use super::StorageError;

/// Object store that appends a counter suffix to every upload.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<Vec<(BlobObject, String)>>,
    counter: AtomicI64,
    pub fail_deletes: AtomicBool,
    pub fail_puts: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pathnames_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(o, _)| o.pathname.starts_with(prefix))
            .map(|(o, _)| o.pathname.clone())
            .collect()
    }

    /// Raw body of the newest object under `prefix`.
    pub fn latest_body(&self, prefix: &str) -> Option<String> {
        self.objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(o, _)| o.pathname.starts_with(prefix))
            .max_by_key(|(o, _)| o.uploaded_at)
            .map(|(_, body)| body.clone())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn list(&self, prefix: &str) -> Result<Vec<BlobObject>, StorageError> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(o, _)| o.pathname.starts_with(prefix))
            .map(|(o, _)| o.clone())
            .collect())
    }

    async fn fetch(&self, object: &BlobObject) -> Result<String, StorageError> {
        self.objects
            .lock()
            .unwrap()
            .iter()
            .find(|(o, _)| o.url == object.url)
            .map(|(_, body)| body.clone())
            .ok_or_else(|| StorageError::Status {
                status: 404,
                body: object.url.clone(),
            })
    }

    async fn put(&self, pathname: &str, body: String) -> Result<BlobObject, StorageError> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(StorageError::Remote("upload rejected".to_string()));
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let stem = pathname.trim_end_matches(".json");
        let stored = format!("{}-{:06}.json", stem, n);
        let object = BlobObject {
            url: format!("memory://{}", stored),
            pathname: stored,
            uploaded_at: DateTime::from_timestamp(1_700_000_000 + n, 0),
        };
        self.objects.lock().unwrap().push((object.clone(), body));
        Ok(object)
    }

    async fn delete(&self, object: &BlobObject) -> Result<(), StorageError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StorageError::Remote("delete rejected".to_string()));
        }
        self.objects
            .lock()
            .unwrap()
            .retain(|(o, _)| o.url != object.url);
        Ok(())
    }
}

/// Key-value transport implementing the GET/SET/SETEX/DEL commands.
#[derive(Default)]
pub struct MemoryKvTransport {
    entries: Mutex<HashMap<String, (String, Option<u64>)>>,
}

impl MemoryKvTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// TTL recorded with the last write of `key`.
    pub fn ttl_of(&self, key: &str) -> Option<u64> {
        self.entries.lock().unwrap().get(key).and_then(|(_, ttl)| *ttl)
    }

    pub fn raw(&self, key: &str) -> Option<String> {
        self.entries.lock().unwrap().get(key).map(|(v, _)| v.clone())
    }
}

fn arg_str(args: &[Value], index: usize) -> Result<String, StorageError> {
    match args.get(index) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Ok(other.to_string()),
        None => Err(StorageError::Remote("wrong number of arguments".to_string())),
    }
}

#[async_trait]
impl KvTransport for MemoryKvTransport {
    async fn command(&self, args: Vec<Value>) -> Result<Value, StorageError> {
        let name = arg_str(&args, 0)?;
        let mut entries = self.entries.lock().unwrap();
        match name.as_str() {
            "GET" => Ok(entries
                .get(&arg_str(&args, 1)?)
                .map(|(v, _)| Value::String(v.clone()))
                .unwrap_or(Value::Null)),
            "SET" => {
                entries.insert(arg_str(&args, 1)?, (arg_str(&args, 2)?, None));
                Ok(Value::String("OK".to_string()))
            }
            "SETEX" => {
                let ttl = arg_str(&args, 2)?
                    .parse()
                    .map_err(|_| StorageError::Remote("invalid expire time".to_string()))?;
                entries.insert(arg_str(&args, 1)?, (arg_str(&args, 3)?, Some(ttl)));
                Ok(Value::String("OK".to_string()))
            }
            "DEL" => Ok(Value::from(
                entries.remove(&arg_str(&args, 1)?).map(|_| 1).unwrap_or(0),
            )),
            other => Err(StorageError::Remote(format!("unknown command {}", other))),
        }
    }
}
