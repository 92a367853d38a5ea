//! External collaborator interfaces (§6): `RequestQueueClient`,
//! `KeyValueStore`, and `Dataset`. These are named abstract interfaces in
//! the spec — concrete HTTP/cloud backends are out of scope for the core.
//! This module provides the trait boundary plus a default in-memory
//! implementation and a simple on-disk JSON-file implementation, grounded
//! on the external-store client shape this codebase already uses
//! (`consul.rs`'s KV client) and its local JSON data-source reader
//! (`data_source.rs`).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::fs;
use tokio::sync::Mutex;

use crate::errors::QueueError;
use crate::request::{QueueOperationInfo, Request, RequestId};

/// Durable storage for `Request`s, keyed by `uniqueKey` for dedup and by
/// `id` for lookup/update.
#[async_trait]
pub trait RequestQueueClient: Send + Sync {
    async fn add_request(
        &self,
        request: Request,
        forefront: bool,
    ) -> Result<QueueOperationInfo, QueueError>;

    async fn get_request(&self, id: &str) -> Result<Option<Request>, QueueError>;

    /// Ordered list of up to `limit` pending (unhandled) requests, oldest
    /// first, forefront-inserted ones at the front.
    async fn list_head(&self, limit: usize) -> Result<Vec<Request>, QueueError>;

    async fn update_request(&self, request: Request) -> Result<(), QueueError>;

    async fn batch_add_requests(
        &self,
        requests: Vec<Request>,
        forefront: bool,
    ) -> Result<Vec<QueueOperationInfo>, QueueError> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            results.push(self.add_request(request, forefront).await?);
        }
        Ok(results)
    }

    async fn is_empty(&self) -> Result<bool, QueueError>;
}

/// `getValue`/`setValue`/`listKeys` against the default key-value store.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get_value(&self, key: &str) -> Result<Option<Value>, QueueError>;
    async fn set_value(&self, key: &str, value: Value) -> Result<(), QueueError>;
    async fn list_keys(&self, exclusive_start_key: Option<&str>, limit: usize) -> Result<Vec<String>, QueueError>;
}

/// Append-only dataset sink (`pushData`).
#[async_trait]
pub trait Dataset: Send + Sync {
    async fn push_data(&self, item: Value) -> Result<(), QueueError>;
}

/// In-memory default for all three interfaces, used by tests and as the
/// fallback when `CRAWLEE_STORAGE_DIR` is unset.
#[derive(Default)]
pub struct InMemoryStore {
    requests_by_id: Mutex<HashMap<RequestId, Request>>,
    id_by_unique_key: Mutex<HashMap<String, RequestId>>,
    next_id: std::sync::atomic::AtomicU64,
    kv: Mutex<HashMap<String, Value>>,
    dataset: Mutex<Vec<Value>>,
}

impl InMemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn allocate_id(&self) -> RequestId {
        let n = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        // Zero-padded so lexical ordering (used by `list_head`'s sort)
        // agrees with insertion order past the ninth request.
        format!("req-{:020}", n)
    }

    pub fn dataset_items(&self) -> Vec<Value> {
        // test/diagnostic accessor; blocking_lock is safe here because
        // this store never holds the lock across an await in the same path.
        self.dataset.blocking_lock().clone()
    }
}

#[async_trait]
impl RequestQueueClient for InMemoryStore {
    async fn add_request(
        &self,
        mut request: Request,
        forefront: bool,
    ) -> Result<QueueOperationInfo, QueueError> {
        let _ = forefront; // ordering is the in-memory queue head's job, not storage's
        let mut by_key = self.id_by_unique_key.lock().await;
        if let Some(existing_id) = by_key.get(&request.unique_key).cloned() {
            let by_id = self.requests_by_id.lock().await;
            let was_already_handled = by_id
                .get(&existing_id)
                .map(|r| r.is_handled())
                .unwrap_or(false);
            return Ok(QueueOperationInfo {
                request_id: existing_id,
                was_already_present: true,
                was_already_handled,
            });
        }

        let id = self.allocate_id();
        request.id = id.clone();
        by_key.insert(request.unique_key.clone(), id.clone());
        self.requests_by_id.lock().await.insert(id.clone(), request);

        Ok(QueueOperationInfo {
            request_id: id,
            was_already_present: false,
            was_already_handled: false,
        })
    }

    async fn get_request(&self, id: &str) -> Result<Option<Request>, QueueError> {
        Ok(self.requests_by_id.lock().await.get(id).cloned())
    }

    async fn list_head(&self, limit: usize) -> Result<Vec<Request>, QueueError> {
        let by_id = self.requests_by_id.lock().await;
        let mut pending: Vec<Request> = by_id
            .values()
            .filter(|r| !r.is_handled())
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.id.cmp(&b.id));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn update_request(&self, request: Request) -> Result<(), QueueError> {
        self.requests_by_id
            .lock()
            .await
            .insert(request.id.clone(), request);
        Ok(())
    }

    async fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self
            .requests_by_id
            .lock()
            .await
            .values()
            .all(|r| r.is_handled()))
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get_value(&self, key: &str) -> Result<Option<Value>, QueueError> {
        Ok(self.kv.lock().await.get(key).cloned())
    }

    async fn set_value(&self, key: &str, value: Value) -> Result<(), QueueError> {
        self.kv.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn list_keys(&self, exclusive_start_key: Option<&str>, limit: usize) -> Result<Vec<String>, QueueError> {
        let kv = self.kv.lock().await;
        let mut keys: Vec<String> = kv.keys().cloned().collect();
        keys.sort();
        if let Some(start) = exclusive_start_key {
            keys.retain(|k| k.as_str() > start);
        }
        keys.truncate(limit);
        Ok(keys)
    }
}

#[async_trait]
impl Dataset for InMemoryStore {
    async fn push_data(&self, item: Value) -> Result<(), QueueError> {
        self.dataset.lock().await.push(item);
        Ok(())
    }
}

/// On-disk `KeyValueStore` rooted at `CRAWLEE_STORAGE_DIR` (default
/// `./storage`), one JSON file per key. Grounded on this codebase's local
/// JSON file reader idiom (`data_source.rs`), generalized from read-only
/// fixture loading to a read/write store.
pub struct FileKeyValueStore {
    root: PathBuf,
}

impl FileKeyValueStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FileKeyValueStore { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", key))
    }
}

#[async_trait]
impl KeyValueStore for FileKeyValueStore {
    async fn get_value(&self, key: &str) -> Result<Option<Value>, QueueError> {
        let path = self.path_for(key);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(QueueError::Storage(e)),
        }
    }

    async fn set_value(&self, key: &str, value: Value) -> Result<(), QueueError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(QueueError::Storage)?;
        let bytes = serde_json::to_vec_pretty(&value)?;
        fs::write(self.path_for(key), bytes)
            .await
            .map_err(QueueError::Storage)
    }

    async fn list_keys(&self, exclusive_start_key: Option<&str>, limit: usize) -> Result<Vec<String>, QueueError> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(QueueError::Storage(e)),
        };
        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(QueueError::Storage)? {
            if let Some(name) = entry.path().file_stem().and_then(|s| s.to_str()) {
                keys.push(name.to_string());
            }
        }
        keys.sort();
        if let Some(start) = exclusive_start_key {
            keys.retain(|k| k.as_str() > start);
        }
        keys.truncate(limit);
        Ok(keys)
    }
}
