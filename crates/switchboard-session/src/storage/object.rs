//! In-memory bucket/key object store.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use serde_json::Value;
use switchboard_core::traits::{ObjectStore, ObjectStoreError};

type Buckets = HashMap<String, HashMap<String, Value>>;

/// Object store whose buckets are namespaced by a prefix.
///
/// Several stores can share one backend; each only sees and purges the
/// buckets under its own prefix.
#[derive(Clone)]
pub struct MemoryObjectStore {
    bucket_prefix: String,
    buckets: Arc<RwLock<Buckets>>,
}

impl MemoryObjectStore {
    /// Create a store with its own backend.
    #[must_use]
    pub fn new(bucket_prefix: impl Into<String>) -> Self {
        Self {
            bucket_prefix: bucket_prefix.into(),
            buckets: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Create another store over the same backend with a different prefix.
    #[must_use]
    pub fn with_prefix(&self, bucket_prefix: impl Into<String>) -> Self {
        Self {
            bucket_prefix: bucket_prefix.into(),
            buckets: Arc::clone(&self.buckets),
        }
    }

    fn bucket_name(&self, bucket: &str) -> String {
        format!("{}{bucket}", self.bucket_prefix)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn store(&self, bucket: &str, key: &str, value: Value) -> Result<(), ObjectStoreError> {
        self.buckets
            .write()
            .map_err(|e| ObjectStoreError::Internal(e.to_string()))?
            .entry(self.bucket_name(bucket))
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn load(&self, bucket: &str, key: &str) -> Result<Value, ObjectStoreError> {
        self.buckets
            .read()
            .map_err(|e| ObjectStoreError::Internal(e.to_string()))?
            .get(&self.bucket_name(bucket))
            .and_then(|objects| objects.get(key))
            .cloned()
            .ok_or_else(|| ObjectStoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    async fn purge_all(&self) -> Result<usize, ObjectStoreError> {
        let mut buckets = self
            .buckets
            .write()
            .map_err(|e| ObjectStoreError::Internal(e.to_string()))?;

        let mut purged = 0;
        buckets.retain(|name, objects| {
            if name.starts_with(&self.bucket_prefix) {
                purged += objects.len();
                false
            } else {
                true
            }
        });
        tracing::debug!(prefix = %self.bucket_prefix, purged, "Purged object store");
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_store_and_load() {
        let store = MemoryObjectStore::new("test.");
        store
            .store("deliveries", "m1", json!({"status": "acked"}))
            .await
            .unwrap();

        let value = store.load("deliveries", "m1").await.unwrap();
        assert_eq!(value["status"], "acked");
    }

    #[tokio::test]
    async fn test_load_missing() {
        let store = MemoryObjectStore::new("test.");
        let err = store.load("deliveries", "nope").await.unwrap_err();
        assert!(matches!(err, ObjectStoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_purge_only_touches_own_prefix() {
        let ours = MemoryObjectStore::new("test.");
        let theirs = ours.with_prefix("prod.");

        ours.store("a", "1", json!(1)).await.unwrap();
        ours.store("b", "2", json!(2)).await.unwrap();
        theirs.store("a", "1", json!(3)).await.unwrap();

        assert_eq!(ours.purge_all().await.unwrap(), 2);
        assert!(ours.load("a", "1").await.is_err());
        assert_eq!(theirs.load("a", "1").await.unwrap(), json!(3));
    }
}
