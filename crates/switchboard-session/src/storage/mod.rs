//! Cache capability and storage implementations.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "memory")]
pub mod object;

#[cfg(feature = "memory")]
pub use memory::MemoryCache;

#[cfg(feature = "memory")]
pub use object::MemoryObjectStore;

/// Cache error.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache unavailable: {0}")]
    Unavailable(String),
    #[error("Cache error: {0}")]
    Internal(String),
}

/// Key/value cache with per-key expiry.
///
/// Each operation must be atomic for its key. Expired keys behave exactly
/// like keys that were never written.
#[async_trait]
pub trait SessionCache: Send + Sync {
    /// Read a live value.
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Write `value` only if no live value exists (`SET NX EX`).
    ///
    /// Returns `false` if the key was already live.
    async fn set_if_absent(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<bool, CacheError>;

    /// Restart the expiry of a live value without changing it (`EXPIRE`).
    ///
    /// Returns `false` if the key was not live.
    async fn touch(&self, key: &str, ttl: Duration) -> Result<bool, CacheError>;

    /// Delete a key. Returns whether a live value was removed.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// Release background resources such as expiry timers.
    async fn shutdown(&self) {}
}

#[async_trait]
impl<T: SessionCache + ?Sized> SessionCache for Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        (**self).get(key).await
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        (**self).set_if_absent(key, value, ttl).await
    }

    async fn touch(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        (**self).touch(key, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        (**self).delete(key).await
    }

    async fn shutdown(&self) {
        (**self).shutdown().await;
    }
}
