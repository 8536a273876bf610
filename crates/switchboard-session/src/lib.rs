//! Session continuity and storage for the messaging gateway.
//!
//! Provides:
//! - `SessionManager` - Expiring per-dialog session records
//! - `SessionCache` backends (memory)
//! - `MemoryObjectStore` - Bucket/key document storage

pub mod manager;
pub mod storage;

pub use manager::{NewSession, Session, SessionConfig, SessionError, SessionManager, TtlPolicy};
pub use storage::{CacheError, SessionCache};

#[cfg(feature = "memory")]
pub use storage::{MemoryCache, MemoryObjectStore};
