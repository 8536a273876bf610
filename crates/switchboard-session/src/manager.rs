//! Session manager for multi-request dialogs.

use std::{collections::HashMap, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::storage::{CacheError, SessionCache};

/// Default maximum session length in seconds.
pub const DEFAULT_MAX_SESSION_LENGTH: u64 = 600;

/// Session manager error.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),
    #[error("Session already exists: {0}")]
    Duplicate(String),
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("Corrupt session record: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// How a successful load affects the expiry window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtlPolicy {
    /// Every load restarts the window.
    #[default]
    Sliding,
    /// The window is fixed at creation.
    Fixed,
}

fn default_key_prefix() -> String {
    "session".to_string()
}

const fn default_max_session_length() -> u64 {
    DEFAULT_MAX_SESSION_LENGTH
}

/// Session store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Namespace for cache keys (`<prefix>:<session_id>`).
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Session lifetime in seconds.
    #[serde(default = "default_max_session_length")]
    pub max_session_length: u64,
    #[serde(default)]
    pub ttl_policy: TtlPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            max_session_length: DEFAULT_MAX_SESSION_LENGTH,
            ttl_policy: TtlPolicy::default(),
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn with_prefix(key_prefix: impl Into<String>) -> Self {
        Self {
            key_prefix: key_prefix.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.max_session_length)
    }
}

/// Addresses and attributes for a new session.
#[derive(Debug, Clone, Default)]
pub struct NewSession {
    pub from_addr: String,
    pub to_addr: String,
    pub attrs: HashMap<String, Value>,
}

impl NewSession {
    #[must_use]
    pub fn new(from_addr: impl Into<String>, to_addr: impl Into<String>) -> Self {
        Self {
            from_addr: from_addr.into(),
            to_addr: to_addr.into(),
            attrs: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }
}

/// Persisted continuity record for one dialog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub from_addr: String,
    pub to_addr: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub attrs: HashMap<String, Value>,
}

/// Session store over an expiring cache.
///
/// Holds no session state itself; every call goes to the cache, so any
/// number of managers can share one backend.
pub struct SessionManager<C: SessionCache> {
    cache: C,
    config: SessionConfig,
}

impl<C: SessionCache> SessionManager<C> {
    /// Create a new session manager.
    #[must_use]
    pub const fn new(cache: C, config: SessionConfig) -> Self {
        Self { cache, config }
    }

    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    #[must_use]
    pub const fn cache(&self) -> &C {
        &self.cache
    }

    fn key(&self, session_id: &str) -> String {
        format!("{}:{session_id}", self.config.key_prefix)
    }

    fn expiry_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.config.ttl())
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Create a session.
    ///
    /// # Errors
    /// Returns `SessionError::Duplicate` if a live session already uses
    /// this id. Exactly one of several concurrent creators succeeds.
    pub async fn create_session(
        &self,
        session_id: &str,
        new: NewSession,
    ) -> Result<Session, SessionError> {
        let created_at = Utc::now();
        let session = Session {
            session_id: session_id.to_string(),
            from_addr: new.from_addr,
            to_addr: new.to_addr,
            created_at,
            expires_at: self.expiry_from(created_at),
            attrs: new.attrs,
        };

        let record = serde_json::to_string(&session)?;
        if !self
            .cache
            .set_if_absent(&self.key(session_id), record, self.config.ttl())
            .await?
        {
            return Err(SessionError::Duplicate(session_id.to_string()));
        }

        tracing::debug!(session_id, "Session created");
        Ok(session)
    }

    /// Load a live session, restarting its expiry under the sliding policy.
    ///
    /// The stored record is never rewritten here. Under the sliding policy
    /// the expiry is restarted first and the record read afterwards, so the
    /// result is always the record currently stored under the id, with
    /// `expires_at` reflecting the refresh.
    ///
    /// # Errors
    /// Returns `SessionError::NotFound` if the session never existed,
    /// expired, or was closed.
    pub async fn load_session(&self, session_id: &str) -> Result<Session, SessionError> {
        let key = self.key(session_id);
        let not_found = || SessionError::NotFound(session_id.to_string());

        let refreshed_until = match self.config.ttl_policy {
            TtlPolicy::Sliding => {
                let expires_at = self.expiry_from(Utc::now());
                if !self.cache.touch(&key, self.config.ttl()).await? {
                    return Err(not_found());
                }
                Some(expires_at)
            }
            TtlPolicy::Fixed => None,
        };

        let record = self.cache.get(&key).await?.ok_or_else(not_found)?;
        let mut session: Session = serde_json::from_str(&record)?;
        if let Some(expires_at) = refreshed_until {
            session.expires_at = expires_at;
        }
        Ok(session)
    }

    /// Close a session. Closing an unknown session is not an error.
    ///
    /// # Errors
    /// Returns error only if the cache fails.
    pub async fn close_session(&self, session_id: &str) -> Result<(), SessionError> {
        if self.cache.delete(&self.key(session_id)).await? {
            tracing::debug!(session_id, "Session closed");
        }
        Ok(())
    }

    /// Cancel all background expiry work.
    pub async fn stop(&self) {
        self.cache.shutdown().await;
    }
}
