//! Correlation of held-open HTTP requests with their outbound replies.

use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::TransportError;

type Outcome = Result<String, String>;

/// Requests waiting for a reply, keyed by inbound message id.
#[derive(Clone, Default)]
pub struct PendingRequests {
    waiting: Arc<DashMap<String, oneshot::Sender<Outcome>>>,
}

impl PendingRequests {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start waiting for the reply to `message_id`.
    ///
    /// Must be called before the message is published so a fast reply
    /// cannot be missed.
    #[must_use]
    pub fn register(&self, message_id: &str) -> PendingReply {
        let (tx, rx) = oneshot::channel();
        self.waiting.insert(message_id.to_string(), tx);
        PendingReply {
            message_id: message_id.to_string(),
            rx,
            waiting: Arc::clone(&self.waiting),
        }
    }

    /// Complete the request for `message_id` with `body`.
    ///
    /// Returns `false` if nobody is waiting any more.
    pub fn finish(&self, message_id: &str, body: String) -> bool {
        self.complete(message_id, Ok(body))
    }

    /// Fail the request for `message_id` instead of letting it time out.
    ///
    /// Returns `false` if nobody is waiting any more.
    pub fn fail(&self, message_id: &str, reason: impl Into<String>) -> bool {
        self.complete(message_id, Err(reason.into()))
    }

    fn complete(&self, message_id: &str, outcome: Outcome) -> bool {
        self.waiting
            .remove(message_id)
            .is_some_and(|(_, tx)| tx.send(outcome).is_ok())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }
}

/// A registered request. Dropping it unregisters the request.
pub struct PendingReply {
    message_id: String,
    rx: oneshot::Receiver<Outcome>,
    waiting: Arc<DashMap<String, oneshot::Sender<Outcome>>>,
}

impl PendingReply {
    /// Wait for the reply body.
    ///
    /// # Errors
    /// - `ReplyFailed` if the reply could not be rendered.
    /// - `Timeout` if no reply arrives in time.
    pub async fn wait(mut self, timeout: Duration) -> Result<String, TransportError> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(Ok(body))) => Ok(body),
            Ok(Ok(Err(reason))) => Err(TransportError::ReplyFailed(reason)),
            Ok(Err(_)) => Err(TransportError::ReplyFailed("reply dropped".into())),
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.waiting.remove(&self.message_id);
    }
}
