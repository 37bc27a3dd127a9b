//! Completion Hub
//!
//! Routes the outcome of a processed command back to the producer waiting
//! on its correlation id. Each completion reaches at most one waiter.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};

use crate::error::{Error, Result};

/// Pending completion of one command
pub struct Completion {
    correlation_id: String,
    rx: oneshot::Receiver<Result<()>>,
}

impl Completion {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Wait for the outcome, optionally bounded
    pub async fn wait(self, limit: Option<Duration>) -> Result<()> {
        let Completion { correlation_id, rx } = self;
        let received = match limit {
            Some(limit) => tokio::time::timeout(limit, rx)
                .await
                .map_err(|_| Error::CompletionTimeout(correlation_id.clone()))?,
            None => rx.await,
        };
        received.map_err(|_| Error::CompletionDropped(correlation_id))?
    }
}

/// Waiters by correlation id
#[derive(Default)]
pub struct CompletionHub {
    waiters: Mutex<HashMap<String, oneshot::Sender<Result<()>>>>,
}

impl CompletionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter; must happen before the command is published
    pub async fn register(&self, correlation_id: impl Into<String>) -> Completion {
        let correlation_id = correlation_id.into();
        let (tx, rx) = oneshot::channel();
        if self
            .waiters
            .lock()
            .await
            .insert(correlation_id.clone(), tx)
            .is_some()
        {
            tracing::warn!("Replaced waiter for correlation id {}", correlation_id);
        }
        Completion { correlation_id, rx }
    }

    /// Deliver an outcome. Returns whether a waiter received it.
    pub async fn complete(&self, correlation_id: &str, result: Result<()>) -> bool {
        let waiter = self.waiters.lock().await.remove(correlation_id);
        match waiter {
            Some(tx) => tx.send(result).is_ok(),
            None => {
                tracing::debug!("No waiter for completion {}", correlation_id);
                false
            }
        }
    }

    /// Forget a waiter that gave up
    pub async fn cancel(&self, correlation_id: &str) {
        self.waiters.lock().await.remove(correlation_id);
    }

    pub async fn pending(&self) -> usize {
        self.waiters.lock().await.len()
    }
}
