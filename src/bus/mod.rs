//! Command Bus Module
//!
//! Messaging primitive the data writer is built on: publish to a named
//! exchange, then either consume its persistent queue (optionally as the
//! exclusive consumer) or subscribe to a broadcast copy of every message.
//! Deliveries carry a manual acknowledgement hook.

mod loopback;

pub use loopback::LoopbackBus;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;

/// Bus-assigned identifier of a single delivery
pub type DeliveryTag = u64;

/// How a listener attaches to an exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ListenMethod {
    /// Take messages off the exchange's persistent queue
    Consume,
    /// Receive a copy of every message published after subscribing
    Subscribe,
}

impl std::fmt::Display for ListenMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenMethod::Consume => write!(f, "consume"),
            ListenMethod::Subscribe => write!(f, "subscribe"),
        }
    }
}

type AckHook = Box<dyn FnOnce(DeliveryTag) + Send>;

/// A message handed to a listener
pub struct Delivery {
    /// Delivery tag
    pub tag: DeliveryTag,
    /// Raw message body
    pub payload: Vec<u8>,
    acker: Option<AckHook>,
}

impl Delivery {
    /// Create a delivery with an acknowledgement hook
    pub fn new(
        tag: DeliveryTag,
        payload: Vec<u8>,
        acker: impl FnOnce(DeliveryTag) + Send + 'static,
    ) -> Self {
        Self {
            tag,
            payload,
            acker: Some(Box::new(acker)),
        }
    }

    /// Acknowledge the delivery. Only the first call has an effect.
    pub fn ack(&mut self) {
        if let Some(acker) = self.acker.take() {
            acker(self.tag);
        }
    }

    /// Whether the delivery has been acknowledged
    pub fn is_acked(&self) -> bool {
        self.acker.is_none()
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("tag", &self.tag)
            .field("payload_len", &self.payload.len())
            .field("acked", &self.is_acked())
            .finish()
    }
}

/// Stream of deliveries for one listener
pub struct Subscription {
    exchange: String,
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl Subscription {
    /// Wrap a delivery channel
    pub fn new(exchange: impl Into<String>, rx: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Self {
            exchange: exchange.into(),
            rx,
        }
    }

    /// Exchange this subscription listens on
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Next delivery, in publish order. `None` once the bus side is gone.
    pub async fn next(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

/// Messaging primitive consumed by the data writer
#[async_trait::async_trait]
pub trait CommandBus: Send + Sync {
    /// Human-readable bus name (for logging)
    fn name(&self) -> &str;

    /// Resolve once the bus connection is usable
    async fn ready(&self) -> Result<()>;

    /// Publish a message on an exchange
    async fn send(&self, exchange: &str, payload: Vec<u8>) -> Result<DeliveryTag>;

    /// Attach to the exchange's persistent queue
    async fn consume(&self, exchange: &str, exclusive: bool) -> Result<Subscription>;

    /// Attach as a broadcast subscriber
    async fn subscribe(&self, exchange: &str) -> Result<Subscription>;

    /// Attach with the given method. Consumers are always exclusive.
    async fn listen(&self, exchange: &str, method: ListenMethod) -> Result<Subscription> {
        match method {
            ListenMethod::Consume => self.consume(exchange, true).await,
            ListenMethod::Subscribe => self.subscribe(exchange).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_ack_runs_once() {
        let acked = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&acked);
        let mut delivery = Delivery::new(7, b"{}".to_vec(), move |tag| {
            counter.fetch_add(tag, Ordering::SeqCst);
        });

        assert!(!delivery.is_acked());
        delivery.ack();
        delivery.ack();
        assert!(delivery.is_acked());
        assert_eq!(acked.load(Ordering::SeqCst), 7);
    }
}
