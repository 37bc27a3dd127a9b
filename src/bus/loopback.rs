//! Loopback Bus
//!
//! In-process implementation of [`CommandBus`]. Every exchange has one
//! persistent queue and a fan-out list of broadcast subscribers. While no
//! consumer is attached the queue keeps a bounded backlog, oldest messages
//! dropped first, which is handed over to the next consumer.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use super::{CommandBus, Delivery, DeliveryTag, Subscription};
use crate::error::{Error, Result};

/// Messages kept per exchange while nobody consumes
pub const DEFAULT_BACKLOG: usize = 1024;

/// Per-exchange routing state
struct Exchange {
    /// Attached queue consumer
    consumer: Option<mpsc::UnboundedSender<Delivery>>,
    /// Whether the attached consumer asked for exclusivity
    exclusive: bool,
    /// Published while no consumer was attached
    backlog: VecDeque<(DeliveryTag, Vec<u8>)>,
    /// Broadcast subscribers
    subscribers: Vec<mpsc::UnboundedSender<Delivery>>,
}

impl Exchange {
    fn new() -> Self {
        Self {
            consumer: None,
            exclusive: false,
            backlog: VecDeque::new(),
            subscribers: Vec::new(),
        }
    }

    /// Live consumer, forgetting one that went away
    fn live_consumer(&mut self) -> Option<&mpsc::UnboundedSender<Delivery>> {
        if self.consumer.as_ref().map_or(false, |tx| tx.is_closed()) {
            self.consumer = None;
            self.exclusive = false;
        }
        self.consumer.as_ref()
    }
}

/// In-process command bus
pub struct LoopbackBus {
    /// Bus name
    name: String,
    /// Exchanges by name
    exchanges: Mutex<HashMap<String, Exchange>>,
    /// Backlog bound per exchange
    backlog_limit: usize,
    /// Next delivery tag
    next_tag: AtomicU64,
    /// Deliveries handed out
    delivered: Arc<AtomicU64>,
    /// Deliveries acknowledged
    acked: Arc<AtomicU64>,
}

impl LoopbackBus {
    /// Create a new loopback bus
    pub fn new() -> Self {
        Self::named("loopback interface")
    }

    /// Create a loopback bus with a custom name
    pub fn named(name: impl Into<String>) -> Self {
        Self::with_backlog(name, DEFAULT_BACKLOG)
    }

    /// Create a loopback bus keeping at most `backlog_limit` unconsumed messages per exchange
    pub fn with_backlog(name: impl Into<String>, backlog_limit: usize) -> Self {
        Self {
            name: name.into(),
            exchanges: Mutex::new(HashMap::new()),
            backlog_limit,
            next_tag: AtomicU64::new(1),
            delivered: Arc::new(AtomicU64::new(0)),
            acked: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of deliveries handed to listeners and not yet acknowledged
    pub fn unacked(&self) -> u64 {
        let delivered = self.delivered.load(Ordering::SeqCst);
        delivered.saturating_sub(self.acked.load(Ordering::SeqCst))
    }

    /// Number of messages waiting for a consumer on an exchange
    pub async fn backlog(&self, exchange: &str) -> usize {
        let exchanges = self.exchanges.lock().await;
        exchanges.get(exchange).map_or(0, |e| e.backlog.len())
    }

    /// Number of live subscribers on an exchange
    pub async fn subscriber_count(&self, exchange: &str) -> usize {
        let exchanges = self.exchanges.lock().await;
        exchanges
            .get(exchange)
            .map(|e| e.subscribers.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }

    fn delivery(&self, tag: DeliveryTag, payload: Vec<u8>) -> Delivery {
        let acked = Arc::clone(&self.acked);
        self.delivered.fetch_add(1, Ordering::SeqCst);

        Delivery::new(tag, payload, move |_| {
            acked.fetch_add(1, Ordering::SeqCst);
        })
    }

    /// Hand a delivery to a listener; a listener that is gone counts it as settled
    fn hand_over(&self, listener: &mpsc::UnboundedSender<Delivery>, delivery: Delivery) -> bool {
        if listener.send(delivery).is_ok() {
            true
        } else {
            self.acked.fetch_add(1, Ordering::SeqCst);
            false
        }
    }
}

impl Default for LoopbackBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl CommandBus for LoopbackBus {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ready(&self) -> Result<()> {
        Ok(())
    }

    async fn send(&self, exchange: &str, payload: Vec<u8>) -> Result<DeliveryTag> {
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        let mut exchanges = self.exchanges.lock().await;
        let state = exchanges
            .entry(exchange.to_string())
            .or_insert_with(Exchange::new);

        // Subscribers that went away are pruned on the way
        let mut live = Vec::with_capacity(state.subscribers.len());
        for subscriber in state.subscribers.drain(..) {
            if self.hand_over(&subscriber, self.delivery(tag, payload.clone())) {
                live.push(subscriber);
            }
        }
        state.subscribers = live;

        let queued = match state.live_consumer() {
            Some(consumer) => self.hand_over(consumer, self.delivery(tag, payload.clone())),
            None => false,
        };
        if !queued {
            if self.backlog_limit == 0 {
                tracing::trace!("No consumer on exchange {}, message {} not queued", exchange, tag);
            } else {
                if state.backlog.len() >= self.backlog_limit {
                    if let Some((dropped, _)) = state.backlog.pop_front() {
                        tracing::debug!(
                            "Backlog of exchange {} full, dropped message {}",
                            exchange,
                            dropped
                        );
                    }
                }
                state.backlog.push_back((tag, payload));
            }
        }

        tracing::trace!("Published message {} on exchange {}", tag, exchange);
        Ok(tag)
    }

    async fn consume(&self, exchange: &str, exclusive: bool) -> Result<Subscription> {
        let mut exchanges = self.exchanges.lock().await;
        let state = exchanges
            .entry(exchange.to_string())
            .or_insert_with(Exchange::new);

        if state.live_consumer().is_some() {
            return if state.exclusive || exclusive {
                Err(Error::ExclusiveConsumer(exchange.to_string()))
            } else {
                Err(Error::Bus(format!(
                    "Queue on exchange {} is already being consumed",
                    exchange
                )))
            };
        }

        let (tx, rx) = mpsc::unbounded_channel();
        for (tag, payload) in state.backlog.drain(..) {
            self.hand_over(&tx, self.delivery(tag, payload));
        }
        state.consumer = Some(tx);
        state.exclusive = exclusive;
        Ok(Subscription::new(exchange, rx))
    }

    async fn subscribe(&self, exchange: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut exchanges = self.exchanges.lock().await;
        exchanges
            .entry(exchange.to_string())
            .or_insert_with(Exchange::new)
            .subscribers
            .push(tx);

        Ok(Subscription::new(exchange, rx))
    }
}
