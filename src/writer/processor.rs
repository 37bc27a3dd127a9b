//! Command Processor
//!
//! The only code path that mutates the content tables. Deliveries are
//! handled one at a time in bus order.

use std::sync::Arc;

use super::command::{Command, CommandEnvelope};
use super::completion::CompletionHub;
use crate::bus::{Delivery, Subscription};
use crate::error::{Error, Result};
use crate::state::{ReadinessGate, ReadinessSequence};
use crate::store::ContentStore;

pub struct CommandProcessor {
    store: Arc<ContentStore>,
    completions: Arc<CompletionHub>,
    gate: Arc<ReadinessGate>,
    sequence: Arc<dyn ReadinessSequence>,
}

impl CommandProcessor {
    pub fn new(
        store: Arc<ContentStore>,
        completions: Arc<CompletionHub>,
        gate: Arc<ReadinessGate>,
        sequence: Arc<dyn ReadinessSequence>,
    ) -> Self {
        Self {
            store,
            completions,
            gate,
            sequence,
        }
    }

    /// Consume until the bus closes the subscription
    pub async fn run(&self, mut subscription: Subscription) {
        tracing::info!("Command processor listening on {}", subscription.exchange());
        while let Some(delivery) = subscription.next().await {
            self.process(delivery).await;
        }
        tracing::info!("Command processor on {} stopped", subscription.exchange());
    }

    /// Handle a single delivery. Never fails; outcomes go to the completion hub.
    pub async fn process(&self, mut delivery: Delivery) {
        let ready = self.gate.ensure_ready(Arc::clone(&self.sequence)).await;

        // Acked before the effect: a failed command is not redelivered
        delivery.ack();

        let envelope = match CommandEnvelope::from_bytes(&delivery.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::error!("Invalid message received, delivery tag {}: {}", delivery.tag, e);
                return;
            }
        };

        if let Err(e) = ready {
            tracing::error!("Not ready, {} not applied: {}", envelope.action, e);
            self.complete(&envelope, Err(e)).await;
            return;
        }

        let command = match Command::from_envelope(&envelope) {
            Ok(command) => command,
            Err(Error::UnknownCommand(action)) => {
                tracing::warn!("Unknown action received: {:?}, delivery tag {}", action, delivery.tag);
                return;
            }
            Err(e) => {
                tracing::warn!("Rejected {}: {}", envelope.action, e);
                self.complete(&envelope, Err(e)).await;
                return;
            }
        };

        let result = self.apply(command).await;
        match &result {
            Ok(()) => tracing::debug!("Applied {} (tag {})", envelope.action, delivery.tag),
            Err(e) => tracing::warn!("Failed {} (tag {}): {}", envelope.action, delivery.tag, e),
        }
        self.complete(&envelope, result).await;
    }

    /// Apply a parsed command to the store
    pub async fn apply(&self, command: Command) -> Result<()> {
        match command {
            Command::SaveEntry(params) => {
                let uuid = params.entry_id()?;
                self.store
                    .save_entry(uuid, params.published, params.langs.as_ref())
                    .await
            }
            Command::RmEntry(params) => {
                let uuid = params.entry_id()?;
                self.store.rm_entry(uuid).await.map(|_| ())
            }
            Command::SetImages(params) => {
                let uuid = params.entry_id()?;
                self.store
                    .set_images(uuid, params.images(), params.delete_existing)
                    .await
            }
        }
    }

    async fn complete(&self, envelope: &CommandEnvelope, result: Result<()>) {
        match &envelope.correlation_id {
            Some(id) => {
                self.completions.complete(id, result).await;
            }
            None => tracing::debug!("{} carried no correlation id", envelope.action),
        }
    }
}
