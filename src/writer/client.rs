//! Producer Client
//!
//! Publishes write commands and waits for their completion.

use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::command::{Command, CommandEnvelope, RmEntryParams, SaveEntryParams, SetImagesParams};
use super::completion::CompletionHub;
use crate::bus::CommandBus;
use crate::error::Result;
use crate::store::ImageParam;

/// Handle for publishing write commands
#[derive(Clone)]
pub struct BlogClient {
    bus: Arc<dyn CommandBus>,
    exchange: String,
    completions: Arc<CompletionHub>,
    timeout: Option<Duration>,
}

impl BlogClient {
    pub fn new(
        bus: Arc<dyn CommandBus>,
        exchange: impl Into<String>,
        completions: Arc<CompletionHub>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            bus,
            exchange: exchange.into(),
            completions,
            timeout,
        }
    }

    pub async fn save_entry(&self, params: SaveEntryParams) -> Result<()> {
        self.send(Command::SaveEntry(params)).await
    }

    pub async fn rm_entry(&self, uuid: Uuid) -> Result<()> {
        self.send(Command::RmEntry(RmEntryParams::new(uuid))).await
    }

    pub async fn set_images(
        &self,
        uuid: Uuid,
        images: Vec<ImageParam>,
        delete_existing: bool,
    ) -> Result<()> {
        let params = SetImagesParams {
            delete_existing,
            ..SetImagesParams::new(uuid, images)
        };
        self.send(Command::SetImages(params)).await
    }

    /// Publish a command and wait until it was applied
    pub async fn send(&self, command: Command) -> Result<()> {
        let correlation_id = Uuid::new_v4().to_string();
        let payload = CommandEnvelope::new(&command, correlation_id.as_str())?.to_bytes()?;

        let completion = self.completions.register(correlation_id.as_str()).await;
        if let Err(e) = self.bus.send(&self.exchange, payload).await {
            self.completions.cancel(&correlation_id).await;
            return Err(e);
        }
        tracing::trace!("Published {} as {}", command.action(), correlation_id);

        let result = completion.wait(self.timeout).await;
        if result.is_err() {
            self.completions.cancel(&correlation_id).await;
        }
        result
    }
}
