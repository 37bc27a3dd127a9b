//! Runtime Settings
//!
//! Mode and bus may be handed over by the host application after the
//! writer was created. Resolution waits a bounded time for them, then
//! falls back to single-process defaults and pins the result.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OnceCell, RwLock};

use super::Mode;
use crate::bus::{CommandBus, LoopbackBus};
use crate::error::{Error, Result};

/// Settings every component agrees on after resolution
#[derive(Clone)]
pub struct ResolvedSettings {
    pub mode: Mode,
    pub bus: Arc<dyn CommandBus>,
}

impl std::fmt::Debug for ResolvedSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedSettings")
            .field("mode", &self.mode)
            .field("bus", &self.bus.name())
            .finish()
    }
}

/// Values supplied so far
struct Pending {
    mode: Option<Mode>,
    bus: Option<Arc<dyn CommandBus>>,
    /// Set once resolution took the values, under the same lock
    pinned: bool,
}

/// Late-bound mode and bus
pub struct RuntimeSettings {
    pending: RwLock<Pending>,
    resolved: OnceCell<ResolvedSettings>,
    interval: Duration,
    retries: u32,
}

impl RuntimeSettings {
    pub fn new(mode: Option<Mode>, interval: Duration, retries: u32) -> Self {
        Self {
            pending: RwLock::new(Pending {
                mode,
                bus: None,
                pinned: false,
            }),
            resolved: OnceCell::new(),
            interval,
            retries,
        }
    }

    /// Supply the topology mode
    pub async fn set_mode(&self, mode: Mode) -> Result<()> {
        let mut pending = self.pending.write().await;
        if pending.pinned {
            return Err(Error::Config(
                "mode cannot change after settings were resolved".into(),
            ));
        }
        pending.mode = Some(mode);
        Ok(())
    }

    /// Supply the command bus
    pub async fn set_bus(&self, bus: Arc<dyn CommandBus>) -> Result<()> {
        let mut pending = self.pending.write().await;
        if pending.pinned {
            return Err(Error::Config(
                "bus cannot change after settings were resolved".into(),
            ));
        }
        pending.bus = Some(bus);
        Ok(())
    }

    /// Pinned settings, if already resolved
    pub fn get(&self) -> Option<&ResolvedSettings> {
        self.resolved.get()
    }

    /// Current mode, resolved or not
    pub async fn mode(&self) -> Option<Mode> {
        match self.resolved.get() {
            Some(resolved) => Some(resolved.mode),
            None => self.pending.read().await.mode,
        }
    }

    /// Wait for mode and bus, falling back to defaults when they never show up
    pub async fn resolve(&self) -> ResolvedSettings {
        self.resolved
            .get_or_init(|| async {
                for attempt in 0..self.retries {
                    {
                        let pending = self.pending.read().await;
                        if pending.mode.is_some() && pending.bus.is_some() {
                            break;
                        }
                    }
                    if attempt + 1 < self.retries {
                        tokio::time::sleep(self.interval).await;
                    }
                }

                let mut pending = self.pending.write().await;
                pending.pinned = true;

                let mode = *pending.mode.get_or_insert_with(|| {
                    tracing::warn!("No mode set, defaulting to {}", Mode::NoSync);
                    Mode::NoSync
                });
                let bus = Arc::clone(pending.bus.get_or_insert_with(|| {
                    tracing::warn!("No bus set, defaulting to a process-local loopback bus");
                    let fallback: Arc<dyn CommandBus> = Arc::new(LoopbackBus::new());
                    fallback
                }));

                tracing::debug!("Resolved mode {} on bus {}", mode, bus.name());
                ResolvedSettings { mode, bus }
            })
            .await
            .clone()
    }
}
