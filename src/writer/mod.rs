//! Data Writer
//!
//! The single writer of the content tables. Commands arrive over the bus,
//! are applied one at a time once the readiness gate is open, and their
//! outcome is routed back to the producer that published them.
//!
//! # Topology
//!
//! - `master` consumes the command queue exclusively and serves dumps
//! - `slave` bootstraps from a dump, then follows every command
//! - `noSync` follows every command without any replication
//! - `both` bootstraps like a slave and serves dumps like a master

mod client;
pub mod command;
mod completion;
mod processor;

pub use client::BlogClient;
pub use command::{Command, CommandEnvelope, RmEntryParams, SaveEntryParams, SetImagesParams};
pub use completion::{Completion, CompletionHub};
pub use processor::CommandProcessor;

use std::sync::Arc;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::bus::CommandBus;
use crate::config::BlogStoreConfig;
use crate::error::Result;
use crate::migration::MigrationRunner;
use crate::replication::{DumpServer, ReplicaBootstrapper};
use crate::state::{GateState, Mode, ReadinessGate, ReadinessSequence, RuntimeSettings};
use crate::store::ContentStore;

/// Snapshot of a writer for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct WriterStatus {
    pub node_id: String,
    pub mode: Option<Mode>,
    pub state: String,
    pub failure: Option<String>,
    pub schema_version: u32,
    pub entries: u64,
    pub dump_address: Option<String>,
}

/// State shared between the facade, the processor and the readiness run
struct WriterCore {
    config: BlogStoreConfig,
    store: Arc<ContentStore>,
    settings: RuntimeSettings,
    gate: Arc<ReadinessGate>,
    dump_server: Mutex<Option<Arc<DumpServer>>>,
}

#[async_trait::async_trait]
impl ReadinessSequence for WriterCore {
    async fn run(&self) -> Result<()> {
        let settings = self.settings.resolve().await;
        settings.bus.ready().await?;

        if settings.mode.bootstraps() {
            tracing::info!("Mode {}, fetching initial dump", settings.mode);
            let bootstrapper = ReplicaBootstrapper::new(
                self.config.node.id.clone(),
                Arc::clone(&self.store),
                Arc::clone(&settings.bus),
                self.config.writer.dump_exchange(),
                self.config.bootstrap.clone(),
                self.config.dump.max_frame_bytes,
            );
            let statements = bootstrapper.run().await?;
            tracing::info!("Initial dump applied ({} statements)", statements);
        }

        let version = MigrationRunner::builtin(self.store.pool().clone()).run().await?;
        tracing::info!("Content store at schema version {}", version);
        Ok(())
    }

    async fn after_ready(&self) -> Result<()> {
        let settings = self.settings.resolve().await;
        if !settings.mode.serves_dumps() {
            return Ok(());
        }

        let server = Arc::new(
            DumpServer::bind(
                self.config.node.id.clone(),
                Arc::clone(&self.store),
                settings.bus,
                self.config.writer.dump_exchange(),
                &self.config.dump,
            )
            .await?,
        );
        let handle = Arc::clone(&server).start().await?;
        *self.dump_server.lock().await = Some(server);

        tokio::spawn(async move {
            match handle.await {
                Ok(Ok(())) => tracing::info!("Dump server stopped"),
                Ok(Err(e)) => tracing::error!("Dump server failed: {}", e),
                Err(e) => tracing::error!("Dump server task failed: {}", e),
            }
        });
        Ok(())
    }
}

/// Replicated single writer of the blog content
pub struct DataWriter {
    core: Arc<WriterCore>,
    completions: Arc<CompletionHub>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DataWriter {
    /// Create a writer over an opened store
    pub fn new(config: BlogStoreConfig, store: ContentStore) -> Self {
        let settings = RuntimeSettings::new(
            config.writer.mode,
            config.writer.resolve_interval(),
            config.writer.resolve_retries,
        );

        Self {
            core: Arc::new(WriterCore {
                config,
                store: Arc::new(store),
                settings,
                gate: Arc::new(ReadinessGate::new()),
                dump_server: Mutex::new(None),
            }),
            completions: Arc::new(CompletionHub::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Connect the configured store and create a writer over it
    pub async fn connect(config: BlogStoreConfig) -> Result<Self> {
        config.validate()?;
        let store = ContentStore::connect(&config.store).await?;
        Ok(Self::new(config, store))
    }

    /// Supply the topology mode before the settings resolve
    pub async fn set_mode(&self, mode: Mode) -> Result<()> {
        self.core.settings.set_mode(mode).await
    }

    /// Supply the command bus before the settings resolve
    pub async fn set_bus(&self, bus: Arc<dyn CommandBus>) -> Result<()> {
        self.core.settings.set_bus(bus).await
    }

    /// Attach to the command exchange and start processing.
    ///
    /// The readiness sequence is started in the background; commands that
    /// arrive before it settles wait for it.
    pub async fn start(&self) -> Result<()> {
        let settings = self.core.settings.resolve().await;
        settings.bus.ready().await?;

        let exchange = &self.core.config.writer.exchange;
        let method = settings.mode.listen_method();
        let subscription = settings.bus.listen(exchange, method).await?;
        tracing::info!(
            "Mode {}: listening on exchange {} via {} on {}",
            settings.mode,
            exchange,
            method,
            settings.bus.name()
        );

        let processor = CommandProcessor::new(
            Arc::clone(&self.core.store),
            Arc::clone(&self.completions),
            Arc::clone(&self.core.gate),
            self.sequence(),
        );

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(async move {
            processor.run(subscription).await;
        }));

        let gate = Arc::clone(&self.core.gate);
        let sequence = self.sequence();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = gate.ensure_ready(sequence).await {
                tracing::error!("Data writer not ready: {}", e);
            }
        }));

        Ok(())
    }

    /// Resolve once migrations (and the initial dump, if any) are applied
    pub async fn ready(&self) -> Result<()> {
        self.core.gate.ensure_ready(self.sequence()).await
    }

    /// Producer handle publishing on this writer's exchange
    pub async fn client(&self) -> BlogClient {
        let settings = self.core.settings.resolve().await;
        BlogClient::new(
            settings.bus,
            self.core.config.writer.exchange.clone(),
            Arc::clone(&self.completions),
            self.core.config.writer.completion_timeout(),
        )
    }

    pub fn node_id(&self) -> &str {
        &self.core.config.node.id
    }

    pub fn config(&self) -> &BlogStoreConfig {
        &self.core.config
    }

    /// Read access to the content store
    pub fn store(&self) -> &Arc<ContentStore> {
        &self.core.store
    }

    pub fn state(&self) -> GateState {
        self.core.gate.state()
    }

    pub async fn mode(&self) -> Option<Mode> {
        self.core.settings.mode().await
    }

    /// Address replicas fetch dumps from, when this node serves them
    pub async fn dump_address(&self) -> Option<String> {
        self.core
            .dump_server
            .lock()
            .await
            .as_ref()
            .map(|server| server.address().to_string())
    }

    pub async fn status(&self) -> Result<WriterStatus> {
        let state = self.state();
        let failure = match &state {
            GateState::Failed(reason) => Some(reason.clone()),
            _ => None,
        };

        // Counting needs the tables, which only exist once ready
        let entries = if state == GateState::Ready {
            self.core.store.entry_count().await?
        } else {
            0
        };

        Ok(WriterStatus {
            node_id: self.node_id().to_string(),
            mode: self.mode().await,
            state: state.as_str().to_string(),
            failure,
            schema_version: self.core.store.schema_version().await?,
            entries,
            dump_address: self.dump_address().await,
        })
    }

    /// Stop processing and serving dumps
    pub async fn shutdown(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        if let Some(server) = self.core.dump_server.lock().await.take() {
            server.stop();
        }
        tracing::info!("Data writer {} stopped", self.node_id());
    }

    fn sequence(&self) -> Arc<dyn ReadinessSequence> {
        self.core.clone()
    }
}
