//! Dump Server
//!
//! Answers dump requests on the bus dump exchange with a single-use offer,
//! then streams the dump to whoever redeems the offer over TCP.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::protocol::{encode_statements, DumpExchangeMessage, ErrorCode, Message};
use crate::bus::{CommandBus, Subscription};
use crate::config::DumpConfig;
use crate::error::{Error, Result};
use crate::network::{Connection, ConnectionHandler, NetworkServer};
use crate::store::ContentStore;

/// How long an unredeemed offer stays valid
const OFFER_TTL: Duration = Duration::from_secs(300);

/// Length prefix bincode writes in front of every statement
const STATEMENT_OVERHEAD: usize = 8;

/// Split statements into runs bounded by count and by encoded size.
/// A statement larger than the byte budget travels alone. An empty table
/// still yields one empty run so it can be closed.
fn chunk_statements(statements: &[String], max_statements: usize, max_bytes: usize) -> Vec<&[String]> {
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut bytes = 0;

    for (i, statement) in statements.iter().enumerate() {
        let size = statement.len() + STATEMENT_OVERHEAD;
        let count = i - start;
        if count > 0 && (count >= max_statements || bytes + size > max_bytes) {
            chunks.push(&statements[start..i]);
            start = i;
            bytes = 0;
        }
        bytes += size;
    }

    if start < statements.len() || chunks.is_empty() {
        chunks.push(&statements[start..]);
    }
    chunks
}

struct Offer {
    node_id: String,
    issued: Instant,
}

/// Outstanding offers by token
type OfferMap = HashMap<String, Offer>;

/// TCP side: redeems tokens and streams the dump
struct DumpTransfer {
    store: Arc<ContentStore>,
    offers: Arc<Mutex<OfferMap>>,
    compression: bool,
    chunk_statements: usize,
    /// Byte budget per chunk, leaving the rest of a frame for framing
    chunk_bytes: usize,
}

#[async_trait::async_trait]
impl ConnectionHandler for DumpTransfer {
    async fn handle(&self, mut connection: Connection) -> Result<()> {
        let (token, node_id) = match connection.recv().await? {
            Message::DumpRequest { token, node_id } => (token, node_id),
            other => {
                let message = format!("Expected DumpRequest, got {}", other.type_name());
                return connection
                    .send(&Message::Error { code: ErrorCode::Protocol, message })
                    .await;
            }
        };

        let offer = self.offers.lock().await.remove(&token);
        let Some(offer) = offer else {
            tracing::warn!("Refused dump for {} from {}: unknown token", node_id, connection.peer());
            return connection
                .send(&Message::Error {
                    code: ErrorCode::InvalidToken,
                    message: "Unknown or already redeemed token".into(),
                })
                .await;
        };
        if offer.node_id != node_id {
            tracing::debug!(
                "Token issued to {} redeemed by {}",
                offer.node_id,
                node_id
            );
        }

        let dump = match self.store.export_dump().await {
            Ok(dump) => dump,
            Err(e) => {
                tracing::error!("Export for {} failed: {}", node_id, e);
                return connection
                    .send(&Message::Error {
                        code: ErrorCode::DumpFailed,
                        message: e.to_string(),
                    })
                    .await;
            }
        };

        connection
            .send(&Message::DumpStart {
                schema_version: dump.schema_version,
                tables: dump.table_names(),
                compressed: self.compression,
            })
            .await?;

        for table in &dump.tables {
            let chunks = chunk_statements(&table.statements, self.chunk_statements, self.chunk_bytes);
            let last = chunks.len() - 1;
            for (i, chunk) in chunks.into_iter().enumerate() {
                let data = match encode_statements(chunk, self.compression) {
                    Ok(data) => data,
                    Err(e) => {
                        tracing::error!("Encoding {} for {} failed: {}", table.table, node_id, e);
                        return connection
                            .send(&Message::Error {
                                code: ErrorCode::Internal,
                                message: e.to_string(),
                            })
                            .await;
                    }
                };

                let chunk_message = Message::DumpChunk {
                    table: table.table.clone(),
                    data,
                    is_last: i == last,
                };
                // Oversized frames are refused before anything is written
                match connection.send(&chunk_message).await {
                    Ok(()) => {}
                    Err(Error::Network(reason)) => {
                        tracing::error!("Dump for {} does not fit: {}", node_id, reason);
                        return connection
                            .send(&Message::Error {
                                code: ErrorCode::DumpFailed,
                                message: format!("table {}: {}", table.table, reason),
                            })
                            .await;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let statements = dump.statement_count() as u64;
        connection.send(&Message::DumpComplete { statements }).await?;

        tracing::info!(
            "Served dump to {} ({} tables, {} statements)",
            node_id,
            dump.tables.len(),
            statements
        );
        Ok(())
    }
}

/// Serves dumps to bootstrapping replicas
pub struct DumpServer {
    node_id: String,
    bus: Arc<dyn CommandBus>,
    exchange: String,
    server: NetworkServer,
    advertise_address: String,
    transfer: Arc<DumpTransfer>,
}

impl DumpServer {
    /// Bind the transfer socket
    pub async fn bind(
        node_id: impl Into<String>,
        store: Arc<ContentStore>,
        bus: Arc<dyn CommandBus>,
        exchange: impl Into<String>,
        config: &DumpConfig,
    ) -> Result<Self> {
        let server = NetworkServer::bind(&config.bind_address, config.max_frame_bytes).await?;
        let advertise_address = config
            .advertise_address
            .clone()
            .unwrap_or_else(|| server.local_addr().to_string());

        Ok(Self {
            node_id: node_id.into(),
            bus,
            exchange: exchange.into(),
            server,
            advertise_address,
            transfer: Arc::new(DumpTransfer {
                store,
                offers: Arc::new(Mutex::new(HashMap::new())),
                compression: config.compression,
                chunk_statements: config.chunk_statements.max(1),
                chunk_bytes: (config.max_frame_bytes / 2) as usize,
            }),
        })
    }

    /// Address replicas are told to connect to
    pub fn address(&self) -> &str {
        &self.advertise_address
    }

    /// Number of offers not yet redeemed
    pub async fn outstanding_offers(&self) -> usize {
        self.transfer.offers.lock().await.len()
    }

    /// Subscribe to the dump exchange and serve in the background
    pub async fn start(self: Arc<Self>) -> Result<JoinHandle<Result<()>>> {
        let requests = self.bus.subscribe(&self.exchange).await?;
        tracing::info!(
            "Dump server {} listening on exchange {}, transfers via {}",
            self.node_id,
            self.exchange,
            self.advertise_address
        );
        Ok(tokio::spawn(self.serve(requests)))
    }

    /// Serve until stopped
    pub async fn run(self: Arc<Self>) -> Result<()> {
        match self.start().await?.await {
            Ok(result) => result,
            Err(e) => Err(Error::Internal(format!("Dump server task failed: {}", e))),
        }
    }

    async fn serve(self: Arc<Self>, mut requests: Subscription) -> Result<()> {
        let server = Arc::clone(&self);
        let transfer: Arc<dyn ConnectionHandler> = self.transfer.clone();
        let mut accept = tokio::spawn(async move { server.server.run(transfer).await });

        loop {
            tokio::select! {
                delivery = requests.next() => {
                    let Some(mut delivery) = delivery else {
                        tracing::warn!("Dump exchange {} closed", self.exchange);
                        break;
                    };
                    delivery.ack();

                    match DumpExchangeMessage::from_bytes(&delivery.payload) {
                        Ok(DumpExchangeMessage::Request { request_id, node_id }) => {
                            if let Err(e) = self.offer(request_id, node_id).await {
                                tracing::error!("Failed to publish dump offer: {}", e);
                            }
                        }
                        Ok(DumpExchangeMessage::Offer { .. }) => {}
                        Err(e) => {
                            tracing::warn!("Invalid message on {}: {}", self.exchange, e);
                        }
                    }
                }
                result = &mut accept => {
                    return match result {
                        Ok(inner) => inner,
                        Err(e) => Err(Error::Internal(format!("Dump listener died: {}", e))),
                    };
                }
            }
        }

        self.server.stop();
        Ok(())
    }

    /// Stop accepting transfers
    pub fn stop(&self) {
        self.server.stop();
    }

    async fn offer(&self, request_id: String, node_id: String) -> Result<()> {
        let token = uuid::Uuid::new_v4().simple().to_string();
        {
            let mut offers = self.transfer.offers.lock().await;
            offers.retain(|_, offer| offer.issued.elapsed() < OFFER_TTL);
            offers.insert(
                token.clone(),
                Offer {
                    node_id: node_id.clone(),
                    issued: Instant::now(),
                },
            );
        }

        let offer = DumpExchangeMessage::Offer {
            request_id,
            address: self.advertise_address.clone(),
            token,
        };
        self.bus.send(&self.exchange, offer.to_bytes()?).await?;
        tracing::debug!("Offered dump to {}", node_id);
        Ok(())
    }
}
