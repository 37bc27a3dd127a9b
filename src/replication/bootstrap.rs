//! Replica Bootstrapper
//!
//! Catches a replica up with a full dump before it follows live commands.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use rand::Rng;
use tokio::time::{timeout, Instant};

use super::protocol::{decode_statements, DumpExchangeMessage, Message};
use crate::bus::{CommandBus, Subscription};
use crate::config::BootstrapConfig;
use crate::error::{Error, Result};
use crate::network::{Connection, NetworkClient};
use crate::store::{ContentStore, DataDump, TableDump};

/// Fetches and applies a dump from a dump server
pub struct ReplicaBootstrapper {
    node_id: String,
    store: Arc<ContentStore>,
    bus: Arc<dyn CommandBus>,
    exchange: String,
    config: BootstrapConfig,
    client: NetworkClient,
}

impl ReplicaBootstrapper {
    pub fn new(
        node_id: impl Into<String>,
        store: Arc<ContentStore>,
        bus: Arc<dyn CommandBus>,
        exchange: impl Into<String>,
        config: BootstrapConfig,
        max_frame_bytes: u32,
    ) -> Self {
        let client = NetworkClient::new(config.connect_timeout(), max_frame_bytes);
        Self {
            node_id: node_id.into(),
            store,
            bus,
            exchange: exchange.into(),
            config,
            client,
        }
    }

    /// Fetch and apply a dump, retrying transport failures
    pub async fn run(&self) -> Result<u64> {
        let mut attempt = 1;
        loop {
            match self.attempt().await {
                Ok(statements) => return Ok(statements),
                Err(e) if attempt < self.config.max_attempts && Self::should_retry(&e) => {
                    let delay = self.backoff(attempt);
                    tracing::warn!(
                        "Bootstrap attempt {}/{} failed: {}. Retrying in {:?}",
                        attempt,
                        self.config.max_attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(Error::Bootstrap(format!(
                        "giving up after {} attempts: {}",
                        attempt, e
                    )))
                }
            }
        }
    }

    /// Store failures are final, everything on the way to the store is not
    fn should_retry(error: &Error) -> bool {
        error.is_retryable()
            || matches!(
                error,
                Error::Bootstrap(_) | Error::WireSerialization(_) | Error::Json(_)
            )
    }

    /// Linear backoff with up to half a step of jitter
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.backoff_ms.saturating_mul(u64::from(attempt));
        let jitter = rand::thread_rng().gen_range(0..=self.config.backoff_ms / 2);
        Duration::from_millis(base + jitter)
    }

    async fn attempt(&self) -> Result<u64> {
        let (address, token) = self.request_offer().await?;
        tracing::info!("Fetching dump from {}", address);

        let (mut connection, reply) = timeout(
            self.config.request_timeout(),
            self.client.request(
                &address,
                &Message::DumpRequest {
                    token,
                    node_id: self.node_id.clone(),
                },
            ),
        )
        .await
        .map_err(|_| Error::ConnectionTimeout(address.clone()))??;

        let (schema_version, tables, compressed) = match reply {
            Message::DumpStart {
                schema_version,
                tables,
                compressed,
            } => (schema_version, tables, compressed),
            Message::Error { code, message } => {
                return Err(Error::Bootstrap(format!("{}: {}", code, message)))
            }
            other => {
                return Err(Error::Bootstrap(format!(
                    "Expected DumpStart, got {}",
                    other.type_name()
                )))
            }
        };

        let dump_tables = self.receive_tables(&mut connection, &tables, compressed).await?;
        let dump = DataDump {
            schema_version,
            created: Utc::now(),
            tables: dump_tables,
        };

        self.store.apply_dump(&dump).await?;
        Ok(dump.statement_count() as u64)
    }

    /// Publish a request and wait for the matching offer
    async fn request_offer(&self) -> Result<(String, String)> {
        // Subscribe first so the offer cannot slip past
        let mut offers = self.bus.subscribe(&self.exchange).await?;

        let request_id = uuid::Uuid::new_v4().to_string();
        let request = DumpExchangeMessage::Request {
            request_id: request_id.clone(),
            node_id: self.node_id.clone(),
        };
        self.bus.send(&self.exchange, request.to_bytes()?).await?;
        tracing::debug!("Requested dump on {} ({})", self.exchange, request_id);

        let deadline = Instant::now() + self.config.request_timeout();
        match tokio::time::timeout_at(deadline, Self::wait_offer(&mut offers, &request_id)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Bootstrap(format!(
                "no dump offer on {} within {:?}",
                self.exchange,
                self.config.request_timeout()
            ))),
        }
    }

    async fn wait_offer(offers: &mut Subscription, request_id: &str) -> Result<(String, String)> {
        while let Some(mut delivery) = offers.next().await {
            delivery.ack();
            match DumpExchangeMessage::from_bytes(&delivery.payload) {
                Ok(DumpExchangeMessage::Offer {
                    request_id: id,
                    address,
                    token,
                }) if id == request_id => return Ok((address, token)),
                Ok(_) => {}
                Err(e) => tracing::debug!("Ignoring message on dump exchange: {}", e),
            }
        }
        Err(Error::Bus("dump exchange closed".into()))
    }

    async fn receive_tables(
        &self,
        connection: &mut Connection,
        announced: &[String],
        compressed: bool,
    ) -> Result<Vec<TableDump>> {
        let mut tables: Vec<TableDump> = Vec::with_capacity(announced.len());
        let mut finished: HashSet<String> = HashSet::with_capacity(announced.len());

        loop {
            let message = timeout(self.config.request_timeout(), connection.recv())
                .await
                .map_err(|_| Error::ConnectionTimeout(connection.peer().to_string()))??;

            match message {
                Message::DumpChunk { table, data, is_last } => {
                    if !announced.contains(&table) {
                        return Err(Error::Bootstrap(format!("Unannounced table {}", table)));
                    }
                    if finished.contains(&table) {
                        return Err(Error::Bootstrap(format!(
                            "Chunk for table {} after its last chunk",
                            table
                        )));
                    }
                    let statements = decode_statements(&data, compressed)?;

                    // Chunks of one table arrive back to back
                    let previous = tables.last().map(|t| t.table.clone());
                    match previous {
                        Some(current) if current == table => {
                            if let Some(current) = tables.last_mut() {
                                current.statements.extend(statements);
                            }
                        }
                        Some(current) if !finished.contains(&current) => {
                            return Err(Error::Bootstrap(format!(
                                "Table {} interrupted before its last chunk",
                                current
                            )));
                        }
                        _ => tables.push(TableDump {
                            table: table.clone(),
                            statements,
                        }),
                    }

                    if is_last {
                        finished.insert(table);
                    }
                }
                Message::DumpComplete { statements } => {
                    if let Some(open) = announced.iter().find(|t| !finished.contains(*t)) {
                        return Err(Error::Bootstrap(format!(
                            "Dump ended before table {} was complete",
                            open
                        )));
                    }
                    let received: usize = tables.iter().map(|t| t.statements.len()).sum();
                    if received as u64 != statements {
                        return Err(Error::Bootstrap(format!(
                            "Dump incomplete: {} of {} statements",
                            received, statements
                        )));
                    }
                    return Ok(tables);
                }
                Message::Error { code, message } => {
                    return Err(Error::Bootstrap(format!("{}: {}", code, message)))
                }
                other => {
                    return Err(Error::Bootstrap(format!(
                        "Unexpected {} during dump",
                        other.type_name()
                    )))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use crate::bus::LoopbackBus;
    use crate::config::DumpConfig;
    use crate::replication::DumpServer;
    use crate::store::test_support::migrated_store;
    use crate::store::{EntryFilter, LangContent};

    fn bootstrap_config() -> BootstrapConfig {
        BootstrapConfig {
            request_timeout_ms: 500,
            max_attempts: 2,
            backoff_ms: 10,
            connect_timeout_ms: 500,
        }
    }

    #[tokio::test]
    async fn test_replica_catches_up() {
        let bus: Arc<dyn CommandBus> = Arc::new(LoopbackBus::new());

        let (_master_dir, master) = migrated_store().await;
        let master = Arc::new(master);
        let id = uuid::Uuid::new_v4();
        let mut langs = BTreeMap::new();
        langs.insert(
            "en".to_string(),
            LangContent {
                header: Some("Hello".into()),
                slug: Some("hello".into()),
                tags: Some("x,y".into()),
                ..LangContent::default()
            },
        );
        master.save_entry(id, None, Some(&langs)).await.unwrap();

        // Small chunks so tables span several frames
        let dump_config = DumpConfig { chunk_statements: 2, ..DumpConfig::default() };
        let server = Arc::new(
            DumpServer::bind("master", Arc::clone(&master), Arc::clone(&bus), "blog_dataDump", &dump_config)
                .await
                .unwrap(),
        );
        Arc::clone(&server).start().await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let replica = Arc::new(ContentStore::open(&dir.path().join("replica.db")).await.unwrap());
        let bootstrapper = ReplicaBootstrapper::new(
            "replica",
            Arc::clone(&replica),
            Arc::clone(&bus),
            "blog_dataDump",
            bootstrap_config(),
            dump_config.max_frame_bytes,
        );

        let statements = bootstrapper.run().await.unwrap();
        assert!(statements > 0);

        let entries = replica.get_entries(&EntryFilter::by_uuid(id)).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].langs["en"].tags, vec!["x", "y"]);
        assert_eq!(replica.schema_version().await.unwrap(), 3);
        assert_eq!(server.outstanding_offers().await, 0);

        server.stop();
    }

    #[tokio::test]
    async fn test_gives_up_without_server() {
        let bus: Arc<dyn CommandBus> = Arc::new(LoopbackBus::new());
        let (_dir, store) = migrated_store().await;

        let config = BootstrapConfig {
            request_timeout_ms: 20,
            ..bootstrap_config()
        };
        let bootstrapper = ReplicaBootstrapper::new(
            "lonely",
            Arc::new(store),
            bus,
            "blog_dataDump",
            config,
            1024,
        );

        let result = bootstrapper.run().await;
        assert!(matches!(result, Err(Error::Bootstrap(_))));
    }

    #[tokio::test]
    async fn test_token_is_single_use() {
        let bus: Arc<dyn CommandBus> = Arc::new(LoopbackBus::new());
        let (_dir, store) = migrated_store().await;
        let server = Arc::new(
            DumpServer::bind(
                "master",
                Arc::new(store),
                bus,
                "blog_dataDump",
                &DumpConfig::default(),
            )
            .await
            .unwrap(),
        );
        Arc::clone(&server).start().await.unwrap();

        let client = NetworkClient::new(Duration::from_millis(500), 1024);
        let (_conn, reply) = client
            .request(
                server.address(),
                &Message::DumpRequest { token: "forged".into(), node_id: "intruder".into() },
            )
            .await
            .unwrap();

        assert!(matches!(
            reply,
            Message::Error { code: crate::replication::ErrorCode::InvalidToken, .. }
        ));
        server.stop();
    }

    fn entry_with_body(slug: &str, body_bytes: usize) -> BTreeMap<String, LangContent> {
        let mut langs = BTreeMap::new();
        langs.insert(
            "en".to_string(),
            LangContent {
                header: Some(slug.to_string()),
                body: Some("b".repeat(body_bytes)),
                slug: Some(slug.to_string()),
                ..LangContent::default()
            },
        );
        langs
    }

    async fn serve_master(
        master: Arc<ContentStore>,
        bus: &Arc<dyn CommandBus>,
        dump_config: &DumpConfig,
    ) -> Arc<DumpServer> {
        let server = Arc::new(
            DumpServer::bind("master", master, Arc::clone(bus), "blog_dataDump", dump_config)
                .await
                .unwrap(),
        );
        Arc::clone(&server).start().await.unwrap();
        server
    }

    #[tokio::test]
    async fn test_large_tables_fit_small_frames() {
        let bus: Arc<dyn CommandBus> = Arc::new(LoopbackBus::new());
        let (_master_dir, master) = migrated_store().await;
        let master = Arc::new(master);
        for i in 0..10 {
            let langs = entry_with_body(&format!("big-{}", i), 1000);
            master.save_entry(uuid::Uuid::new_v4(), None, Some(&langs)).await.unwrap();
        }

        // Ten localizations of about a kilobyte would never fit one 4 KiB frame
        let dump_config = DumpConfig {
            max_frame_bytes: 4096,
            compression: false,
            ..DumpConfig::default()
        };
        let server = serve_master(Arc::clone(&master), &bus, &dump_config).await;

        let (_replica_dir, replica) = migrated_store().await;
        let replica = Arc::new(replica);
        let bootstrapper = ReplicaBootstrapper::new(
            "replica",
            Arc::clone(&replica),
            Arc::clone(&bus),
            "blog_dataDump",
            bootstrap_config(),
            dump_config.max_frame_bytes,
        );

        bootstrapper.run().await.unwrap();
        assert_eq!(replica.entry_count().await.unwrap(), 10);
        server.stop();
    }

    #[tokio::test]
    async fn test_statement_beyond_frame_limit_is_reported() {
        let bus: Arc<dyn CommandBus> = Arc::new(LoopbackBus::new());
        let (_master_dir, master) = migrated_store().await;
        let master = Arc::new(master);
        let langs = entry_with_body("huge", 8000);
        master.save_entry(uuid::Uuid::new_v4(), None, Some(&langs)).await.unwrap();

        let dump_config = DumpConfig {
            max_frame_bytes: 4096,
            compression: false,
            ..DumpConfig::default()
        };
        let server = serve_master(Arc::clone(&master), &bus, &dump_config).await;

        let (_replica_dir, replica) = migrated_store().await;
        let bootstrapper = ReplicaBootstrapper::new(
            "replica",
            Arc::new(replica),
            Arc::clone(&bus),
            "blog_dataDump",
            BootstrapConfig { max_attempts: 1, ..bootstrap_config() },
            dump_config.max_frame_bytes,
        );

        let err = bootstrapper.run().await.unwrap_err();
        assert!(matches!(err, Error::Bootstrap(_)));
        assert!(err.to_string().contains("dump failed"), "{}", err);
        server.stop();
    }

    /// Connection whose peer sends a fixed message sequence
    async fn scripted_peer(messages: Vec<Message>) -> Connection {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut connection = Connection::new(stream, 1 << 20).unwrap();
            for message in &messages {
                if connection.send(message).await.is_err() {
                    break;
                }
            }
        });

        NetworkClient::new(Duration::from_millis(500), 1 << 20)
            .connect(&address)
            .await
            .unwrap()
    }

    async fn receive(messages: Vec<Message>) -> Result<Vec<TableDump>> {
        let (_dir, store) = migrated_store().await;
        let bootstrapper = ReplicaBootstrapper::new(
            "replica",
            Arc::new(store),
            Arc::new(LoopbackBus::new()),
            "blog_dataDump",
            bootstrap_config(),
            1 << 20,
        );
        let mut connection = scripted_peer(messages).await;
        let announced = vec!["blog_entries".to_string(), "blog_entry_data".to_string()];
        bootstrapper.receive_tables(&mut connection, &announced, false).await
    }

    fn chunk(table: &str, statement: &str, is_last: bool) -> Message {
        Message::DumpChunk {
            table: table.into(),
            data: crate::replication::protocol::encode_statements(&[statement.to_string()], false)
                .unwrap(),
            is_last,
        }
    }

    #[tokio::test]
    async fn test_chunk_flags_are_followed() {
        let tables = receive(vec![
            chunk("blog_entries", "a", false),
            chunk("blog_entries", "b", true),
            chunk("blog_entry_data", "c", true),
            Message::DumpComplete { statements: 3 },
        ])
        .await
        .unwrap();
        assert_eq!(tables.len(), 2);
        assert_eq!(tables[0].statements, vec!["a", "b"]);

        let after_last = receive(vec![
            chunk("blog_entries", "a", true),
            chunk("blog_entries", "b", true),
            chunk("blog_entry_data", "c", true),
            Message::DumpComplete { statements: 3 },
        ])
        .await;
        assert!(matches!(after_last, Err(Error::Bootstrap(m)) if m.contains("after its last chunk")));

        let interrupted = receive(vec![
            chunk("blog_entries", "a", false),
            chunk("blog_entry_data", "c", true),
            Message::DumpComplete { statements: 2 },
        ])
        .await;
        assert!(matches!(interrupted, Err(Error::Bootstrap(m)) if m.contains("interrupted")));

        let unfinished = receive(vec![
            chunk("blog_entries", "a", true),
            chunk("blog_entry_data", "c", false),
            Message::DumpComplete { statements: 2 },
        ])
        .await;
        assert!(matches!(unfinished, Err(Error::Bootstrap(m)) if m.contains("was complete")));
    }
}
