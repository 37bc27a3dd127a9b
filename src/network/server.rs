//! Network Server
//!
//! TCP accept loop handing each connection to a handler task.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

use super::Connection;
use crate::error::{Error, Result};

/// Serves one accepted connection
#[async_trait::async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    async fn handle(&self, connection: Connection) -> Result<()>;
}

/// Framed TCP server
pub struct NetworkServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    max_frame_bytes: u32,
    /// Shutdown signal
    shutdown: watch::Sender<bool>,
}

impl NetworkServer {
    /// Bind the listening socket
    pub async fn bind(address: &str, max_frame_bytes: u32) -> Result<Self> {
        let listener = TcpListener::bind(address).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            listener,
            local_addr,
            max_frame_bytes,
            shutdown,
        })
    }

    /// Address actually bound
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until stopped
    pub async fn run(&self, handler: Arc<dyn ConnectionHandler>) -> Result<()> {
        tracing::info!("Network server listening on {}", self.local_addr);
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            if *shutdown_rx.borrow_and_update() {
                break;
            }

            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let handler = Arc::clone(&handler);
                            let max_frame_bytes = self.max_frame_bytes;

                            tokio::spawn(async move {
                                let result = match Connection::new(socket, max_frame_bytes) {
                                    Ok(connection) => handler.handle(connection).await,
                                    Err(e) => Err(e),
                                };
                                match result {
                                    Ok(()) => {}
                                    Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                                        tracing::debug!("Connection from {} closed early", addr);
                                    }
                                    Err(e) => tracing::warn!("Connection error from {}: {}", addr, e),
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {}
            }
        }

        tracing::info!("Network server on {} stopped", self.local_addr);
        Ok(())
    }

    /// Stop the server
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkClient;
    use crate::replication::Message;
    use std::time::Duration;

    struct Echo;

    #[async_trait::async_trait]
    impl ConnectionHandler for Echo {
        async fn handle(&self, mut connection: Connection) -> Result<()> {
            let message = connection.recv().await?;
            connection.send(&message).await
        }
    }

    #[tokio::test]
    async fn test_serve_and_stop() {
        let server = Arc::new(NetworkServer::bind("127.0.0.1:0", 1024).await.unwrap());
        let address = server.local_addr().to_string();

        let running = Arc::clone(&server);
        let task = tokio::spawn(async move { running.run(Arc::new(Echo)).await });

        let client = NetworkClient::new(Duration::from_secs(1), 1024);
        let (_conn, reply) = client
            .request(&address, &Message::DumpComplete { statements: 3 })
            .await
            .unwrap();
        assert!(matches!(reply, Message::DumpComplete { statements: 3 }));

        server.stop();
        task.await.unwrap().unwrap();
    }
}
