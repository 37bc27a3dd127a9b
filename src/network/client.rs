//! Network Client
//!
//! Opens framed connections to a dump server.

use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::Connection;
use crate::error::{Error, Result};
use crate::replication::Message;

/// Client side of the dump transport
#[derive(Debug, Clone)]
pub struct NetworkClient {
    /// Connection timeout
    connect_timeout: Duration,
    /// Largest frame accepted from the server
    max_frame_bytes: u32,
}

impl NetworkClient {
    /// Create a new network client
    pub fn new(connect_timeout: Duration, max_frame_bytes: u32) -> Self {
        Self {
            connect_timeout,
            max_frame_bytes,
        }
    }

    /// Connect to an address
    pub async fn connect(&self, address: &str) -> Result<Connection> {
        let result = timeout(self.connect_timeout, TcpStream::connect(address)).await;

        match result {
            Ok(Ok(stream)) => Connection::new(stream, self.max_frame_bytes),
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    /// Connect, send one message and wait for the first reply
    pub async fn request(&self, address: &str, message: &Message) -> Result<(Connection, Message)> {
        let mut connection = self.connect(address).await?;
        connection.send(message).await?;
        let reply = connection.recv().await?;
        Ok((connection, reply))
    }
}
