//! Network Module
//!
//! Framed TCP transport used by the dump transfer.

mod client;
mod server;

pub use client::NetworkClient;
pub use server::{ConnectionHandler, NetworkServer};

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::error::{Error, Result};
use crate::replication::{FrameHeader, Message};

/// Read a framed message from a reader
pub async fn read_message<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut R,
    max_frame_bytes: u32,
) -> Result<Message> {
    use tokio::io::AsyncReadExt;

    // Read header
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length > max_frame_bytes {
        return Err(Error::Network(format!(
            "Frame of {} bytes exceeds limit of {}",
            header.length, max_frame_bytes
        )));
    }

    // Read body
    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    // Verify checksum
    let computed_checksum = crc32fast::hash(&body);
    if computed_checksum != header.checksum {
        return Err(Error::Network("Message checksum mismatch".into()));
    }

    let message = Message::deserialize(&body)?;
    Ok(message)
}

/// Write a framed message to a writer.
///
/// A body the peer would refuse under the same limit is rejected before
/// anything reaches the wire.
pub async fn write_message<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
    max_frame_bytes: u32,
) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let body = message.serialize()?;
    if body.len() > max_frame_bytes as usize {
        return Err(Error::Network(format!(
            "{} of {} bytes exceeds frame limit of {}",
            message.type_name(),
            body.len(),
            max_frame_bytes
        )));
    }
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}

/// An established framed connection
pub struct Connection {
    peer: String,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    max_frame_bytes: u32,
}

impl Connection {
    /// Wrap a connected stream
    pub fn new(stream: TcpStream, max_frame_bytes: u32) -> Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let (reader, writer) = stream.into_split();

        Ok(Self {
            peer,
            reader,
            writer,
            max_frame_bytes,
        })
    }

    /// Remote address
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub async fn send(&mut self, message: &Message) -> Result<()> {
        tracing::trace!("Sending {} to {}", message.type_name(), self.peer);
        write_message(&mut self.writer, message, self.max_frame_bytes).await
    }

    pub async fn recv(&mut self) -> Result<Message> {
        let message = read_message(&mut self.reader, self.max_frame_bytes).await?;
        tracing::trace!("Received {} from {}", message.type_name(), self.peer);
        Ok(message)
    }
}
