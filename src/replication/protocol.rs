//! Replication Protocol
//!
//! Two layers: JSON negotiation messages on the bus dump exchange, and the
//! framed bincode messages of the dump transfer itself.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Dump transfer messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Replica redeems an offer token
    DumpRequest {
        token: String,
        node_id: String,
    },

    /// Server announces the dump
    DumpStart {
        schema_version: u32,
        tables: Vec<String>,
        compressed: bool,
    },

    /// Statements of one table, possibly split over several chunks
    DumpChunk {
        table: String,
        data: Vec<u8>,
        is_last: bool,
    },

    /// All chunks sent
    DumpComplete {
        statements: u64,
    },

    /// Error response
    Error {
        code: ErrorCode,
        message: String,
    },
}

/// Error codes for protocol errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Token unknown or already redeemed
    InvalidToken,
    /// Export failed on the server, or the dump does not fit the frame limit
    DumpFailed,
    /// Unexpected message
    Protocol,
    /// Encoding a chunk failed
    Internal,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCode::InvalidToken => "invalid token",
            ErrorCode::DumpFailed => "dump failed",
            ErrorCode::Protocol => "protocol error",
            ErrorCode::Internal => "internal error",
        };
        f.write_str(name)
    }
}

impl Message {
    /// Serialize message to bytes
    pub fn serialize(&self) -> std::result::Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> std::result::Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::DumpRequest { .. } => "DumpRequest",
            Message::DumpStart { .. } => "DumpStart",
            Message::DumpChunk { .. } => "DumpChunk",
            Message::DumpComplete { .. } => "DumpComplete",
            Message::Error { .. } => "Error",
        }
    }
}

/// Encode a batch of statements as chunk data
pub fn encode_statements(statements: &[String], compress: bool) -> Result<Vec<u8>> {
    let serialized = bincode::serialize(statements)?;
    if compress {
        Ok(lz4_flex::compress_prepend_size(&serialized))
    } else {
        Ok(serialized)
    }
}

/// Decode chunk data back into statements
pub fn decode_statements(data: &[u8], compressed: bool) -> Result<Vec<String>> {
    let statements = if compressed {
        let serialized = lz4_flex::decompress_size_prepended(data)
            .map_err(|e| Error::Dump(format!("Decompression failed: {}", e)))?;
        bincode::deserialize(&serialized)?
    } else {
        bincode::deserialize(data)?
    };
    Ok(statements)
}

/// Negotiation messages on the bus dump exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DumpExchangeMessage {
    /// A replica asks for a dump
    #[serde(rename_all = "camelCase")]
    Request { request_id: String, node_id: String },

    /// A dump server answers with where and how to fetch it
    #[serde(rename_all = "camelCase")]
    Offer {
        request_id: String,
        address: String,
        token: String,
    },
}

impl DumpExchangeMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let [l0, l1, l2, l3, c0, c1, c2, c3] = *bytes;
        Self {
            length: u32::from_le_bytes([l0, l1, l2, l3]),
            checksum: u32::from_le_bytes([c0, c1, c2, c3]),
        }
    }
}
