//! Blogstore Error Types

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for blogstore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Blogstore error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Store errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration {version} failed: {reason}")]
    Migration { version: u32, reason: String },

    #[error("Dump error: {0}")]
    Dump(String),

    // Validation errors
    #[error("Entry uuid not set")]
    MissingEntryId,

    #[error("Invalid entry uuid: {0}")]
    InvalidEntryId(String),

    #[error("Slug \"{slug}\" for language \"{lang}\" is already used by entry {owner}")]
    SlugConflict {
        lang: String,
        slug: String,
        owner: Uuid,
    },

    #[error("Image number {0} is given more than once")]
    DuplicateImageNumber(i64),

    // Command bus errors
    #[error("Bus error: {0}")]
    Bus(String),

    #[error("Exchange {0} already has an exclusive consumer")]
    ExclusiveConsumer(String),

    #[error("Unknown command action: {0}")]
    UnknownCommand(String),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Wire serialization error: {0}")]
    WireSerialization(#[from] bincode::Error),

    // Readiness errors
    #[error("Readiness failed: {0}")]
    ReadinessFailed(String),

    #[error("Bootstrap failed: {0}")]
    Bootstrap(String),

    // Completion errors
    #[error("No completion received for command {0} in time")]
    CompletionTimeout(String),

    #[error("Completion for command {0} was dropped")]
    CompletionDropped(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable during the readiness sequence
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout(_)
                | Error::ConnectionFailed { .. }
                | Error::Network(_)
                | Error::Bus(_)
                | Error::Io(_)
        )
    }

    /// Check if this error was raised before any mutation took place
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::MissingEntryId
                | Error::InvalidEntryId(_)
                | Error::SlugConflict { .. }
                | Error::DuplicateImageNumber(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert!(Error::MissingEntryId.is_validation());
        assert!(Error::InvalidEntryId("nope".into()).is_validation());
        assert!(Error::DuplicateImageNumber(1).is_validation());
        assert!(!Error::MissingEntryId.is_retryable());

        assert!(Error::ConnectionTimeout("127.0.0.1:1".into()).is_retryable());
        assert!(!Error::Dump("bad".into()).is_retryable());
        assert!(!Error::Dump("bad".into()).is_validation());
    }
}
