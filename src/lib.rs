//! Blogstore - Replicated Single-Writer Content Store
//!
//! Storage core of a blog engine. Entries, their localizations, tags and
//! images live in an SQLite database that exactly one component writes:
//! the data writer, which applies commands arriving over a command bus.
//!
//! # Architecture
//!
//! Producers publish commands on a bus exchange and wait for a completion
//! keyed by correlation id. A master consumes the command queue; replicas
//! catch up from a full dump fetched over TCP and then follow the same
//! command stream.
//!
//! # Features
//!
//! - Ordered, idempotent schema migrations
//! - One readiness sequence per process, shared by every caller
//! - Per-command transactions with slug conflict checks
//! - Dump export and apply for replica bootstrap, LZ4 compressed on the wire
//! - Filtered entry reads and a tag cloud
//! - HTTP health and status endpoints

pub mod config;
pub mod error;
pub mod bus;
pub mod store;
pub mod migration;
pub mod state;
pub mod network;
pub mod replication;
pub mod writer;
pub mod api;

pub use config::BlogStoreConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::bus::{CommandBus, LoopbackBus};
    pub use crate::config::BlogStoreConfig;
    pub use crate::error::{Error, Result};
    pub use crate::state::{GateState, Mode};
    pub use crate::store::{ContentStore, Entry, EntryFilter, ImageParam, LangContent};
    pub use crate::writer::{BlogClient, DataWriter, SaveEntryParams};
}
