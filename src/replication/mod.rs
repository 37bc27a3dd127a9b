//! Replication Module
//!
//! Full-dump replication: the dump server on masters and the bootstrapper
//! on replicas.

mod bootstrap;
mod dump_server;
pub mod protocol;

pub use bootstrap::ReplicaBootstrapper;
pub use dump_server::DumpServer;
pub use protocol::{DumpExchangeMessage, ErrorCode, FrameHeader, Message};
