//! Blogstore Configuration
//!
//! This module provides configuration structures for the blog content
//! store and its replicated single-writer.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::state::Mode;

/// Main blogstore configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlogStoreConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Content store connection configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Data writer configuration
    #[serde(default)]
    pub writer: WriterConfig,

    /// Dump server configuration (master side of replication)
    #[serde(default)]
    pub dump: DumpConfig,

    /// Replica bootstrap configuration (slave side of replication)
    #[serde(default)]
    pub bootstrap: BootstrapConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: String,
}

/// Content store connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite connection URL
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Connection pool size
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// How long a connection waits on a locked database, in milliseconds
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

/// Data writer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterConfig {
    /// Topology mode. When absent the host application may supply it later.
    #[serde(default)]
    pub mode: Option<Mode>,

    /// Name of the command exchange
    #[serde(default = "default_exchange")]
    pub exchange: String,

    /// Poll interval while waiting for late-supplied settings
    #[serde(default = "default_resolve_interval_ms")]
    pub resolve_interval_ms: u64,

    /// Number of polls before falling back to defaults
    #[serde(default = "default_resolve_retries")]
    pub resolve_retries: u32,

    /// Producer-side ceiling on waiting for a completion (none = wait forever)
    #[serde(default)]
    pub completion_timeout_ms: Option<u64>,
}

/// Dump server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpConfig {
    /// Address the dump transport listens on
    #[serde(default = "default_dump_address")]
    pub bind_address: String,

    /// Address offered to replicas (defaults to the bound address)
    #[serde(default)]
    pub advertise_address: Option<String>,

    /// Statements per transferred chunk
    #[serde(default = "default_chunk_statements")]
    pub chunk_statements: usize,

    /// Enable LZ4 compression of dump chunks
    #[serde(default = "default_true")]
    pub compression: bool,

    /// Largest frame accepted on the dump transport
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: u32,
}

/// Replica bootstrap configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapConfig {
    /// How long to wait for an offer after each dump request
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Dump requests before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base backoff between attempts (grows linearly, jittered)
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// TCP connect timeout towards the dump server
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,

    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_store_url() -> String {
    "sqlite://blogstore.db".to_string()
}

fn default_pool_size() -> u32 {
    10
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_exchange() -> String {
    "blogstore".to_string()
}

fn default_resolve_interval_ms() -> u64 {
    10
}

fn default_resolve_retries() -> u32 {
    100
}

fn default_dump_address() -> String {
    "127.0.0.1:0".to_string()
}

fn default_chunk_statements() -> usize {
    500
}

fn default_max_frame_bytes() -> u32 {
    64 * 1024 * 1024
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_max_attempts() -> u32 {
    10
}

fn default_backoff_ms() -> u64 {
    500
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            pool_size: default_pool_size(),
            connect_timeout_secs: default_connect_timeout(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            mode: None,
            exchange: default_exchange(),
            resolve_interval_ms: default_resolve_interval_ms(),
            resolve_retries: default_resolve_retries(),
            completion_timeout_ms: None,
        }
    }
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            bind_address: default_dump_address(),
            advertise_address: None,
            chunk_statements: default_chunk_statements(),
            compression: true,
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
            cors_enabled: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl WriterConfig {
    /// Name of the exchange dumps are negotiated on
    pub fn dump_exchange(&self) -> String {
        format!("{}_dataDump", self.exchange)
    }

    /// Get the settings poll interval as Duration
    pub fn resolve_interval(&self) -> Duration {
        Duration::from_millis(self.resolve_interval_ms)
    }

    /// Get the producer completion timeout as Duration
    pub fn completion_timeout(&self) -> Option<Duration> {
        self.completion_timeout_ms.map(Duration::from_millis)
    }
}

impl BootstrapConfig {
    /// Get the offer timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Get the connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl BlogStoreConfig {
    /// Minimal configuration for the given node, everything else defaulted
    pub fn for_node(node_id: impl Into<String>) -> Self {
        Self {
            node: NodeConfig { id: node_id.into() },
            store: StoreConfig::default(),
            writer: WriterConfig::default(),
            dump: DumpConfig::default(),
            bootstrap: BootstrapConfig::default(),
            api: ApiConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: BlogStoreConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.writer.exchange.is_empty() {
            return Err(crate::Error::Config("writer.exchange cannot be empty".into()));
        }

        if self.writer.resolve_retries == 0 {
            return Err(crate::Error::Config("writer.resolve_retries must be at least 1".into()));
        }

        if self.bootstrap.max_attempts == 0 {
            return Err(crate::Error::Config("bootstrap.max_attempts must be at least 1".into()));
        }

        if self.dump.chunk_statements == 0 {
            return Err(crate::Error::Config("dump.chunk_statements must be at least 1".into()));
        }

        Ok(())
    }
}
