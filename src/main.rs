//! Blogstore - Replicated Single-Writer Content Store
//!
//! Runs a data writer with its HTTP status surface, and offers offline
//! maintenance commands against the configured store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use blogstore::api::HttpServer;
use blogstore::config::BlogStoreConfig;
use blogstore::migration::MigrationRunner;
use blogstore::state::Mode;
use blogstore::store::ContentStore;
use blogstore::writer::DataWriter;

/// Blogstore - Replicated Single-Writer Content Store
#[derive(Parser)]
#[command(name = "blogstore")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "blogstore.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the data writer and HTTP API until interrupted
    Start {
        /// Topology mode; only noSync runs without an external bus
        #[arg(long)]
        mode: Option<Mode>,
    },

    /// Apply pending migrations and exit
    Migrate,

    /// Write the current dump as SQL
    Dump {
        /// Output file (defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "blogstore.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "node-1")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { output, node_id } => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"), "pretty");
            run_init(output, node_id)
        }
        Commands::Validate => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"), "pretty");
            run_validate(cli.config)
        }
        command => {
            let config = load_config(&cli.config)?;
            let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
            init_logging(level, &config.logging.format);

            match command {
                Commands::Start { mode } => run_start(config, mode).await,
                Commands::Migrate => run_migrate(config).await,
                Commands::Dump { output } => run_dump(config, output).await,
                Commands::Info => run_info(config),
                Commands::Init { .. } | Commands::Validate => Ok(()),
            }
        }
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn load_config(path: &Path) -> anyhow::Result<BlogStoreConfig> {
    BlogStoreConfig::from_file(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

/// Mode the standalone binary runs in.
///
/// The binary only has the process-local loopback bus, so replication
/// modes would never see another node.
fn standalone_mode(config: &BlogStoreConfig, requested: Option<Mode>) -> anyhow::Result<Mode> {
    let mode = requested.or(config.writer.mode).unwrap_or(Mode::NoSync);
    if mode.needs_shared_bus() {
        anyhow::bail!(
            "Mode {} needs a command bus shared with other nodes, which the standalone binary \
             does not have. Run with mode noSync, or embed DataWriter and supply a bus with set_bus",
            mode
        );
    }
    Ok(mode)
}

/// Start the data writer
async fn run_start(config: BlogStoreConfig, mode: Option<Mode>) -> anyhow::Result<()> {
    let mode = standalone_mode(&config, mode)?;
    tracing::info!("Starting blogstore node {} in {} mode", config.node.id, mode);

    let api_config = config.api.clone();
    let api_enabled = api_config.enabled;
    let writer = Arc::new(
        DataWriter::connect(config)
            .await
            .context("Failed to open the content store")?,
    );
    writer.set_mode(mode).await?;

    writer.start().await.context("Failed to attach to the command bus")?;
    let http_server = HttpServer::new(api_config, Arc::clone(&writer));

    tokio::select! {
        result = writer.ready() => {
            if let Err(e) = result {
                tracing::error!("Readiness failed: {}", e);
            }
            tokio::select! {
                result = http_server.start(), if api_enabled => {
                    if let Err(e) = result {
                        tracing::error!("HTTP server error: {}", e);
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Received shutdown signal");
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
    }

    writer.shutdown().await;
    writer.store().close().await;
    Ok(())
}

/// Apply migrations against the configured store
async fn run_migrate(config: BlogStoreConfig) -> anyhow::Result<()> {
    let store = ContentStore::connect(&config.store)
        .await
        .context("Failed to open the content store")?;
    let version = MigrationRunner::builtin(store.pool().clone()).run().await?;
    println!("Schema at version {}", version);
    store.close().await;
    Ok(())
}

/// Export the owned tables as SQL
async fn run_dump(config: BlogStoreConfig, output: Option<PathBuf>) -> anyhow::Result<()> {
    let store = ContentStore::connect(&config.store)
        .await
        .context("Failed to open the content store")?;
    let dump = store.export_dump().await?;
    let sql = dump.to_sql();

    match output {
        Some(path) => {
            std::fs::write(&path, sql)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!(
                "Wrote {} statements (schema version {}) to {}",
                dump.statement_count(),
                dump.schema_version,
                path.display()
            );
        }
        None => print!("{}", sql),
    }

    store.close().await;
    Ok(())
}

/// Create configuration file
fn run_init(output: PathBuf, node_id: String) -> anyhow::Result<()> {
    let config_content = format!(r#"# Blogstore Configuration
# Generated configuration file

[node]
id = "{node_id}"

[store]
url = "sqlite://blogstore.db"
pool_size = 10
connect_timeout_secs = 30
busy_timeout_ms = 5000

[writer]
# master, slave, noSync or both
mode = "noSync"
exchange = "blogstore"
resolve_interval_ms = 10
resolve_retries = 100
# completion_timeout_ms = 30000

[dump]
bind_address = "0.0.0.0:7660"
# advertise_address = "my-public-ip:7660"
chunk_statements = 500
compression = true

[bootstrap]
request_timeout_ms = 5000
max_attempts = 10
backoff_ms = 500
connect_timeout_ms = 5000

[api]
enabled = true
bind_address = "0.0.0.0:8080"
cors_enabled = false

[logging]
level = "info"
format = "pretty"
"#);

    std::fs::write(&output, config_content)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!("Configuration file created: {}", output.display());
    println!("Then start with: blogstore start --config {}", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> anyhow::Result<()> {
    match BlogStoreConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Store: {}", config.store.url);
            println!(
                "  Mode: {}",
                config.writer.mode.map_or("(set at runtime)", |m| m.as_str())
            );
            println!("  Exchange: {}", config.writer.exchange);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e.into())
        }
    }
}

/// Show node information
fn run_info(config: BlogStoreConfig) -> anyhow::Result<()> {
    println!("Blogstore Node Information");
    println!("==========================");
    println!();
    println!("Node ID:          {}", config.node.id);
    println!(
        "Mode:             {}",
        config.writer.mode.map_or("(set at runtime)", |m| m.as_str())
    );
    println!();
    println!("Store:");
    println!("  URL:            {}", config.store.url);
    println!("  Pool Size:      {}", config.store.pool_size);
    println!();
    println!("Command Bus:");
    println!("  Exchange:       {}", config.writer.exchange);
    println!("  Dump Exchange:  {}", config.writer.dump_exchange());
    println!();
    println!("Dump Server:");
    println!("  Bind Address:   {}", config.dump.bind_address);
    println!("  Chunk Size:     {} statements", config.dump.chunk_statements);
    println!("  Compression:    {}", config.dump.compression);
    println!();
    println!("Bootstrap:");
    println!("  Max Attempts:   {}", config.bootstrap.max_attempts);
    println!("  Timeout:        {} ms", config.bootstrap.request_timeout_ms);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standalone_mode() {
        let mut config = BlogStoreConfig::for_node("cli");
        assert_eq!(standalone_mode(&config, None).unwrap(), Mode::NoSync);
        assert_eq!(standalone_mode(&config, Some(Mode::NoSync)).unwrap(), Mode::NoSync);

        for mode in [Mode::Master, Mode::Slave, Mode::Both] {
            let err = standalone_mode(&config, Some(mode)).unwrap_err();
            assert!(err.to_string().contains("set_bus"));
        }

        config.writer.mode = Some(Mode::Master);
        assert!(standalone_mode(&config, None).is_err());
        assert_eq!(standalone_mode(&config, Some(Mode::NoSync)).unwrap(), Mode::NoSync);
    }
}
