//! Content Store Module
//!
//! Owns the blog content tables. Only the command processor calls the
//! write half of this API; readers use the query half.

mod dump;
mod entries;
pub mod model;
mod query;

pub use dump::{DataDump, TableDump};
pub use model::{
    Entry, EntryFilter, EntryImage, ImageParam, LangContent, Localization, TagCount,
};

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::error::{Error, Result};

/// Schema version singleton
pub const TABLE_DB_VERSION: &str = "blog_db_version";
/// Entries
pub const TABLE_ENTRIES: &str = "blog_entries";
/// Localizations
pub const TABLE_ENTRY_DATA: &str = "blog_entry_data";
/// Tags per localization
pub const TABLE_ENTRY_TAGS: &str = "blog_entry_tags";
/// Images per entry
pub const TABLE_ENTRY_IMAGES: &str = "blog_entry_images";

/// Every table this content domain owns, parents first
pub const OWNED_TABLES: [&str; 5] = [
    TABLE_DB_VERSION,
    TABLE_ENTRIES,
    TABLE_ENTRY_DATA,
    TABLE_ENTRY_TAGS,
    TABLE_ENTRY_IMAGES,
];

/// Relational store for blog content
pub struct ContentStore {
    pool: SqlitePool,
}

impl ContentStore {
    /// Connect using the store configuration
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect_with(options)
            .await?;

        tracing::debug!("Content store connected to {}", config.url);
        Ok(Self { pool })
    }

    /// Open (or create) a store file at the given path
    pub async fn open(path: &Path) -> Result<Self> {
        let config = StoreConfig {
            url: format!("sqlite://{}", path.display()),
            ..StoreConfig::default()
        };
        Self::connect(&config).await
    }

    /// Underlying connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Check if connection is healthy
    pub async fn health_check(&self) -> Result<bool> {
        let result: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(result.0 == 1)
    }

    /// Get list of tables in the database
    pub async fn list_tables(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    /// Get row count for an owned table
    pub async fn count_rows(&self, table: &str) -> Result<u64> {
        if !OWNED_TABLES.contains(&table) {
            return Err(Error::Internal(format!("{} is not a content table", table)));
        }

        let row: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM \"{}\"", table))
            .fetch_one(&self.pool)
            .await?;

        Ok(row.0 as u64)
    }

    /// Highest applied migration, 0 when the version table does not exist yet
    pub async fn schema_version(&self) -> Result<u32> {
        let exists: Option<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?",
        )
        .bind(TABLE_DB_VERSION)
        .fetch_optional(&self.pool)
        .await?;

        if exists.is_none() {
            return Ok(0);
        }

        let version: Option<(i64,)> =
            sqlx::query_as("SELECT version FROM blog_db_version WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;

        Ok(version.map(|(v,)| v as u32).unwrap_or(0))
    }

    /// Close the connection pool
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Decode an entry id stored as a 16-byte blob
pub(crate) fn uuid_from_blob(bytes: &[u8]) -> Result<Uuid> {
    Uuid::from_slice(bytes)
        .map_err(|e| Error::Internal(format!("Corrupt entry uuid in store: {}", e)))
}

pub(crate) fn to_millis(ts: &DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| Error::Internal(format!("Timestamp {} out of range", ms)))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_and_health() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(&dir.path().join("blog.db")).await.unwrap();

        assert!(store.health_check().await.unwrap());
        assert!(store.list_tables().await.unwrap().is_empty());
        assert_eq!(store.schema_version().await.unwrap(), 0);
        assert!(store.count_rows("users").await.is_err());
    }

    #[tokio::test]
    async fn test_migrated_tables() {
        let (_dir, store) = test_support::migrated_store().await;

        let tables = store.list_tables().await.unwrap();
        for table in OWNED_TABLES {
            assert!(tables.iter().any(|t| t == table), "missing {}", table);
        }
        assert_eq!(store.count_rows(TABLE_ENTRIES).await.unwrap(), 0);
    }

    #[test]
    fn test_millis_round_trip() {
        let ts = from_millis(1_700_000_000_123).unwrap();
        assert_eq!(to_millis(&ts), 1_700_000_000_123);
    }
}
