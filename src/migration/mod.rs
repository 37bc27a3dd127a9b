//! Migration Runner
//!
//! Applies ordered, versioned schema changes exactly once. The applied
//! version lives in the `blog_db_version` singleton row.
//!
//! Every step runs in its own transaction whose first statement writes the
//! version row. SQLite hands the write lock to one connection at a time, so
//! two processes on the same database file serialize on each step and the
//! loser sees the bumped version and skips it.

mod scripts;

use sqlx::{SqliteConnection, SqlitePool};

use crate::error::{Error, Result};

/// A single schema change
#[async_trait::async_trait]
pub trait Migration: Send + Sync {
    /// Ordinal, starting at 1
    fn version(&self) -> u32;

    /// Human readable name for logs
    fn name(&self) -> &str;

    /// Apply the change inside the step transaction
    async fn apply(&self, conn: &mut SqliteConnection) -> Result<()>;
}

/// Migration made of a SQL script
pub struct SqlMigration {
    version: u32,
    name: String,
    sql: String,
}

impl SqlMigration {
    pub fn new(version: u32, name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            version,
            name: name.into(),
            sql: sql.into(),
        }
    }
}

#[async_trait::async_trait]
impl Migration for SqlMigration {
    fn version(&self) -> u32 {
        self.version
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn apply(&self, conn: &mut SqliteConnection) -> Result<()> {
        for statement in split_sql_statements(&self.sql) {
            tracing::trace!("Migration {}: {}", self.version, statement);
            sqlx::query(statement).execute(&mut *conn).await?;
        }
        Ok(())
    }
}

/// Runs migrations against a store
pub struct MigrationRunner {
    pool: SqlitePool,
    migrations: Vec<Box<dyn Migration>>,
}

impl MigrationRunner {
    /// Create a runner with a custom migration set
    pub fn new(pool: SqlitePool, migrations: Vec<Box<dyn Migration>>) -> Self {
        Self { pool, migrations }
    }

    /// Create a runner with the built-in content migrations
    pub fn builtin(pool: SqlitePool) -> Self {
        Self::new(pool, scripts::builtin())
    }

    /// Highest ordinal known to this runner
    pub fn latest_version(&self) -> u32 {
        self.migrations.iter().map(|m| m.version()).max().unwrap_or(0)
    }

    /// Persisted schema version
    pub async fn current_version(&self) -> Result<u32> {
        self.ensure_version_table().await?;
        let (version,): (i64,) = sqlx::query_as("SELECT version FROM blog_db_version WHERE id = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(version as u32)
    }

    /// Apply all pending migrations, returning the resulting version
    pub async fn run(&self) -> Result<u32> {
        let ordered = self.ordered()?;
        self.ensure_version_table().await?;

        let mut version = self.current_version().await?;
        let pending = ordered.iter().filter(|m| m.version() > version).count();
        if pending == 0 {
            tracing::debug!("Schema is up to date at version {}", version);
            return Ok(version);
        }

        tracing::info!(
            "Running {} pending migrations (current version {})",
            pending,
            version
        );

        for migration in ordered {
            if migration.version() <= version {
                continue;
            }
            if self.apply_step(migration).await? {
                tracing::info!(
                    "Applied migration {} ({})",
                    migration.version(),
                    migration.name()
                );
            }
            version = version.max(migration.version());
        }

        Ok(version)
    }

    /// Migrations sorted by ordinal; zero and duplicate ordinals are rejected
    fn ordered(&self) -> Result<Vec<&dyn Migration>> {
        let mut ordered: Vec<&dyn Migration> = self.migrations.iter().map(|m| m.as_ref()).collect();
        ordered.sort_by_key(|m| m.version());

        for (i, migration) in ordered.iter().enumerate() {
            if migration.version() == 0 {
                return Err(Error::Config(format!(
                    "Migration {} has ordinal 0, ordinals start at 1",
                    migration.name()
                )));
            }
            if i > 0 && ordered[i - 1].version() == migration.version() {
                return Err(Error::Config(format!(
                    "Duplicate migration ordinal {}",
                    migration.version()
                )));
            }
        }

        Ok(ordered)
    }

    async fn ensure_version_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS blog_db_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL DEFAULT 0,
                running INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("INSERT OR IGNORE INTO blog_db_version (id, version, running) VALUES (1, 0, 0)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Apply one step; `false` when another process got there first
    async fn apply_step(&self, migration: &dyn Migration) -> Result<bool> {
        let target = migration.version();
        let mut tx = self.pool.begin().await?;

        // Writing first takes the database write lock for the whole step
        sqlx::query("UPDATE blog_db_version SET running = 1 WHERE id = 1")
            .execute(&mut *tx)
            .await?;

        let (current,): (i64,) = sqlx::query_as("SELECT version FROM blog_db_version WHERE id = 1")
            .fetch_one(&mut *tx)
            .await?;

        if current as u32 >= target {
            tracing::debug!("Migration {} already applied elsewhere", target);
            tx.rollback().await?;
            return Ok(false);
        }

        if let Err(e) = migration.apply(&mut *tx).await {
            tracing::error!("Migration {} ({}) failed: {}", target, migration.name(), e);
            tx.rollback().await?;
            return Err(Error::Migration {
                version: target,
                reason: e.to_string(),
            });
        }

        sqlx::query("UPDATE blog_db_version SET version = ?, running = 0 WHERE id = 1")
            .bind(i64::from(target))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }
}

/// Split SQL string on semicolons, respecting string literals
/// This handles cases like: "CREATE TABLE foo (name TEXT DEFAULT 'a;b'); CREATE INDEX ..."
pub(crate) fn split_sql_statements(sql: &str) -> Vec<&str> {
    let mut statements = Vec::new();
    let mut start = 0;
    let mut quote: Option<char> = None;
    let mut chars = sql.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        match quote {
            Some(q) if c == q => {
                // Doubled quote is an escaped quote
                if chars.peek().map(|(_, nc)| *nc == q).unwrap_or(false) {
                    chars.next();
                } else {
                    quote = None;
                }
            }
            Some(_) => {}
            None => match c {
                '\'' | '"' | '`' => quote = Some(c),
                ';' => {
                    let stmt = sql[start..i].trim();
                    if !stmt.is_empty() {
                        statements.push(stmt);
                    }
                    start = i + 1;
                }
                _ => {}
            },
        }
    }

    let remaining = sql[start..].trim();
    if !remaining.is_empty() {
        statements.push(remaining);
    }

    statements
}
