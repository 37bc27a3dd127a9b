//! Data Dump
//!
//! Snapshot of the owned content tables as an ordered list of SQL
//! statements. A replica applies it to become an exact copy of the source.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;

use super::{ContentStore, OWNED_TABLES, TABLE_DB_VERSION};
use crate::error::{Error, Result};

/// Statements recreating one table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDump {
    pub table: String,
    pub statements: Vec<String>,
}

/// Full snapshot of the content domain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataDump {
    /// Schema version at the time of the snapshot
    pub schema_version: u32,
    pub created: DateTime<Utc>,
    /// Tables in dependency order
    pub tables: Vec<TableDump>,
}

impl DataDump {
    /// Total number of statements
    pub fn statement_count(&self) -> usize {
        self.tables.iter().map(|t| t.statements.len()).sum()
    }

    /// Names of the dumped tables
    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.table.clone()).collect()
    }

    /// Render as a single SQL script
    pub fn to_sql(&self) -> String {
        let mut sql = format!(
            "-- blogstore dump, schema version {}, created {}\n",
            self.schema_version,
            self.created.to_rfc3339()
        );
        for table in &self.tables {
            sql.push_str(&format!("\n-- {}\n", table.table));
            for statement in &table.statements {
                sql.push_str(statement);
                sql.push_str(";\n");
            }
        }
        sql
    }

    /// Reject dumps that touch anything outside the content tables
    ///
    /// Every statement must be a single DROP TABLE, CREATE TABLE, CREATE INDEX
    /// or INSERT whose target is the table it is filed under.
    pub fn validate(&self) -> Result<()> {
        for table in &self.tables {
            if !OWNED_TABLES.contains(&table.table.as_str()) {
                return Err(Error::Dump(format!(
                    "Dump contains foreign table {}",
                    table.table
                )));
            }

            for statement in &table.statements {
                if !is_single_statement(statement) {
                    return Err(Error::Dump(format!(
                        "Dump of {} carries more than one statement per entry",
                        table.table
                    )));
                }
                match statement_target(statement) {
                    Some(target) if target.eq_ignore_ascii_case(&table.table) => {}
                    Some(target) => {
                        return Err(Error::Dump(format!(
                            "Dump of {} writes to table {}",
                            table.table, target
                        )));
                    }
                    None => {
                        return Err(Error::Dump(format!(
                            "Dump of {} contains an unsupported statement",
                            table.table
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Leading token of a statement
#[derive(Debug, PartialEq)]
enum Token {
    Word(String),
    Quoted(String),
    Symbol(char),
}

impl Token {
    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, Token::Word(w) if w.eq_ignore_ascii_case(keyword))
    }
}

/// Splits the head of a statement into words, quoted identifiers and symbols.
/// An unterminated identifier ends the stream.
struct Tokens<'a> {
    rest: &'a str,
}

impl<'a> Iterator for Tokens<'a> {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        self.rest = self.rest.trim_start();
        let c = self.rest.chars().next()?;

        if c.is_ascii_alphanumeric() || c == '_' {
            let end = self
                .rest
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(self.rest.len());
            let (word, rest) = self.rest.split_at(end);
            self.rest = rest;
            return Some(Token::Word(word.to_string()));
        }

        let close = match c {
            '"' | '`' => c,
            '[' => ']',
            _ => {
                self.rest = &self.rest[c.len_utf8()..];
                return Some(Token::Symbol(c));
            }
        };
        let body = &self.rest[1..];
        let end = body.find(close)?;
        self.rest = &body[end + 1..];
        Some(Token::Quoted(body[..end].to_string()))
    }
}

type Head<'a> = std::iter::Peekable<Tokens<'a>>;

fn take_keyword(tokens: &mut Head<'_>, keyword: &str) -> Option<()> {
    tokens.next().filter(|t| t.is_keyword(keyword)).map(|_| ())
}

fn skip_keyword(tokens: &mut Head<'_>, keyword: &str) -> bool {
    if tokens.peek().map_or(false, |t| t.is_keyword(keyword)) {
        tokens.next();
        true
    } else {
        false
    }
}

fn take_name(tokens: &mut Head<'_>) -> Option<String> {
    match tokens.next()? {
        Token::Word(name) | Token::Quoted(name) => Some(name),
        Token::Symbol(_) => None,
    }
}

/// `IF EXISTS` or `IF NOT EXISTS`
fn skip_existence_guard(tokens: &mut Head<'_>, negated: bool) -> Option<()> {
    if skip_keyword(tokens, "IF") {
        if negated {
            take_keyword(tokens, "NOT")?;
        }
        take_keyword(tokens, "EXISTS")?;
    }
    Some(())
}

/// Table a dump statement writes to, `None` for any other kind of statement
fn statement_target(statement: &str) -> Option<String> {
    let mut tokens = Tokens { rest: statement }.peekable();
    let first = tokens.next()?;

    let table = if first.is_keyword("DROP") {
        take_keyword(&mut tokens, "TABLE")?;
        skip_existence_guard(&mut tokens, false)?;
        let table = take_name(&mut tokens)?;
        return match tokens.next() {
            None | Some(Token::Symbol(';')) => Some(table),
            Some(_) => None,
        };
    } else if first.is_keyword("CREATE") {
        if skip_keyword(&mut tokens, "TABLE") {
            skip_existence_guard(&mut tokens, true)?;
            take_name(&mut tokens)?
        } else {
            skip_keyword(&mut tokens, "UNIQUE");
            take_keyword(&mut tokens, "INDEX")?;
            skip_existence_guard(&mut tokens, true)?;
            take_name(&mut tokens)?;
            take_keyword(&mut tokens, "ON")?;
            take_name(&mut tokens)?
        }
    } else if first.is_keyword("INSERT") {
        take_keyword(&mut tokens, "INTO")?;
        take_name(&mut tokens)?
    } else {
        return None;
    };

    // Column list or definitions follow the name directly
    match tokens.next() {
        Some(Token::Symbol('(')) => Some(table),
        _ => None,
    }
}

/// Whether the text holds exactly one statement: no separator, or a trailing
/// one only, and no comments outside quotes
fn is_single_statement(sql: &str) -> bool {
    let mut quote: Option<char> = None;
    let mut chars = sql.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        match quote {
            Some(q) if c == q => {
                // Doubled quote is an escaped quote
                if q != ']' && chars.peek().map_or(false, |(_, nc)| *nc == q) {
                    chars.next();
                } else {
                    quote = None;
                }
            }
            Some(_) => {}
            None => match c {
                '\'' | '"' | '`' => quote = Some(c),
                '[' => quote = Some(']'),
                ';' => return sql[i + 1..].trim().is_empty(),
                '-' if chars.peek().map_or(false, |(_, nc)| *nc == '-') => return false,
                '/' if chars.peek().map_or(false, |(_, nc)| *nc == '*') => return false,
                _ => {}
            },
        }
    }

    quote.is_none()
}

async fn dump_table(conn: &mut SqliteConnection, table: &str) -> Result<Option<TableDump>> {
    let create: Option<(String,)> =
        sqlx::query_as("SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(table)
            .fetch_optional(&mut *conn)
            .await?;

    let Some((create_sql,)) = create else {
        return Ok(None);
    };

    let mut statements = vec![
        format!("DROP TABLE IF EXISTS \"{}\"", table),
        create_sql,
    ];

    // Implicit indexes carry no SQL and come back with the CREATE TABLE
    let indexes: Vec<(String,)> = sqlx::query_as(
        "SELECT sql FROM sqlite_master WHERE type = 'index' AND tbl_name = ? AND sql IS NOT NULL ORDER BY name",
    )
    .bind(table)
    .fetch_all(&mut *conn)
    .await?;
    statements.extend(indexes.into_iter().map(|(sql,)| sql));

    let columns: Vec<(String,)> = sqlx::query_as("SELECT name FROM pragma_table_info(?) ORDER BY cid")
        .bind(table)
        .fetch_all(&mut *conn)
        .await?;

    if !columns.is_empty() {
        let names = columns
            .iter()
            .map(|(c,)| format!("\"{}\"", c))
            .collect::<Vec<_>>()
            .join(", ");
        let values = columns
            .iter()
            .map(|(c,)| format!("quote(\"{}\")", c))
            .collect::<Vec<_>>()
            .join(" || ', ' || ");

        // SQLite renders every value as a literal, blobs included
        let select = format!(
            "SELECT 'INSERT INTO \"{table}\" ({names}) VALUES (' || {values} || ')' FROM \"{table}\" ORDER BY rowid",
        );
        let rows: Vec<(String,)> = sqlx::query_as(&select).fetch_all(&mut *conn).await?;
        statements.extend(rows.into_iter().map(|(sql,)| sql));
    }

    Ok(Some(TableDump {
        table: table.to_string(),
        statements,
    }))
}

impl ContentStore {
    /// Export a consistent snapshot of the content tables
    pub async fn export_dump(&self) -> Result<DataDump> {
        let mut tx = self.pool.begin().await?;

        let mut tables = Vec::with_capacity(OWNED_TABLES.len());
        for table in OWNED_TABLES {
            if let Some(dump) = dump_table(&mut *tx, table).await? {
                tables.push(dump);
            }
        }

        let schema_version = if tables.iter().any(|t| t.table == TABLE_DB_VERSION) {
            let row: Option<(i64,)> =
                sqlx::query_as("SELECT version FROM blog_db_version WHERE id = 1")
                    .fetch_optional(&mut *tx)
                    .await?;
            row.map(|(v,)| v as u32).unwrap_or(0)
        } else {
            0
        };

        tx.commit().await?;

        let dump = DataDump {
            schema_version,
            created: Utc::now(),
            tables,
        };
        tracing::debug!(
            "Exported dump: {} tables, {} statements, schema version {}",
            dump.tables.len(),
            dump.statement_count(),
            dump.schema_version
        );
        Ok(dump)
    }

    /// Replace the local content tables with a dump
    pub async fn apply_dump(&self, dump: &DataDump) -> Result<()> {
        dump.validate()?;

        let mut tx = self.pool.begin().await?;
        for table in &dump.tables {
            for statement in &table.statements {
                sqlx::query(statement)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| {
                        Error::Dump(format!("Failed applying dump of {}: {}", table.table, e))
                    })?;
            }
        }
        tx.commit().await?;

        tracing::info!(
            "Applied dump: {} tables, {} statements, schema version {}",
            dump.tables.len(),
            dump.statement_count(),
            dump.schema_version
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use uuid::Uuid;
    use crate::store::model::{EntryFilter, ImageParam, LangContent};
    use crate::store::test_support::migrated_store;
    use crate::store::TABLE_ENTRIES;

    async fn seed(store: &ContentStore) -> Uuid {
        let id = Uuid::new_v4();
        let mut langs = BTreeMap::new();
        langs.insert(
            "en".to_string(),
            LangContent {
                header: Some("It's a 'quoted' header".into()),
                body: Some("line one\nline two".into()),
                slug: Some("quoted".into()),
                tags: Some("a,b".into()),
                ..LangContent::default()
            },
        );
        store
            .save_entry(id, Some(Some(Utc::now())), Some(&langs))
            .await
            .unwrap();
        store
            .set_images(id, &[ImageParam { number: 1, uri: "img/1.png".into() }], true)
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn test_export_shape() {
        let (_dir, store) = migrated_store().await;
        seed(&store).await;

        let dump = store.export_dump().await.unwrap();
        assert_eq!(dump.schema_version, 3);
        assert_eq!(dump.table_names(), OWNED_TABLES.to_vec());

        let entries = dump.tables.iter().find(|t| t.table == TABLE_ENTRIES).unwrap();
        assert!(entries.statements[0].starts_with("DROP TABLE IF EXISTS"));
        assert!(entries.statements[1].starts_with("CREATE TABLE"));
        assert!(entries.statements.iter().any(|s| s.starts_with("CREATE INDEX")));
        assert!(entries.statements.last().unwrap().starts_with("INSERT INTO"));

        assert!(dump.to_sql().contains("-- blog_entry_tags"));
    }

    #[tokio::test]
    async fn test_apply_makes_copy() {
        let (_src_dir, source) = migrated_store().await;
        let id = seed(&source).await;
        let dump = source.export_dump().await.unwrap();

        // Replica has stale data that must disappear
        let (_dst_dir, replica) = migrated_store().await;
        let stale = seed(&replica).await;
        replica.rm_entry(stale).await.unwrap();
        seed(&replica).await;

        replica.apply_dump(&dump).await.unwrap();

        let copied = replica.get_entries(&EntryFilter::default()).await.unwrap();
        let original = source.get_entries(&EntryFilter::default()).await.unwrap();
        assert_eq!(copied, original);
        assert_eq!(copied.len(), 1);
        assert_eq!(copied[0].uuid, id);
        assert_eq!(copied[0].langs["en"].header.as_deref(), Some("It's a 'quoted' header"));
        assert_eq!(replica.schema_version().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_apply_to_empty_database() {
        let (_src_dir, source) = migrated_store().await;
        seed(&source).await;
        let dump = source.export_dump().await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let fresh = ContentStore::open(&dir.path().join("fresh.db")).await.unwrap();
        fresh.apply_dump(&dump).await.unwrap();

        assert_eq!(fresh.entry_count().await.unwrap(), 1);
        assert_eq!(fresh.schema_version().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_foreign_table_rejected() {
        let (_dir, store) = migrated_store().await;
        let id = seed(&store).await;

        let dump = DataDump {
            schema_version: 3,
            created: Utc::now(),
            tables: vec![
                TableDump {
                    table: TABLE_ENTRIES.to_string(),
                    statements: vec!["DROP TABLE IF EXISTS \"blog_entries\"".to_string()],
                },
                TableDump {
                    table: "users".to_string(),
                    statements: vec!["DROP TABLE IF EXISTS users".to_string()],
                },
            ],
        };

        let result = store.apply_dump(&dump).await;
        assert!(matches!(result, Err(Error::Dump(_))));
        assert!(store.entry_exists(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_statements_must_target_their_table() {
        let (_dir, store) = migrated_store().await;
        let id = seed(&store).await;

        let smuggled = [
            "CREATE TABLE users (id INTEGER)",
            "DELETE FROM blog_entries",
            "CREATE TABLE blog_entries AS SELECT * FROM blog_entry_data",
            "CREATE INDEX idx_users ON users (id)",
            "INSERT INTO main.users (id) VALUES (1)",
            "INSERT INTO blog_entries (uuid) VALUES (1); CREATE TABLE users (id INTEGER)",
            "INSERT INTO blog_entries (uuid) VALUES (1) -- '\n; CREATE TABLE users (id INTEGER)",
            "CREATE TRIGGER t AFTER INSERT ON blog_entries BEGIN DELETE FROM blog_entry_data; END",
        ];

        for statement in smuggled {
            let dump = DataDump {
                schema_version: 3,
                created: Utc::now(),
                tables: vec![TableDump {
                    table: TABLE_ENTRIES.to_string(),
                    statements: vec![statement.to_string()],
                }],
            };
            let result = store.apply_dump(&dump).await;
            assert!(matches!(result, Err(Error::Dump(_))), "accepted: {}", statement);
        }

        assert!(store.entry_exists(id).await.unwrap());
        assert!(!store.list_tables().await.unwrap().contains(&"users".to_string()));
    }

    #[test]
    fn test_statement_target() {
        assert_eq!(
            statement_target("DROP TABLE IF EXISTS \"blog_entries\"").as_deref(),
            Some("blog_entries")
        );
        assert_eq!(
            statement_target("create table if not exists blog_entries (uuid BLOB)").as_deref(),
            Some("blog_entries")
        );
        assert_eq!(
            statement_target("CREATE UNIQUE INDEX idx_x ON [blog_entry_tags] (content)").as_deref(),
            Some("blog_entry_tags")
        );
        assert_eq!(
            statement_target("INSERT INTO \"blog_entry_images\" (\"uri\") VALUES ('a;b')").as_deref(),
            Some("blog_entry_images")
        );
        assert_eq!(statement_target("DROP TABLE blog_entries CASCADE"), None);
        assert_eq!(statement_target("UPDATE blog_entries SET created = 0"), None);

        assert!(is_single_statement("INSERT INTO t (a) VALUES ('x; -- y');"));
        assert!(!is_single_statement("DROP TABLE t; DROP TABLE u"));
        assert!(!is_single_statement("DROP TABLE t /* x */"));
    }

    #[tokio::test]
    async fn test_failed_apply_rolls_back() {
        let (_dir, store) = migrated_store().await;
        let id = seed(&store).await;

        let dump = DataDump {
            schema_version: 3,
            created: Utc::now(),
            tables: vec![TableDump {
                table: TABLE_ENTRIES.to_string(),
                statements: vec![
                    "DROP TABLE IF EXISTS \"blog_entry_data\"".to_string(),
                    "INSERT INTO blog_entry_data (no_such_column) VALUES (1)".to_string(),
                ],
            }],
        };

        assert!(store.apply_dump(&dump).await.is_err());
        assert!(store.entry_exists(id).await.unwrap());
        let entries = store.get_entries(&EntryFilter::by_uuid(id)).await.unwrap();
        assert!(entries[0].langs.contains_key("en"));
    }
}
