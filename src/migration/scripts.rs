//! Built-in schema scripts for the content tables

use super::{Migration, SqlMigration};

const ENTRIES: &str = r#"
CREATE TABLE IF NOT EXISTS blog_entries (
    uuid BLOB NOT NULL PRIMARY KEY,
    created INTEGER NOT NULL,
    published INTEGER
);
CREATE INDEX IF NOT EXISTS idx_blog_entries_published ON blog_entries (published);

CREATE TABLE IF NOT EXISTS blog_entry_data (
    entry_uuid BLOB NOT NULL,
    lang TEXT NOT NULL,
    header TEXT,
    summary TEXT,
    body TEXT,
    slug TEXT,
    PRIMARY KEY (entry_uuid, lang),
    UNIQUE (lang, slug)
);
"#;

const TAGS: &str = r#"
CREATE TABLE IF NOT EXISTS blog_entry_tags (
    entry_uuid BLOB NOT NULL,
    lang TEXT NOT NULL,
    tag_nr INTEGER NOT NULL,
    content TEXT NOT NULL,
    PRIMARY KEY (entry_uuid, lang, tag_nr)
);
CREATE INDEX IF NOT EXISTS idx_blog_entry_tags_content ON blog_entry_tags (content);
"#;

const IMAGES: &str = r#"
CREATE TABLE IF NOT EXISTS blog_entry_images (
    entry_uuid BLOB NOT NULL,
    img_nr INTEGER NOT NULL,
    uri TEXT NOT NULL,
    PRIMARY KEY (entry_uuid, img_nr)
);
"#;

/// Migrations every store runs, in order
pub fn builtin() -> Vec<Box<dyn Migration>> {
    vec![
        Box::new(SqlMigration::new(1, "entries and localizations", ENTRIES)),
        Box::new(SqlMigration::new(2, "tags", TAGS)),
        Box::new(SqlMigration::new(3, "images", IMAGES)),
    ]
}
