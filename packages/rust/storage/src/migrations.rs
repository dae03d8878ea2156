//! SQL migration definitions for a generation's `index.db`.
//!
//! Migrations are applied in order when an index database is created.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: entries",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per corpus record, keyed by corpus position.
-- embedding is little-endian f32, 4 bytes per dimension.
CREATE TABLE IF NOT EXISTS entries (
    entry_id   INTEGER PRIMARY KEY,
    source_url TEXT NOT NULL,
    embedding  BLOB NOT NULL
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
