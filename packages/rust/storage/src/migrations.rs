//! SQL migration definitions for the DocVault state database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

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
        description: "Initial schema: fingerprints, build_runs",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One checksummed record per known source unit
CREATE TABLE IF NOT EXISTS fingerprints (
    unit_id     TEXT PRIMARY KEY,
    record_json TEXT NOT NULL,
    checksum    TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

-- Build invocation history
CREATE TABLE IF NOT EXISTS build_runs (
    id           TEXT PRIMARY KEY,
    finished_at  TEXT NOT NULL,
    full_build   INTEGER NOT NULL DEFAULT 0,
    summary_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_build_runs_finished ON build_runs(finished_at);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
