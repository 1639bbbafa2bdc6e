//! Embedded schema migrations.
//!
//! Migrations are applied in order at open time. Applied versions are tracked
//! in `schema_migrations`; a database written by a newer build is refused.

use crate::storage::sqlite::to_sql_i64;
use crate::{Error, Result};
use rusqlite::{Connection, OptionalExtension, params};

/// A single migration with version and SQL.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    /// Migration version (sequential, starting at 1).
    pub version: i64,
    /// Human-readable description.
    pub description: &'static str,
    /// SQL to apply (may contain multiple statements).
    pub sql: &'static str,
}

/// Migrations known to this build.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "memory entries, events, patterns, consensus proposals",
        sql: "
            CREATE TABLE IF NOT EXISTS memory_entries (
                namespace TEXT NOT NULL,
                key TEXT NOT NULL,
                value BLOB NOT NULL,
                owner TEXT NOT NULL,
                owner_team TEXT,
                owner_swarm TEXT,
                access_level TEXT NOT NULL,
                ttl INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                expires_at INTEGER,
                version INTEGER NOT NULL,
                tombstoned_at INTEGER,
                PRIMARY KEY (namespace, key)
            ) WITHOUT ROWID;
            CREATE INDEX IF NOT EXISTS idx_memory_entries_expires_at
                ON memory_entries(expires_at) WHERE expires_at IS NOT NULL;
            CREATE INDEX IF NOT EXISTS idx_memory_entries_tombstoned_at
                ON memory_entries(tombstoned_at) WHERE tombstoned_at IS NOT NULL;

            CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                type TEXT NOT NULL,
                payload TEXT NOT NULL,
                ts INTEGER NOT NULL,
                source TEXT NOT NULL,
                ttl INTEGER NOT NULL DEFAULT 0,
                expires_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_events_ts ON events(ts DESC);
            CREATE INDEX IF NOT EXISTS idx_events_type_ts ON events(type, ts DESC);
            CREATE INDEX IF NOT EXISTS idx_events_expires_at
                ON events(expires_at) WHERE expires_at IS NOT NULL;

            CREATE TABLE IF NOT EXISTS patterns (
                id TEXT PRIMARY KEY,
                embedding BLOB NOT NULL,
                dimension INTEGER NOT NULL,
                confidence REAL NOT NULL,
                usage_count INTEGER NOT NULL DEFAULT 0,
                tags TEXT NOT NULL DEFAULT '[]',
                created_at INTEGER NOT NULL,
                source_agent TEXT NOT NULL,
                tier TEXT NOT NULL DEFAULT 'warm',
                last_used_at INTEGER,
                metadata BLOB
            );
            CREATE INDEX IF NOT EXISTS idx_patterns_confidence ON patterns(confidence);

            CREATE TABLE IF NOT EXISTS consensus_proposals (
                id TEXT PRIMARY KEY,
                decision BLOB NOT NULL,
                proposer TEXT NOT NULL,
                quorum INTEGER NOT NULL CHECK (quorum >= 1),
                votes TEXT NOT NULL DEFAULT '{}',
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                ttl INTEGER NOT NULL DEFAULT 0,
                expires_at INTEGER,
                version INTEGER NOT NULL DEFAULT 1
            );
            CREATE INDEX IF NOT EXISTS idx_consensus_proposals_pending
                ON consensus_proposals(status, expires_at);
        ",
    },
];

/// Latest schema version known to this build.
#[must_use]
pub fn latest_version() -> i64 {
    MIGRATIONS.last().map_or(0, |m| m.version)
}

/// Returns the applied schema version, or 0 for a fresh database.
///
/// # Errors
///
/// Returns [`Error::Storage`] if the tracking table cannot be read.
pub fn current_version(conn: &Connection) -> Result<i64> {
    let exists: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'schema_migrations'",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(Error::storage("read_schema_version"))?;
    if exists.is_none() {
        return Ok(0);
    }
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )
    .map_err(Error::storage("read_schema_version"))
}

/// Applies every pending migration, each in its own transaction.
///
/// # Errors
///
/// Returns [`Error::Storage`] if a migration fails or the database was
/// written by a newer schema.
pub fn migrate(conn: &Connection, migrations: &[Migration]) -> Result<i64> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at INTEGER NOT NULL
        )",
    )
    .map_err(Error::storage("create_migrations_table"))?;

    let current = current_version(conn)?;
    let latest = migrations.last().map_or(0, |m| m.version);
    if current > latest {
        return Err(Error::Storage {
            operation: "migrate".to_string(),
            cause: format!("database schema v{current} is newer than supported v{latest}"),
        });
    }

    for migration in migrations.iter().filter(|m| m.version > current) {
        apply(conn, migration)?;
        tracing::info!(
            version = migration.version,
            description = migration.description,
            "Applied schema migration"
        );
    }

    Ok(latest.max(current))
}

fn apply(conn: &Connection, migration: &Migration) -> Result<()> {
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(Error::storage("begin_migration"))?;

    let result = conn
        .execute_batch(migration.sql)
        .and_then(|()| {
            conn.execute(
                "INSERT INTO schema_migrations (version, description, applied_at)
                 VALUES (?1, ?2, ?3)",
                params![
                    migration.version,
                    migration.description,
                    to_sql_i64(crate::current_timestamp_millis())
                ],
            )
        })
        .map_err(Error::storage("apply_migration"));

    match result {
        Ok(_) => conn
            .execute_batch("COMMIT")
            .map_err(Error::storage("commit_migration")),
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        },
    }
}
