//! Namespaced key/value memory store.
//!
//! [`MemoryStore`] is the single source of truth for agent state. Each write is
//! one transaction covering the value, its access metadata, its expiry, and
//! the `entry-stored` event. Access levels are enforced when an entry is read,
//! not when it is written.
//!
//! Expiry is lazy: an entry past its TTL is invisible to [`MemoryStore::retrieve`]
//! and [`MemoryStore::query`] immediately, and the background sweep reclaims
//! the row later in bounded batches.
//!
//! # Example
//!
//! ```rust,ignore
//! use swarmkernel::{AccessLevel, AgentContext, EntryKey, StoreOptions};
//!
//! let agent = AgentContext::new("agent-42").with_team("build");
//! let key = EntryKey::new("agents", "agent/42/task")?;
//! store.store(&key, b"done".to_vec(), StoreOptions::new(&agent).with_access(AccessLevel::Team))?;
//! assert_eq!(store.retrieve(&key, &agent)?, b"done");
//! ```

pub mod access;
mod query;
mod sweep;

pub use query::{DEFAULT_PAGE_SIZE, EntryQuery, QueryOptions};
pub use sweep::{SweepBatch, SweepSummary};

use crate::clock::SharedClock;
use crate::events::EventLog;
use crate::models::{
    AccessLevel, AgentContext, EntryKey, EventType, KernelEvent, MAX_KEY_LEN, MemoryEntry,
    validate_namespace,
};
use crate::storage::Database;
use crate::storage::sqlite::{from_sql_i64, glob_matches, glob_to_like_pattern, to_sql_i64};
use crate::{Error, Result};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use serde_json::json;
use std::sync::Arc;
use tracing::instrument;

/// Column list matching [`entry_from_row`].
pub(crate) const ENTRY_COLUMNS: &str = "namespace, key, value, owner, owner_team, owner_swarm, \
     access_level, ttl, created_at, version";

/// Options for [`MemoryStore::store`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Writing agent; becomes the entry owner.
    pub owner: AgentContext,
    /// Lifetime in seconds; 0 never expires.
    pub ttl_seconds: u64,
    /// Read-time visibility.
    pub access_level: AccessLevel,
    /// Optimistic concurrency check. `Some(0)` means "create only".
    pub expected_version: Option<u64>,
}

impl StoreOptions {
    /// Private, non-expiring, unconditional write by `owner`.
    #[must_use]
    pub fn new(owner: &AgentContext) -> Self {
        Self {
            owner: owner.clone(),
            ttl_seconds: 0,
            access_level: AccessLevel::Private,
            expected_version: None,
        }
    }

    /// Sets the TTL.
    #[must_use]
    pub const fn with_ttl(mut self, ttl_seconds: u64) -> Self {
        self.ttl_seconds = ttl_seconds;
        self
    }

    /// Sets the access level.
    #[must_use]
    pub const fn with_access(mut self, access_level: AccessLevel) -> Self {
        self.access_level = access_level;
        self
    }

    /// Requires the current version to equal `version`.
    #[must_use]
    pub const fn expecting_version(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }
}

/// Row counts by lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Readable entries.
    pub live: u64,
    /// Past TTL but not yet swept.
    pub expired_pending: u64,
    /// Deleted, awaiting purge.
    pub tombstoned: u64,
}

/// Durable namespaced key/value store.
pub struct MemoryStore {
    db: Arc<Database>,
    events: Arc<EventLog>,
    clock: SharedClock,
    tombstone_grace_seconds: u64,
}

impl MemoryStore {
    /// Creates a store over an open database.
    #[must_use]
    pub fn new(
        db: Arc<Database>,
        events: Arc<EventLog>,
        clock: SharedClock,
        tombstone_grace_seconds: u64,
    ) -> Self {
        Self {
            db,
            events,
            clock,
            tombstone_grace_seconds,
        }
    }

    /// Writes an entry atomically.
    ///
    /// Last write wins unless `options.expected_version` is set. A deleted or
    /// expired entry counts as version 0 for that check; the stored version
    /// keeps increasing across delete and re-create while the row exists.
    ///
    /// # Errors
    ///
    /// - [`Error::Conflict`] if the expected version does not match
    /// - [`Error::Storage`] if the transaction fails
    #[instrument(
        skip_all,
        fields(
            component = "memory",
            operation = "store",
            key = %key,
            owner = %options.owner.agent_id,
            access = %options.access_level
        )
    )]
    pub fn store(
        &self,
        key: &EntryKey,
        value: Vec<u8>,
        options: StoreOptions,
    ) -> Result<MemoryEntry> {
        let now = self.clock.now_millis();
        let (entry, event) = self.db.write("memory", "store", |conn| {
            let entry = Self::write_entry(conn, key, value, &options, now)?;
            let event = self.stored_event(&entry);
            EventLog::insert(conn, &event)?;
            Ok((entry, event))
        })?;
        self.events.publish([event]);
        Ok(entry)
    }

    /// Reads an entry's value.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the entry is missing, deleted, or expired
    /// - [`Error::AccessDenied`] if `requester` may not read it
    pub fn retrieve(&self, key: &EntryKey, requester: &AgentContext) -> Result<Vec<u8>> {
        self.retrieve_entry(key, requester).map(|e| e.value)
    }

    /// Reads a full entry including its metadata.
    ///
    /// # Errors
    ///
    /// Same as [`retrieve`](Self::retrieve).
    #[instrument(
        skip_all,
        fields(component = "memory", operation = "retrieve", key = %key, agent = %requester.agent_id)
    )]
    pub fn retrieve_entry(&self, key: &EntryKey, requester: &AgentContext) -> Result<MemoryEntry> {
        let now = self.clock.now_millis();
        let entry = self
            .db
            .read("memory", "retrieve", |conn| Self::load_live(conn, key, now))?
            .ok_or_else(|| not_found(key))?;
        access::check_read(&entry, requester)?;
        Ok(entry)
    }

    /// Returns entries whose key matches a glob pattern (`*`, `?`).
    ///
    /// The result is a snapshot of matching keys as of this call, loaded
    /// lazily and ordered by namespace then key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for a malformed namespace or pattern, or
    /// [`Error::Storage`] if the key snapshot cannot be read.
    #[instrument(skip(self, options), fields(component = "memory", operation = "query"))]
    pub fn query(&self, pattern: &str, options: QueryOptions) -> Result<EntryQuery> {
        validate_pattern(pattern)?;
        if let Some(namespace) = &options.namespace {
            validate_namespace(namespace)?;
        }

        let now = to_sql_i64(self.clock.now_millis());
        let mut sql = String::from(
            "SELECT namespace, key FROM memory_entries
             WHERE key LIKE ?1 ESCAPE '\\'
               AND tombstoned_at IS NULL
               AND (expires_at IS NULL OR expires_at >= ?2)",
        );
        let mut values: Vec<Value> = vec![glob_to_like_pattern(pattern).into(), now.into()];
        if let Some(namespace) = &options.namespace {
            sql.push_str(" AND namespace = ?3");
            values.push(namespace.clone().into());
        }
        sql.push_str(" ORDER BY namespace, key");

        let mut keys: Vec<(String, String)> = self.db.read("memory", "query_keys", |conn| {
            let mut stmt = conn
                .prepare_cached(&sql)
                .map_err(Error::storage("prepare_query_keys"))?;
            let rows = stmt
                .query_map(params_from_iter(values.iter()), |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })
                .map_err(Error::storage("query_keys"))?;
            let mut keys = Vec::new();
            for row in rows {
                let (namespace, key) = row.map_err(Error::storage("read_key_row"))?;
                // LIKE folds ASCII case; confirm with a case-sensitive match.
                if glob_matches(pattern, &key) {
                    keys.push((namespace, key));
                }
            }
            Ok(keys)
        })?;

        if options.requester.is_none() {
            if let Some(limit) = options.limit {
                keys.truncate(limit);
            }
        }
        tracing::debug!(matched = keys.len(), "Query snapshot captured");

        Ok(EntryQuery::new(
            Arc::clone(&self.db),
            Arc::clone(&self.clock),
            keys,
            options,
        ))
    }

    /// Deletes an entry immediately, regardless of TTL.
    ///
    /// Idempotent: returns `false` (not an error) when there is no live entry.
    /// The caller must be able to read the entry to delete it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AccessDenied`] if `requester` may not read the entry,
    /// or [`Error::Storage`] if the transaction fails.
    #[instrument(
        skip_all,
        fields(component = "memory", operation = "delete", key = %key, agent = %requester.agent_id)
    )]
    pub fn delete(&self, key: &EntryKey, requester: &AgentContext) -> Result<bool> {
        let now = self.clock.now_millis();
        let event = self.db.write("memory", "delete", |conn| {
            let Some(entry) = Self::load_live(conn, key, now)? else {
                return Ok(None);
            };
            access::check_read(&entry, requester)?;

            conn.execute(
                "UPDATE memory_entries SET tombstoned_at = ?3
                 WHERE namespace = ?1 AND key = ?2 AND tombstoned_at IS NULL",
                params![key.namespace(), key.key(), to_sql_i64(now)],
            )
            .map_err(Error::storage("tombstone_entry"))?;

            let event = self.events.event(
                EventType::EntryDeleted,
                &requester.agent_id,
                json!({
                    "namespace": key.namespace(),
                    "key": key.key(),
                    "version": entry.version,
                }),
            );
            EventLog::insert(conn, &event)?;
            Ok(Some(event))
        })?;

        let deleted = event.is_some();
        self.events.publish(event);
        Ok(deleted)
    }

    /// Row counts by lifecycle state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the query fails.
    pub fn stats(&self) -> Result<StoreStats> {
        let now = to_sql_i64(self.clock.now_millis());
        self.db.read("memory", "stats", |conn| {
            conn.query_row(
                "SELECT
                    COALESCE(SUM(CASE WHEN tombstoned_at IS NULL
                        AND (expires_at IS NULL OR expires_at >= ?1) THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN tombstoned_at IS NULL
                        AND expires_at IS NOT NULL AND expires_at < ?1 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN tombstoned_at IS NOT NULL THEN 1 ELSE 0 END), 0)
                 FROM memory_entries",
                [now],
                |row| {
                    Ok(StoreStats {
                        live: from_sql_i64(row.get(0)?),
                        expired_pending: from_sql_i64(row.get(1)?),
                        tombstoned: from_sql_i64(row.get(2)?),
                    })
                },
            )
            .map_err(Error::storage("entry_stats"))
        })
    }

    /// Writes an entry inside an open transaction, without recording events.
    pub(crate) fn write_entry(
        conn: &Connection,
        key: &EntryKey,
        value: Vec<u8>,
        options: &StoreOptions,
        now: u64,
    ) -> Result<MemoryEntry> {
        let existing: Option<(i64, Option<i64>, Option<i64>)> = conn
            .query_row(
                "SELECT version, tombstoned_at, expires_at FROM memory_entries
                 WHERE namespace = ?1 AND key = ?2",
                params![key.namespace(), key.key()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(Error::storage("read_entry_version"))?;

        let stored_version = existing.map_or(0, |(v, _, _)| from_sql_i64(v));
        let live_version = match existing {
            Some((v, None, expires_at))
                if expires_at.is_none_or(|at| from_sql_i64(at) >= now) =>
            {
                from_sql_i64(v)
            },
            _ => 0,
        };

        if let Some(expected) = options.expected_version {
            if expected != live_version {
                metrics::counter!("memory_version_conflicts_total").increment(1);
                return Err(Error::Conflict {
                    key: key.to_string(),
                    expected,
                    actual: live_version,
                });
            }
        }

        let entry = MemoryEntry {
            key: key.clone(),
            value,
            owner: options.owner.agent_id.clone(),
            owner_team: options.owner.team_id.clone(),
            owner_swarm: options.owner.swarm_id.clone(),
            access_level: options.access_level,
            ttl_seconds: options.ttl_seconds,
            created_at: now,
            version: stored_version.saturating_add(1),
        };

        conn.execute(
            "INSERT INTO memory_entries
                (namespace, key, value, owner, owner_team, owner_swarm, access_level,
                 ttl, created_at, expires_at, version, tombstoned_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, NULL)
             ON CONFLICT (namespace, key) DO UPDATE SET
                value = excluded.value,
                owner = excluded.owner,
                owner_team = excluded.owner_team,
                owner_swarm = excluded.owner_swarm,
                access_level = excluded.access_level,
                ttl = excluded.ttl,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at,
                version = excluded.version,
                tombstoned_at = NULL",
            params![
                key.namespace(),
                key.key(),
                entry.value,
                entry.owner,
                entry.owner_team,
                entry.owner_swarm,
                entry.access_level.as_str(),
                to_sql_i64(entry.ttl_seconds),
                to_sql_i64(entry.created_at),
                entry.expires_at().map(to_sql_i64),
                to_sql_i64(entry.version),
            ],
        )
        .map_err(Error::storage("upsert_entry"))?;

        metrics::counter!("memory_entries_stored_total", "access" => entry.access_level.as_str())
            .increment(1);
        Ok(entry)
    }

    /// Builds the `entry-stored` event for a written entry.
    pub(crate) fn stored_event(&self, entry: &MemoryEntry) -> KernelEvent {
        self.events.event(
            EventType::EntryStored,
            &entry.owner,
            json!({
                "namespace": entry.key.namespace(),
                "key": entry.key.key(),
                "version": entry.version,
                "access_level": entry.access_level.as_str(),
                "ttl_seconds": entry.ttl_seconds,
            }),
        )
    }

    /// Loads an entry that is neither tombstoned nor expired at `now`.
    fn load_live(conn: &Connection, key: &EntryKey, now: u64) -> Result<Option<MemoryEntry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM memory_entries
             WHERE namespace = ?1 AND key = ?2
               AND tombstoned_at IS NULL
               AND (expires_at IS NULL OR expires_at >= ?3)"
        );
        conn.query_row(
            &sql,
            params![key.namespace(), key.key(), to_sql_i64(now)],
            entry_from_row,
        )
        .optional()
        .map_err(Error::storage("load_entry"))
    }

    pub(crate) fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub(crate) fn event_log(&self) -> &Arc<EventLog> {
        &self.events
    }

    pub(crate) fn clock(&self) -> &SharedClock {
        &self.clock
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("db", &self.db)
            .field("tombstone_grace_seconds", &self.tombstone_grace_seconds)
            .finish_non_exhaustive()
    }
}

/// Maps a row selected with [`ENTRY_COLUMNS`].
pub(crate) fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<MemoryEntry> {
    let level: String = row.get(6)?;
    let key = EntryKey::from_stored(row.get(0)?, row.get(1)?);
    // Unknown levels from a newer build fail closed.
    let access_level = AccessLevel::parse(&level).unwrap_or_else(|| {
        tracing::warn!(key = %key, level = %level, "Unknown access level; treating as system");
        AccessLevel::System
    });
    Ok(MemoryEntry {
        key,
        value: row.get(2)?,
        owner: row.get(3)?,
        owner_team: row.get(4)?,
        owner_swarm: row.get(5)?,
        access_level,
        ttl_seconds: from_sql_i64(row.get(7)?),
        created_at: from_sql_i64(row.get(8)?),
        version: from_sql_i64(row.get(9)?),
    })
}

fn not_found(key: &EntryKey) -> Error {
    Error::NotFound {
        kind: "entry",
        id: key.to_string(),
    }
}

pub(crate) fn validate_pattern(pattern: &str) -> Result<()> {
    if pattern.is_empty() || pattern.len() > MAX_KEY_LEN {
        return Err(Error::Validation(format!(
            "key pattern must be 1..={MAX_KEY_LEN} bytes"
        )));
    }
    if pattern.chars().any(char::is_control) {
        return Err(Error::Validation(
            "key pattern must not contain control characters".to_string(),
        ));
    }
    Ok(())
}
