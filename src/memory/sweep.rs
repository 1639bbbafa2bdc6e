//! TTL sweep and tombstone purge.
//!
//! Each batch is its own short transaction, so the writer lock is never held
//! for more than `limit` deletions. Reads go through separate connections and
//! are not blocked while a batch runs.

use super::MemoryStore;
use crate::events::EventLog;
use crate::models::{EntryKey, EventType};
use crate::storage::sqlite::to_sql_i64;
use crate::{Error, Result};
use rusqlite::params;
use serde_json::json;
use std::time::Instant;
use tracing::instrument;

/// Converts usize to f64 for metrics, capping at `u32::MAX`.
fn usize_to_f64(value: usize) -> f64 {
    f64::from(u32::try_from(value).unwrap_or(u32::MAX))
}

/// Result of one sweep batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepBatch {
    /// Entries deleted in this batch.
    pub deleted: usize,
    /// Keys of the deleted entries.
    pub keys: Vec<EntryKey>,
}

impl SweepBatch {
    /// Whether the batch filled its limit, so more work may remain.
    #[must_use]
    pub const fn is_full(&self, limit: usize) -> bool {
        self.deleted >= limit
    }
}

/// Totals across a full sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    /// Expired entries deleted.
    pub expired: usize,
    /// Tombstones purged after their grace period.
    pub tombstones_purged: usize,
    /// Transactions used.
    pub batches: usize,
}

impl MemoryStore {
    /// Deletes up to `limit` entries whose TTL has elapsed.
    ///
    /// Emits one `entry-swept` event listing the deleted keys when anything
    /// was removed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the batch transaction fails; nothing is
    /// deleted in that case.
    #[instrument(skip(self), fields(component = "memory", operation = "sweep_batch"))]
    pub fn sweep_expired_batch(&self, limit: usize) -> Result<SweepBatch> {
        if limit == 0 {
            return Ok(SweepBatch::default());
        }
        let now = to_sql_i64(self.clock().now_millis());
        let limit_sql = to_sql_i64(u64::try_from(limit).unwrap_or(u64::MAX));

        let (batch, event) = self.database().write("memory", "sweep_batch", |conn| {
            let candidates: Vec<(String, String)> = {
                let mut stmt = conn
                    .prepare_cached(
                        "SELECT namespace, key FROM memory_entries
                         WHERE tombstoned_at IS NULL
                           AND expires_at IS NOT NULL AND expires_at < ?1
                         ORDER BY expires_at
                         LIMIT ?2",
                    )
                    .map_err(Error::storage("prepare_sweep_candidates"))?;
                let rows = stmt
                    .query_map(params![now, limit_sql], |row| Ok((row.get(0)?, row.get(1)?)))
                    .map_err(Error::storage("query_sweep_candidates"))?;
                rows.collect::<rusqlite::Result<_>>()
                    .map_err(Error::storage("read_sweep_candidates"))?
            };

            let mut keys = Vec::with_capacity(candidates.len());
            {
                let mut delete = conn
                    .prepare_cached(
                        "DELETE FROM memory_entries
                         WHERE namespace = ?1 AND key = ?2
                           AND tombstoned_at IS NULL AND expires_at < ?3",
                    )
                    .map_err(Error::storage("prepare_sweep_delete"))?;
                for (namespace, key) in candidates {
                    let removed = delete
                        .execute(params![namespace, key, now])
                        .map_err(Error::storage("sweep_delete"))?;
                    if removed > 0 {
                        keys.push(EntryKey::from_stored(namespace, key));
                    }
                }
            }

            if keys.is_empty() {
                return Ok((SweepBatch::default(), None));
            }

            let event = self.event_log().event(
                EventType::EntrySwept,
                "kernel",
                json!({
                    "count": keys.len(),
                    "keys": keys.iter().map(ToString::to_string).collect::<Vec<_>>(),
                }),
            );
            EventLog::insert(conn, &event)?;
            Ok((
                SweepBatch {
                    deleted: keys.len(),
                    keys,
                },
                Some(event),
            ))
        })?;

        self.event_log().publish(event);
        if batch.deleted > 0 {
            metrics::counter!("ttl_sweep_deleted_total").increment(batch.deleted as u64);
            tracing::debug!(deleted = batch.deleted, "Swept expired entries");
        }
        Ok(batch)
    }

    /// Purges up to `limit` tombstones older than the grace period.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the delete fails.
    pub fn purge_tombstones(&self, limit: usize) -> Result<usize> {
        let cutoff = self
            .clock()
            .now_millis()
            .saturating_sub(self.tombstone_grace_seconds.saturating_mul(1000));
        let cutoff = to_sql_i64(cutoff);
        let limit_sql = to_sql_i64(u64::try_from(limit).unwrap_or(u64::MAX));

        let purged = self.database().write("memory", "purge_tombstones", |conn| {
            conn.execute(
                "DELETE FROM memory_entries WHERE (namespace, key) IN (
                    SELECT namespace, key FROM memory_entries
                    WHERE tombstoned_at IS NOT NULL AND tombstoned_at <= ?1
                    ORDER BY tombstoned_at
                    LIMIT ?2
                 )",
                params![cutoff, limit_sql],
            )
            .map_err(Error::storage("purge_tombstones"))
        })?;
        if purged > 0 {
            metrics::counter!("ttl_sweep_tombstones_purged_total").increment(purged as u64);
        }
        Ok(purged)
    }

    /// Runs batches until a batch comes back short, then purges tombstones
    /// the same way.
    ///
    /// The thread yields between batches so other writers can interleave.
    ///
    /// # Errors
    ///
    /// Returns the first batch error. Batches already committed stay
    /// committed.
    #[instrument(skip(self), fields(component = "memory", operation = "sweep_expired"))]
    pub fn sweep_expired(&self, limit: usize) -> Result<SweepSummary> {
        let start = Instant::now();
        let limit = limit.max(1);
        let mut summary = SweepSummary::default();

        loop {
            let batch = self.sweep_expired_batch(limit)?;
            summary.batches += 1;
            summary.expired += batch.deleted;
            if !batch.is_full(limit) {
                break;
            }
            std::thread::yield_now();
        }

        loop {
            let purged = self.purge_tombstones(limit)?;
            summary.batches += 1;
            summary.tombstones_purged += purged;
            if purged < limit {
                break;
            }
            std::thread::yield_now();
        }

        metrics::counter!("ttl_sweep_runs_total").increment(1);
        metrics::gauge!("ttl_sweep_last_expired").set(usize_to_f64(summary.expired));
        metrics::histogram!("ttl_sweep_duration_ms").record(start.elapsed().as_secs_f64() * 1000.0);
        if summary.expired > 0 || summary.tombstones_purged > 0 {
            tracing::info!(
                expired = summary.expired,
                tombstones_purged = summary.tombstones_purged,
                batches = summary.batches,
                "TTL sweep completed"
            );
        }
        Ok(summary)
    }
}
