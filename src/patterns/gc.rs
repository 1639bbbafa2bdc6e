//! Low-confidence pattern collection.

use super::{JournalOp, PatternIndex};
use crate::events::EventLog;
use crate::models::{EventType, PatternId};
use crate::storage::sqlite::to_sql_i64;
use crate::{Error, Result};
use rusqlite::params;
use serde_json::json;
use tracing::instrument;

impl PatternIndex {
    /// Deletes up to `limit` patterns whose confidence is below the floor and
    /// that have not been used within the retention window.
    ///
    /// A never-used pattern counts from its creation time. Emits one
    /// `pattern-collected` event listing the removed ids.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the delete fails; nothing is removed.
    #[instrument(skip(self), fields(component = "patterns", operation = "gc"))]
    pub fn collect_garbage(&self, limit: usize) -> Result<Vec<PatternId>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let cutoff = self
            .clock
            .now_millis()
            .saturating_sub(self.settings.retention_seconds.saturating_mul(1000));
        let floor = self.settings.confidence_floor;

        let (ids, event) = self.db.write("patterns", "gc", |conn| {
            let ids: Vec<String> = {
                let mut stmt = conn
                    .prepare_cached(
                        "DELETE FROM patterns WHERE id IN (
                            SELECT id FROM patterns
                            WHERE confidence < ?1
                              AND COALESCE(last_used_at, created_at) < ?2
                            ORDER BY confidence, id
                            LIMIT ?3
                         )
                         RETURNING id",
                    )
                    .map_err(Error::storage("prepare_pattern_gc"))?;
                let rows = stmt
                    .query_map(
                        params![floor, to_sql_i64(cutoff), to_sql_i64(limit as u64)],
                        |row| row.get(0),
                    )
                    .map_err(Error::storage("pattern_gc"))?;
                rows.collect::<rusqlite::Result<_>>()
                    .map_err(Error::storage("read_collected_ids"))?
            };
            if ids.is_empty() {
                return Ok((ids, None));
            }

            let event = self.events.event(
                EventType::PatternCollected,
                "kernel",
                json!({ "ids": ids, "reason": "low_confidence" }),
            );
            EventLog::insert(conn, &event)?;
            Ok((ids, Some(event)))
        })?;

        for id in &ids {
            self.apply(JournalOp::Remove(id.clone()));
        }
        self.events.publish(event);
        if !ids.is_empty() {
            metrics::counter!("pattern_gc_collected_total").increment(ids.len() as u64);
            tracing::info!(collected = ids.len(), "Collected low-confidence patterns");
        }
        Ok(ids.into_iter().map(PatternId::new).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::super::NewPattern;
    use super::super::tests::index;

    const WEEK_SECS: u64 = 7 * 24 * 3_600;

    #[test]
    fn test_collects_only_stale_low_confidence() {
        let (index, clock) = index();
        let weak = index
            .store(NewPattern::new("a", vec![1.0, 0.0, 0.0]).with_confidence(0.1))
            .unwrap();
        let strong = index
            .store(NewPattern::new("a", vec![0.0, 1.0, 0.0]).with_confidence(0.9))
            .unwrap();
        let weak_but_used = index
            .store(NewPattern::new("a", vec![0.0, 0.0, 1.0]).with_confidence(0.1))
            .unwrap();

        clock.advance_secs(WEEK_SECS - 10);
        index.record_usage(&weak_but_used, 0.0).unwrap();
        assert!(index.collect_garbage(100).unwrap().is_empty());

        clock.advance_secs(20);
        let collected = index.collect_garbage(100).unwrap();
        assert_eq!(collected, vec![weak.clone()]);
        assert!(index.get(&weak).is_err());
        assert!(index.get(&strong).is_ok());
        assert!(index.get(&weak_but_used).is_ok());
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_gc_respects_limit() {
        let (index, clock) = index();
        for i in 0..5u8 {
            index
                .store(
                    NewPattern::new("a", vec![f32::from(i) + 1.0, 1.0, 0.0]).with_confidence(0.0),
                )
                .unwrap();
        }
        clock.advance_secs(WEEK_SECS + 1);
        assert_eq!(index.collect_garbage(2).unwrap().len(), 2);
        assert_eq!(index.collect_garbage(10).unwrap().len(), 3);
        assert_eq!(index.persisted_count().unwrap(), 0);
    }
}
