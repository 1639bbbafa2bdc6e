//! Off-to-the-side index rebuild.
//!
//! A fresh ANN structure is filled from persisted rows in keyset-paginated
//! batches while the live index keeps serving searches. Mutations that land
//! meanwhile are journaled and replayed onto the fresh index just before it is
//! swapped in, under one short write lock.

use super::{PatternIndex, apply_op, decode_embedding, embedding_page, usize_to_f64};
use crate::Result;
use crate::models::EventType;
use crate::storage::sqlite::acquire_lock;
use crate::vector::{AnnIndex, build_index};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tracing::instrument;

/// Outcome of [`PatternIndex::rebuild`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebuildReport {
    /// Vectors in the new index.
    pub indexed: usize,
    /// Rows skipped because their embedding did not decode or had the
    /// wrong dimension.
    pub skipped: usize,
    /// Read batches used.
    pub batches: usize,
    /// Journaled mutations replayed before the swap.
    pub replayed: usize,
}

impl PatternIndex {
    /// Rebuilds the ANN index from persisted pattern rows.
    ///
    /// Concurrent searches see either the old or the new index, never a
    /// partial one. Concurrent rebuilds are serialized.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`](crate::Error::Storage) if a batch cannot be
    /// read. The live index is left untouched and stays marked stale.
    #[instrument(skip(self), fields(component = "patterns", operation = "rebuild"))]
    pub fn rebuild(&self) -> Result<RebuildReport> {
        let _serial = acquire_lock(&self.rebuild_lock);
        let start = Instant::now();
        self.stale.store(false, Ordering::Release);
        *acquire_lock(&self.journal) = Some(Vec::new());

        let built = self.build_fresh();
        let (mut fresh, mut report) = match built {
            Ok(built) => built,
            Err(e) => {
                *acquire_lock(&self.journal) = None;
                self.mark_stale();
                metrics::counter!("pattern_index_rebuild_failures_total").increment(1);
                return Err(e);
            },
        };

        {
            let mut journal = acquire_lock(&self.journal);
            let ops = journal.take().unwrap_or_default();
            report.replayed = ops.len();
            for op in ops {
                if let Err(e) = apply_op(fresh.as_mut(), op) {
                    tracing::warn!(error = %e, "Journal replay failed; index marked stale");
                    self.mark_stale();
                }
            }
            let mut live = self.write_index();
            *live = fresh;
            report.indexed = live.len();
        }

        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        metrics::counter!("pattern_index_rebuilds_total").increment(1);
        metrics::histogram!("pattern_index_rebuild_duration_ms").record(elapsed_ms);
        metrics::gauge!("pattern_index_size").set(usize_to_f64(report.indexed));
        tracing::info!(
            indexed = report.indexed,
            skipped = report.skipped,
            batches = report.batches,
            replayed = report.replayed,
            elapsed_ms,
            "Pattern index rebuilt"
        );

        let event = self.events.event(
            EventType::IndexRebuilt,
            "kernel",
            json!({
                "indexed": report.indexed,
                "skipped": report.skipped,
                "batches": report.batches,
                "kind": self.params.kind.as_str(),
            }),
        );
        if let Err(e) = self.events.append(event) {
            tracing::warn!(error = %e, "Failed to record index rebuild event");
        }
        Ok(report)
    }

    fn build_fresh(&self) -> Result<(Box<dyn AnnIndex>, RebuildReport)> {
        let mut fresh = build_index(&self.params, self.dimensions)?;
        let mut report = RebuildReport::default();
        let batch_size = self.settings.rebuild_batch_size.max(1);
        let mut cursor: Option<String> = None;

        loop {
            let page = self.db.read("patterns", "rebuild_batch", |conn| {
                embedding_page(conn, cursor.as_deref(), batch_size)
            })?;
            report.batches += 1;
            let full = page.len() == batch_size;

            for (id, bytes) in page {
                let inserted = decode_embedding(&bytes).and_then(|v| fresh.insert(&id, &v));
                if let Err(e) = inserted {
                    tracing::warn!(id = %id, error = %e, "Skipping unindexable pattern");
                    report.skipped += 1;
                }
                cursor = Some(id);
            }

            if !full {
                break;
            }
            std::thread::yield_now();
        }
        Ok((fresh, report))
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::index;
    use super::super::NewPattern;
    use crate::models::PatternId;
    use std::sync::Arc;

    #[test]
    fn test_rebuild_loads_persisted_rows_in_batches() {
        let (index, _) = index();
        for i in 0..25u8 {
            let x = f32::from(i) + 1.0;
            index
                .store(NewPattern::new("a", vec![x, 1.0, 0.0]).with_id(format!("p{i:02}")))
                .unwrap();
        }

        let mut settings = index.settings;
        settings.rebuild_batch_size = 10;
        let index = super::PatternIndex {
            settings,
            ..index
        };
        let report = index.rebuild().unwrap();
        assert_eq!(report.indexed, 25);
        assert_eq!(report.batches, 3);
        assert_eq!(report.skipped, 0);
        assert_eq!(index.len(), 25);
    }

    #[test]
    fn test_rebuild_drops_removed_nodes() {
        let (index, _) = index();
        let id = index
            .store(NewPattern::new("a", vec![1.0, 0.0, 0.0]))
            .unwrap();
        index
            .store(NewPattern::new("a", vec![0.0, 1.0, 0.0]))
            .unwrap();
        index.remove(&id).unwrap();
        index.rebuild().unwrap();
        assert_eq!(index.len(), 1);
        assert!(!index.read_index().contains(id.as_str()));
    }

    #[test]
    fn test_searches_during_rebuild_see_complete_index() {
        let (index, _) = index();
        for i in 0..200u16 {
            let x = f32::from(i);
            index
                .store(NewPattern::new("a", vec![x.cos(), x.sin(), 0.5]))
                .unwrap();
        }
        index.rebuild().unwrap();
        let index = Arc::new(index);

        let searcher = {
            let index = Arc::clone(&index);
            std::thread::spawn(move || {
                for _ in 0..50 {
                    let hits = index.search(&[1.0, 0.0, 0.5], 5).unwrap();
                    assert_eq!(hits.len(), 5);
                }
            })
        };
        for _ in 0..3 {
            index.rebuild().unwrap();
        }
        searcher.join().unwrap();
        assert!(index.get(&PatternId::new("missing")).is_err());
    }
}
