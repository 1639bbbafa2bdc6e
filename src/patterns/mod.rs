//! Vector-indexed pattern store.
//!
//! Pattern rows in `SQLite` are authoritative. The ANN index is a derived
//! cache held behind an `RwLock`; it is never locked across a database call.
//! [`PatternIndex::search`] reloads every hit from storage and rescores it
//! against the persisted embedding, so returned metadata and similarity are
//! exact even though candidate selection is approximate.

mod gc;
mod rebuild;

pub use rebuild::RebuildReport;

use crate::clock::SharedClock;
use crate::config::{AnnIndexParams, PatternSettings};
use crate::events::EventLog;
use crate::models::{Envelope, EventType, Pattern, PatternId, PatternMatch, PatternTier};
use crate::storage::Database;
use crate::storage::sqlite::{acquire_lock, from_sql_i64, numbered_placeholders, to_sql_i64};
use crate::vector::{AnnIndex, build_index, check_dimensions, cosine_similarity};
use crate::{Error, Result};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use tracing::instrument;

/// Confidence assigned when the caller does not supply one.
pub const DEFAULT_CONFIDENCE: f64 = 0.5;

const PATTERN_COLUMNS: &str = "id, embedding, confidence, usage_count, tags, created_at, \
     source_agent, tier, last_used_at, metadata";

/// Input for [`PatternIndex::store`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewPattern {
    /// Explicit id; generated when `None`.
    pub id: Option<PatternId>,
    /// Embedding; must match the index dimension.
    pub embedding: Vec<f32>,
    /// Initial confidence in `[0, 1]`.
    pub confidence: f64,
    /// Free-form labels.
    pub tags: Vec<String>,
    /// Extracting agent.
    pub source_agent: String,
    /// Optional structured metadata.
    pub metadata: Option<Envelope>,
}

impl NewPattern {
    /// A pattern with default confidence and no tags.
    #[must_use]
    pub fn new(source_agent: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self {
            id: None,
            embedding,
            confidence: DEFAULT_CONFIDENCE,
            tags: Vec::new(),
            source_agent: source_agent.into(),
            metadata: None,
        }
    }

    /// Uses a caller-chosen id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<PatternId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets the initial confidence.
    #[must_use]
    pub const fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    /// Adds tags.
    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Attaches metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Envelope) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// An index mutation recorded while a rebuild is running.
#[derive(Debug, Clone)]
enum JournalOp {
    Insert(String, Vec<f32>),
    Remove(String),
}

/// Embedding store with approximate nearest-neighbor search.
pub struct PatternIndex {
    db: Arc<Database>,
    events: Arc<EventLog>,
    clock: SharedClock,
    dimensions: usize,
    params: AnnIndexParams,
    settings: PatternSettings,
    index: RwLock<Box<dyn AnnIndex>>,
    /// `Some` while a rebuild is in progress. Lock before `index`.
    journal: Mutex<Option<Vec<JournalOp>>>,
    rebuild_lock: Mutex<()>,
    stale: AtomicBool,
}

impl PatternIndex {
    /// Creates an index with an empty ANN structure.
    ///
    /// The index starts stale; call [`rebuild`](Self::rebuild) to load
    /// persisted patterns.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the ANN kind is unavailable.
    pub fn new(
        db: Arc<Database>,
        events: Arc<EventLog>,
        clock: SharedClock,
        dimensions: usize,
        params: AnnIndexParams,
        settings: PatternSettings,
    ) -> Result<Self> {
        let index = build_index(&params, dimensions)?;
        Ok(Self {
            db,
            events,
            clock,
            dimensions,
            params,
            settings,
            index: RwLock::new(index),
            journal: Mutex::new(None),
            rebuild_lock: Mutex::new(()),
            stale: AtomicBool::new(true),
        })
    }

    /// Fixed embedding dimension.
    #[must_use]
    pub const fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Persists a pattern and adds it to the ANN index.
    ///
    /// # Errors
    ///
    /// - [`Error::Schema`] if the embedding dimension is wrong
    /// - [`Error::Validation`] for a non-finite embedding, a confidence
    ///   outside `[0, 1]`, or an id that already exists
    /// - [`Error::Storage`] if the write fails
    #[instrument(
        skip_all,
        fields(component = "patterns", operation = "store", source_agent = %pattern.source_agent)
    )]
    pub fn store(&self, pattern: NewPattern) -> Result<PatternId> {
        check_dimensions(self.dimensions, &pattern.embedding)?;
        if pattern.embedding.iter().any(|x| !x.is_finite()) {
            return Err(Error::Validation(
                "embedding components must be finite".to_string(),
            ));
        }
        validate_unit_interval("confidence", pattern.confidence)?;

        let id = pattern.id.clone().unwrap_or_else(PatternId::generate);
        let now = self.clock.now_millis();
        let tags = serde_json::to_string(&pattern.tags)
            .map_err(|e| Error::Validation(format!("unserializable tags: {e}")))?;

        let event = self.db.write("patterns", "store", |conn| {
            let exists: Option<i64> = conn
                .query_row("SELECT 1 FROM patterns WHERE id = ?1", [id.as_str()], |row| {
                    row.get(0)
                })
                .optional()
                .map_err(Error::storage("check_pattern_id"))?;
            if exists.is_some() {
                return Err(Error::Validation(format!("pattern '{id}' already exists")));
            }

            conn.execute(
                "INSERT INTO patterns
                    (id, embedding, dimension, confidence, usage_count, tags, created_at,
                     source_agent, tier, last_used_at, metadata)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?7, ?8, NULL, ?9)",
                params![
                    id.as_str(),
                    encode_embedding(&pattern.embedding),
                    to_sql_i64(self.dimensions as u64),
                    pattern.confidence,
                    tags,
                    to_sql_i64(now),
                    pattern.source_agent,
                    PatternTier::default().as_str(),
                    pattern.metadata.as_ref().map(Envelope::to_bytes),
                ],
            )
            .map_err(Error::storage("insert_pattern"))?;

            let event = self.events.event(
                EventType::PatternStored,
                &pattern.source_agent,
                json!({
                    "id": id.as_str(),
                    "dimension": self.dimensions,
                    "confidence": pattern.confidence,
                    "tags": pattern.tags,
                }),
            );
            EventLog::insert(conn, &event)?;
            Ok(event)
        })?;

        self.apply(JournalOp::Insert(id.to_string(), pattern.embedding));
        self.events.publish([event]);
        metrics::counter!("pattern_stored_total").increment(1);
        Ok(id)
    }

    /// Returns up to `k` patterns most similar to `query`, best first.
    ///
    /// Candidates come from the ANN index; each is reloaded from storage and
    /// rescored exactly. Hits whose row has been removed are dropped.
    ///
    /// # Errors
    ///
    /// - [`Error::Schema`] if the query dimension is wrong
    /// - [`Error::Storage`] if rows cannot be loaded
    #[instrument(skip(self, query), fields(component = "patterns", operation = "search"))]
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<PatternMatch>> {
        let start = Instant::now();
        check_dimensions(self.dimensions, query)?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let candidates = self.read_index().search(query, k)?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = candidates.into_iter().map(|(id, _)| id).collect();
        let patterns = self.load_many(&ids)?;

        let mut matches: Vec<PatternMatch> = patterns
            .into_iter()
            .map(|pattern| PatternMatch {
                similarity: cosine_similarity(query, &pattern.embedding),
                pattern,
            })
            .collect();
        matches.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| a.pattern.id.cmp(&b.pattern.id))
        });

        metrics::histogram!("pattern_search_duration_ms")
            .record(start.elapsed().as_secs_f64() * 1000.0);
        metrics::counter!("pattern_search_total").increment(1);
        Ok(matches)
    }

    /// Records one use of a pattern and folds `outcome` into its confidence.
    ///
    /// `confidence' = confidence * (1 - alpha) + outcome * alpha`.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] if `outcome` is not a finite value in `[0, 1]`
    /// - [`Error::NotFound`] if the pattern does not exist
    #[instrument(skip(self), fields(component = "patterns", operation = "record_usage"))]
    pub fn record_usage(&self, id: &PatternId, outcome: f64) -> Result<Pattern> {
        validate_unit_interval("outcome", outcome)?;
        let alpha = self.settings.ema_alpha;
        let now = to_sql_i64(self.clock.now_millis());

        let sql = format!(
            "UPDATE patterns
             SET usage_count = usage_count + 1,
                 confidence = MIN(1.0, MAX(0.0, confidence * (1.0 - ?2) + ?3 * ?2)),
                 last_used_at = ?4
             WHERE id = ?1
             RETURNING {PATTERN_COLUMNS}"
        );
        let pattern = self.db.write("patterns", "record_usage", |conn| {
            conn.query_row(&sql, params![id.as_str(), alpha, outcome, now], RawPattern::from_row)
                .optional()
                .map_err(Error::storage("record_pattern_usage"))?
                .ok_or_else(|| not_found(id))?
                .into_pattern()
        })?;
        metrics::counter!("pattern_usage_recorded_total").increment(1);
        Ok(pattern)
    }

    /// Moves a pattern one tier up, saturating at `hot`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the pattern does not exist.
    pub fn promote(&self, id: &PatternId) -> Result<PatternTier> {
        self.change_tier(id, PatternTier::promoted, "promote")
    }

    /// Moves a pattern one tier down, saturating at `archive`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the pattern does not exist.
    pub fn demote(&self, id: &PatternId) -> Result<PatternTier> {
        self.change_tier(id, PatternTier::demoted, "demote")
    }

    #[instrument(skip(self, step), fields(component = "patterns"))]
    fn change_tier(
        &self,
        id: &PatternId,
        step: fn(PatternTier) -> PatternTier,
        operation: &'static str,
    ) -> Result<PatternTier> {
        let (tier, event) = self.db.write("patterns", operation, |conn| {
            let current: String = conn
                .query_row("SELECT tier FROM patterns WHERE id = ?1", [id.as_str()], |row| {
                    row.get(0)
                })
                .optional()
                .map_err(Error::storage("read_pattern_tier"))?
                .ok_or_else(|| not_found(id))?;
            let from = PatternTier::parse(&current);
            let to = step(from);
            if from == to {
                return Ok((to, None));
            }

            conn.execute(
                "UPDATE patterns SET tier = ?2 WHERE id = ?1",
                params![id.as_str(), to.as_str()],
            )
            .map_err(Error::storage("update_pattern_tier"))?;
            let event = self.events.event(
                EventType::PatternTierChanged,
                "kernel",
                json!({ "id": id.as_str(), "from": from.as_str(), "to": to.as_str() }),
            );
            EventLog::insert(conn, &event)?;
            Ok((to, Some(event)))
        })?;
        self.events.publish(event);
        Ok(tier)
    }

    /// Loads one pattern.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the pattern does not exist.
    pub fn get(&self, id: &PatternId) -> Result<Pattern> {
        let sql = format!("SELECT {PATTERN_COLUMNS} FROM patterns WHERE id = ?1");
        self.db
            .read("patterns", "get", |conn| {
                conn.query_row(&sql, [id.as_str()], RawPattern::from_row)
                    .optional()
                    .map_err(Error::storage("get_pattern"))
            })?
            .ok_or_else(|| not_found(id))?
            .into_pattern()
    }

    /// Deletes a pattern and drops it from the index.
    ///
    /// Returns `false` if it did not exist.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the delete fails.
    #[instrument(skip(self), fields(component = "patterns", operation = "remove"))]
    pub fn remove(&self, id: &PatternId) -> Result<bool> {
        let event = self.db.write("patterns", "remove", |conn| {
            let removed = conn
                .execute("DELETE FROM patterns WHERE id = ?1", [id.as_str()])
                .map_err(Error::storage("delete_pattern"))?;
            if removed == 0 {
                return Ok(None);
            }
            let event = self.events.event(
                EventType::PatternCollected,
                "kernel",
                json!({ "ids": [id.as_str()], "reason": "removed" }),
            );
            EventLog::insert(conn, &event)?;
            Ok(Some(event))
        })?;

        let removed = event.is_some();
        if removed {
            self.apply(JournalOp::Remove(id.to_string()));
        }
        self.events.publish(event);
        Ok(removed)
    }

    /// Vectors currently in the ANN index.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read_index().len()
    }

    /// Whether the ANN index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pattern rows in storage.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the count fails.
    pub fn persisted_count(&self) -> Result<u64> {
        self.db.read("patterns", "count", |conn| {
            conn.query_row("SELECT COUNT(*) FROM patterns", [], |row| row.get::<_, i64>(0))
                .map(from_sql_i64)
                .map_err(Error::storage("count_patterns"))
        })
    }

    /// Whether the index should be rebuilt: it was marked stale, or its size
    /// differs from the persisted row count.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the row count cannot be read.
    pub fn is_stale(&self) -> Result<bool> {
        if self.stale.load(Ordering::Acquire) {
            return Ok(true);
        }
        Ok(self.persisted_count()? != self.len() as u64)
    }

    /// Flags the index for rebuild by the background task.
    pub fn mark_stale(&self) {
        self.stale.store(true, Ordering::Release);
    }

    /// Applies an index mutation, journaling it if a rebuild is running.
    fn apply(&self, op: JournalOp) {
        let mut journal = acquire_lock(&self.journal);
        if let Some(pending) = journal.as_mut() {
            pending.push(op.clone());
        }
        let mut index = self.write_index();
        if let Err(e) = apply_op(index.as_mut(), op) {
            tracing::warn!(error = %e, "ANN update failed; index marked stale");
            self.mark_stale();
        }
        metrics::gauge!("pattern_index_size").set(usize_to_f64(index.len()));
    }

    fn load_many(&self, ids: &[String]) -> Result<Vec<Pattern>> {
        let sql = format!(
            "SELECT {PATTERN_COLUMNS} FROM patterns WHERE id IN ({})",
            numbered_placeholders(ids.len(), 1)
        );
        let raws = self.db.read("patterns", "load_hits", |conn| {
            let mut stmt = conn
                .prepare(&sql)
                .map_err(Error::storage("prepare_load_patterns"))?;
            let rows = stmt
                .query_map(params_from_iter(ids.iter()), RawPattern::from_row)
                .map_err(Error::storage("load_patterns"))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(Error::storage("read_pattern_row"))
        })?;
        raws.into_iter().map(RawPattern::into_pattern).collect()
    }

    fn read_index(&self) -> RwLockReadGuard<'_, Box<dyn AnnIndex>> {
        match self.index.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("Pattern index lock was poisoned, recovering");
                poisoned.into_inner()
            },
        }
    }

    fn write_index(&self) -> RwLockWriteGuard<'_, Box<dyn AnnIndex>> {
        match self.index.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("Pattern index lock was poisoned, recovering");
                poisoned.into_inner()
            },
        }
    }
}

impl std::fmt::Debug for PatternIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatternIndex")
            .field("dimensions", &self.dimensions)
            .field("kind", &self.params.kind)
            .field("len", &self.len())
            .field("stale", &self.stale.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn apply_op(index: &mut dyn AnnIndex, op: JournalOp) -> Result<()> {
    match op {
        JournalOp::Insert(id, embedding) => index.insert(&id, &embedding),
        JournalOp::Remove(id) => {
            index.remove(&id);
            Ok(())
        },
    }
}

fn validate_unit_interval(field: &str, value: f64) -> Result<()> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "{field} must be a finite value in [0, 1], got {value}"
        )))
    }
}

fn not_found(id: &PatternId) -> Error {
    Error::NotFound {
        kind: "pattern",
        id: id.to_string(),
    }
}

fn usize_to_f64(value: usize) -> f64 {
    f64::from(u32::try_from(value).unwrap_or(u32::MAX))
}

/// Encodes an embedding as little-endian `f32` bytes.
#[must_use]
pub fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|x| x.to_le_bytes()).collect()
}

/// Decodes little-endian `f32` bytes.
///
/// # Errors
///
/// Returns [`Error::Storage`] if the length is not a multiple of four.
pub fn decode_embedding(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(Error::Storage {
            operation: "decode_embedding".to_string(),
            cause: format!("{} bytes is not a whole number of f32 values", bytes.len()),
        });
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Pattern row before fallible decoding.
struct RawPattern {
    id: String,
    embedding: Vec<u8>,
    confidence: f64,
    usage_count: i64,
    tags: String,
    created_at: i64,
    source_agent: String,
    tier: String,
    last_used_at: Option<i64>,
    metadata: Option<Vec<u8>>,
}

impl RawPattern {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            embedding: row.get(1)?,
            confidence: row.get(2)?,
            usage_count: row.get(3)?,
            tags: row.get(4)?,
            created_at: row.get(5)?,
            source_agent: row.get(6)?,
            tier: row.get(7)?,
            last_used_at: row.get(8)?,
            metadata: row.get(9)?,
        })
    }

    fn into_pattern(self) -> Result<Pattern> {
        let tags = serde_json::from_str(&self.tags).unwrap_or_else(|e| {
            tracing::warn!(id = %self.id, error = %e, "Ignoring malformed pattern tags");
            Vec::new()
        });
        let metadata = self
            .metadata
            .as_deref()
            .map(Envelope::from_bytes)
            .transpose()?;
        Ok(Pattern {
            id: PatternId::new(self.id),
            embedding: decode_embedding(&self.embedding)?,
            confidence: self.confidence,
            usage_count: from_sql_i64(self.usage_count),
            tags,
            created_at: from_sql_i64(self.created_at),
            source_agent: self.source_agent,
            tier: PatternTier::parse(&self.tier),
            last_used_at: self.last_used_at.map(from_sql_i64),
            metadata,
        })
    }
}

/// Reads `(id, embedding)` pairs with ids after `after`, in id order.
pub(crate) fn embedding_page(
    conn: &Connection,
    after: Option<&str>,
    limit: usize,
) -> Result<Vec<(String, Vec<u8>)>> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT id, embedding FROM patterns
             WHERE ?1 IS NULL OR id > ?1
             ORDER BY id
             LIMIT ?2",
        )
        .map_err(Error::storage("prepare_embedding_page"))?;
    let rows = stmt
        .query_map(
            params![after, to_sql_i64(limit as u64)],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(Error::storage("query_embedding_page"))?;
    rows.collect::<rusqlite::Result<_>>()
        .map_err(Error::storage("read_embedding_page"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::AnnIndexKind;
    use crate::events::{EventBus, EventFilter};

    pub(super) fn index_with(kind: AnnIndexKind) -> (PatternIndex, ManualClock) {
        let clock = ManualClock::new(1_000_000);
        let shared: SharedClock = Arc::new(clock.clone());
        let db = Arc::new(Database::in_memory().unwrap());
        let events = Arc::new(EventLog::new(
            Arc::clone(&db),
            EventBus::new(64),
            Arc::clone(&shared),
            0,
        ));
        let params = AnnIndexParams {
            kind,
            ..AnnIndexParams::default()
        };
        let index =
            PatternIndex::new(db, events, shared, 3, params, PatternSettings::default()).unwrap();
        (index, clock)
    }

    pub(super) fn index() -> (PatternIndex, ManualClock) {
        index_with(AnnIndexKind::Hnsw)
    }

    #[test]
    fn test_store_and_self_match() {
        let (index, _) = index();
        let a = index
            .store(NewPattern::new("agent-1", vec![1.0, 0.0, 0.0]).with_tags(["retry"]))
            .unwrap();
        index
            .store(NewPattern::new("agent-1", vec![0.0, 1.0, 0.0]))
            .unwrap();

        let hits = index.search(&[1.0, 0.0, 0.0], 1).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].pattern.id, a);
        assert!((hits[0].similarity - 1.0).abs() < 1e-5);
        assert_eq!(hits[0].pattern.tags, vec!["retry".to_string()]);
    }

    #[test]
    fn test_empty_search_is_not_an_error() {
        let (index, _) = index();
        assert!(index.search(&[1.0, 0.0, 0.0], 10).unwrap().is_empty());
    }

    #[test]
    fn test_dimension_mismatch_is_schema_error() {
        let (index, _) = index();
        let result = index.store(NewPattern::new("a", vec![1.0, 2.0]));
        assert!(matches!(
            result,
            Err(Error::Schema {
                expected: 3,
                actual: 2
            })
        ));
        assert!(matches!(
            index.search(&[1.0], 1),
            Err(Error::Schema { .. })
        ));
        assert_eq!(index.persisted_count().unwrap(), 0);
    }

    #[test]
    fn test_invalid_inputs_rejected() {
        let (index, _) = index();
        assert!(matches!(
            index.store(NewPattern::new("a", vec![f32::NAN, 0.0, 0.0])),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            index.store(NewPattern::new("a", vec![1.0, 0.0, 0.0]).with_confidence(1.5)),
            Err(Error::Validation(_))
        ));

        let id = index
            .store(NewPattern::new("a", vec![1.0, 0.0, 0.0]).with_id("fixed"))
            .unwrap();
        assert_eq!(id.as_str(), "fixed");
        assert!(matches!(
            index.store(NewPattern::new("a", vec![1.0, 0.0, 0.0]).with_id("fixed")),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_record_usage_applies_ema() {
        let (index, clock) = index();
        let id = index
            .store(NewPattern::new("a", vec![1.0, 0.0, 0.0]).with_confidence(0.5))
            .unwrap();
        clock.advance_secs(5);

        let updated = index.record_usage(&id, 1.0).unwrap();
        assert!((updated.confidence - 0.55).abs() < 1e-9);
        assert_eq!(updated.usage_count, 1);
        assert_eq!(updated.last_used_at, Some(1_005_000));

        let updated = index.record_usage(&id, 0.0).unwrap();
        assert!((updated.confidence - 0.495).abs() < 1e-9);
        assert_eq!(updated.usage_count, 2);

        assert!(matches!(
            index.record_usage(&id, 2.0),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            index.record_usage(&PatternId::new("missing"), 1.0),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_tier_changes_emit_events_only_on_change() {
        let (index, _) = index();
        let id = index
            .store(NewPattern::new("a", vec![1.0, 0.0, 0.0]))
            .unwrap();
        assert_eq!(index.promote(&id).unwrap(), PatternTier::Hot);
        assert_eq!(index.promote(&id).unwrap(), PatternTier::Hot);
        assert_eq!(index.demote(&id).unwrap(), PatternTier::Warm);
        assert_eq!(index.get(&id).unwrap().tier, PatternTier::Warm);

        let changes = index
            .events
            .recent(
                &EventFilter::new().with_type(EventType::PatternTierChanged),
                10,
            )
            .unwrap();
        assert_eq!(changes.len(), 2);
    }

    #[test]
    fn test_remove_drops_from_search() {
        let (index, _) = index();
        let id = index
            .store(NewPattern::new("a", vec![1.0, 0.0, 0.0]))
            .unwrap();
        assert!(index.remove(&id).unwrap());
        assert!(!index.remove(&id).unwrap());
        assert!(index.search(&[1.0, 0.0, 0.0], 5).unwrap().is_empty());
        assert!(matches!(index.get(&id), Err(Error::NotFound { .. })));
    }

    #[test]
    fn test_metadata_round_trip() {
        let (index, _) = index();
        let meta = Envelope::json(&json!({ "origin": "planner" })).unwrap();
        let id = index
            .store(NewPattern::new("a", vec![0.0, 0.0, 1.0]).with_metadata(meta.clone()))
            .unwrap();
        assert_eq!(index.get(&id).unwrap().metadata, Some(meta));
    }

    #[test]
    fn test_staleness() {
        let (index, _) = index();
        assert!(index.is_stale().unwrap());
        index.rebuild().unwrap();
        assert!(!index.is_stale().unwrap());
        index.mark_stale();
        assert!(index.is_stale().unwrap());
    }

    #[test]
    fn test_embedding_codec() {
        let bytes = encode_embedding(&[1.5, -2.0]);
        assert_eq!(bytes.len(), 8);
        assert_eq!(decode_embedding(&bytes).unwrap(), vec![1.5, -2.0]);
        assert!(decode_embedding(&[0, 1, 2]).is_err());
    }
}
