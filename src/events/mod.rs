//! Append-only event log.
//!
//! Every side-effecting kernel operation records a [`KernelEvent`] in the
//! `events` table inside the same transaction as the mutation. Once that
//! transaction commits, the event is published on the [`EventBus`] and handed
//! to any registered [`EventSink`]s. An event is never mutated; it is removed
//! only by its own TTL sweep.

mod bus;

pub use bus::{DEFAULT_EVENT_BUS_CAPACITY, EventBus, FilteredReceiver};

use crate::clock::SharedClock;
use crate::models::{EventType, KernelEvent};
use crate::storage::Database;
use crate::storage::sqlite::{from_sql_i64, numbered_placeholders, to_sql_i64};
use crate::{Error, Result};
use rusqlite::{Connection, Row, params, params_from_iter};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::instrument;

/// External consumer of committed events.
///
/// Sinks are called synchronously after commit, in registration order. A
/// failing sink is logged and does not affect other sinks or the caller.
pub trait EventSink: Send + Sync {
    /// Sink name for logs.
    fn name(&self) -> &str;

    /// Delivers one committed event.
    ///
    /// # Errors
    ///
    /// Implementations may return any error; it is logged and dropped.
    fn deliver(&self, event: &KernelEvent) -> Result<()>;
}

/// Filter for [`EventLog::recent`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    /// Only these types (empty matches every type).
    pub event_types: Vec<EventType>,
    /// Only events from this source.
    pub source: Option<String>,
    /// Only events at or after this instant (Unix milliseconds).
    pub since: Option<u64>,
}

impl EventFilter {
    /// Creates an empty filter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an event type.
    #[must_use]
    pub fn with_type(mut self, event_type: EventType) -> Self {
        self.event_types.push(event_type);
        self
    }

    /// Restricts to one source.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Restricts to events at or after `since`.
    #[must_use]
    pub const fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    /// Whether the event satisfies the filter.
    #[must_use]
    pub fn matches(&self, event: &KernelEvent) -> bool {
        (self.event_types.is_empty() || self.event_types.contains(&event.event_type))
            && self.source.as_ref().is_none_or(|s| *s == event.source)
            && self.since.is_none_or(|t| event.timestamp >= t)
    }
}

/// Persisted, append-only event log with a post-commit publish hook.
pub struct EventLog {
    db: Arc<Database>,
    bus: EventBus,
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
    clock: SharedClock,
    default_ttl_seconds: u64,
}

impl EventLog {
    /// Creates an event log over an open database.
    #[must_use]
    pub fn new(
        db: Arc<Database>,
        bus: EventBus,
        clock: SharedClock,
        default_ttl_seconds: u64,
    ) -> Self {
        Self {
            db,
            bus,
            sinks: RwLock::new(Vec::new()),
            clock,
            default_ttl_seconds,
        }
    }

    /// Builds an event stamped with the kernel clock and default retention.
    #[must_use]
    pub fn event(
        &self,
        event_type: EventType,
        source: impl Into<String>,
        payload: serde_json::Value,
    ) -> KernelEvent {
        KernelEvent::new(
            event_type,
            source,
            payload,
            self.clock.now_millis(),
            self.default_ttl_seconds,
        )
    }

    /// Inserts an event using an open transaction.
    ///
    /// Components call this inside their own write transaction and
    /// [`publish`](Self::publish) after it commits.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the insert fails.
    pub fn insert(conn: &Connection, event: &KernelEvent) -> Result<()> {
        let expires_at = (event.ttl_seconds > 0).then(|| {
            to_sql_i64(
                event
                    .timestamp
                    .saturating_add(event.ttl_seconds.saturating_mul(1000)),
            )
        });
        conn.execute(
            "INSERT INTO events (id, type, payload, ts, source, ttl, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.id,
                event.type_name(),
                event.payload.to_string(),
                to_sql_i64(event.timestamp),
                event.source,
                to_sql_i64(event.ttl_seconds),
                expires_at,
            ],
        )
        .map_err(Error::storage("insert_event"))?;
        Ok(())
    }

    /// Publishes committed events to the bus and every sink.
    pub fn publish(&self, events: impl IntoIterator<Item = KernelEvent>) {
        let sinks = match self.sinks.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for event in events {
            for sink in &sinks {
                if let Err(e) = sink.deliver(&event) {
                    tracing::warn!(
                        sink = sink.name(),
                        event_type = event.type_name(),
                        error = %e,
                        "Event sink failed"
                    );
                    metrics::counter!("event_sink_failures_total").increment(1);
                }
            }
            self.bus.publish(event);
        }
    }

    /// Appends a standalone event in its own transaction and publishes it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the insert fails; nothing is published.
    #[instrument(skip(self, event), fields(component = "events", operation = "append", event_type = event.type_name()))]
    pub fn append(&self, event: KernelEvent) -> Result<()> {
        self.db
            .write("events", "append", |conn| Self::insert(conn, &event))?;
        self.publish([event]);
        Ok(())
    }

    /// Returns the most recent unexpired events matching `filter`, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the query fails.
    #[instrument(skip(self, filter), fields(component = "events", operation = "recent"))]
    pub fn recent(&self, filter: &EventFilter, limit: usize) -> Result<Vec<KernelEvent>> {
        let now = to_sql_i64(self.clock.now_millis());
        let mut sql = String::from(
            "SELECT id, type, payload, ts, source, ttl FROM events
             WHERE (expires_at IS NULL OR expires_at >= ?1)",
        );
        let mut values: Vec<rusqlite::types::Value> = vec![now.into()];

        if !filter.event_types.is_empty() {
            sql.push_str(&format!(
                " AND type IN ({})",
                numbered_placeholders(filter.event_types.len(), values.len() + 1)
            ));
            values.extend(
                filter
                    .event_types
                    .iter()
                    .map(|t| rusqlite::types::Value::from(t.as_str().to_string())),
            );
        }
        if let Some(source) = &filter.source {
            values.push(source.clone().into());
            sql.push_str(&format!(" AND source = ?{}", values.len()));
        }
        if let Some(since) = filter.since {
            values.push(to_sql_i64(since).into());
            sql.push_str(&format!(" AND ts >= ?{}", values.len()));
        }
        values.push(to_sql_i64(u64::try_from(limit).unwrap_or(u64::MAX)).into());
        sql.push_str(&format!(" ORDER BY ts DESC, id DESC LIMIT ?{}", values.len()));

        self.db.read("events", "recent", |conn| {
            let mut stmt = conn
                .prepare_cached(&sql)
                .map_err(Error::storage("prepare_recent_events"))?;
            let rows = stmt
                .query_map(params_from_iter(values.iter()), event_from_row)
                .map_err(Error::storage("query_recent_events"))?;
            let mut events = Vec::new();
            for row in rows {
                let row = row.map_err(Error::storage("read_event_row"))?;
                if let Some(event) = row {
                    events.push(event);
                }
            }
            Ok(events)
        })
    }

    /// Number of persisted events, including expired ones not yet swept.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the query fails.
    pub fn count(&self) -> Result<u64> {
        self.db.read("events", "count", |conn| {
            conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get::<_, i64>(0))
                .map(from_sql_i64)
                .map_err(Error::storage("count_events"))
        })
    }

    /// Deletes up to `limit` events past their retention.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the delete fails.
    #[instrument(skip(self), fields(component = "events", operation = "sweep_expired"))]
    pub fn sweep_expired(&self, limit: usize) -> Result<usize> {
        let now = to_sql_i64(self.clock.now_millis());
        let limit = to_sql_i64(u64::try_from(limit).unwrap_or(u64::MAX));
        let deleted = self.db.write("events", "sweep_expired", |conn| {
            conn.execute(
                "DELETE FROM events WHERE id IN (
                    SELECT id FROM events
                    WHERE expires_at IS NOT NULL AND expires_at < ?1
                    ORDER BY expires_at
                    LIMIT ?2
                 )",
                params![now, limit],
            )
            .map_err(Error::storage("sweep_events"))
        })?;
        if deleted > 0 {
            tracing::debug!(deleted, "Swept expired events");
            metrics::counter!("event_log_swept_total").increment(deleted as u64);
        }
        Ok(deleted)
    }

    /// Subscribes to every committed event.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<KernelEvent> {
        self.bus.subscribe()
    }

    /// Subscribes to committed events matching a predicate.
    #[must_use]
    pub fn subscribe_filtered<F>(&self, predicate: F) -> FilteredReceiver<F>
    where
        F: Fn(&KernelEvent) -> bool,
    {
        self.bus.subscribe_filtered(predicate)
    }

    /// Registers an external sink.
    pub fn add_sink(&self, sink: Arc<dyn EventSink>) {
        tracing::debug!(sink = sink.name(), "Registered event sink");
        match self.sinks.write() {
            Ok(mut guard) => guard.push(sink),
            Err(poisoned) => poisoned.into_inner().push(sink),
        }
    }

    /// Returns the underlying bus.
    #[must_use]
    pub const fn bus(&self) -> &EventBus {
        &self.bus
    }
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("bus", &self.bus)
            .field("default_ttl_seconds", &self.default_ttl_seconds)
            .finish_non_exhaustive()
    }
}

/// Decodes a row; rows with an unknown type (from a newer build) are skipped.
fn event_from_row(row: &Row<'_>) -> rusqlite::Result<Option<KernelEvent>> {
    let type_name: String = row.get(1)?;
    let Some(event_type) = EventType::parse(&type_name) else {
        return Ok(None);
    };
    let payload: String = row.get(2)?;
    Ok(Some(KernelEvent {
        id: row.get(0)?,
        event_type,
        payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        timestamp: from_sql_i64(row.get(3)?),
        source: row.get(4)?,
        ttl_seconds: from_sql_i64(row.get(5)?),
    }))
}
