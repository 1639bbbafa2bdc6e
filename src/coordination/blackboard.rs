//! Shared-hint blackboard.
//!
//! Hints are ordinary memory entries in a dedicated namespace, written with
//! swarm visibility and a short default TTL. Posting a hint records both the
//! `entry-stored` and the `hint-posted` events in the same transaction.
//!
//! Subscriptions are fed from the event bus on a tokio task. Delivery is
//! at-least-once while the process runs; a subscriber that lagged or
//! reconnected catches up with [`Blackboard::read_hints`].

use crate::events::EventLog;
use crate::memory::{MemoryStore, QueryOptions, StoreOptions, validate_pattern};
use crate::models::{AccessLevel, AgentContext, EntryKey, EventType, KernelEvent, MemoryEntry};
use crate::storage::sqlite::glob_matches;
use crate::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::task::JoinHandle;
use tracing::instrument;

/// A hint read back from the blackboard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hint {
    /// Key within the hint namespace.
    pub key: String,
    /// Opaque payload.
    pub value: Vec<u8>,
    /// Posting agent.
    pub author: String,
    /// Entry version; handlers can use it to deduplicate deliveries.
    pub version: u64,
    /// Post time, Unix milliseconds.
    pub posted_at: u64,
    /// Lifetime in seconds.
    pub ttl_seconds: u64,
}

impl From<MemoryEntry> for Hint {
    fn from(entry: MemoryEntry) -> Self {
        Self {
            key: entry.key.key().to_string(),
            author: entry.owner,
            version: entry.version,
            posted_at: entry.created_at,
            ttl_seconds: entry.ttl_seconds,
            value: entry.value,
        }
    }
}

/// Delivered to subscribers when a matching hint is posted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HintNotification {
    /// The posted hint.
    pub hint: Hint,
    /// Id of the `hint-posted` event.
    pub event_id: String,
}

impl HintNotification {
    fn from_event(event: &KernelEvent) -> Option<Self> {
        let value = STANDARD.decode(event.payload_str("value")?).ok()?;
        let number = |field: &str| event.payload.get(field).and_then(serde_json::Value::as_u64);
        Some(Self {
            hint: Hint {
                key: event.payload_str("key")?.to_string(),
                value,
                author: event.source.clone(),
                version: number("version")?,
                posted_at: event.timestamp,
                ttl_seconds: number("ttl_seconds").unwrap_or(0),
            },
            event_id: event.id.clone(),
        })
    }
}

/// Handle for a live subscription. Dropping it stops delivery.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    pattern: String,
    task: JoinHandle<()>,
}

impl Subscription {
    /// Subscription id, unique per blackboard.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Key pattern this subscription matches.
    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Whether the delivery task is still running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stops delivery.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
        metrics::gauge!("blackboard_subscriptions_active").decrement(1.0);
    }
}

/// Advisory shared-hint board built on the memory store.
pub struct Blackboard {
    memory: Arc<MemoryStore>,
    namespace: String,
    default_ttl_seconds: u64,
    next_subscription: AtomicU64,
}

impl Blackboard {
    /// Creates a blackboard whose hints live in `namespace`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if `namespace` is malformed.
    pub fn new(
        memory: Arc<MemoryStore>,
        namespace: impl Into<String>,
        default_ttl_seconds: u64,
    ) -> Result<Self> {
        let namespace = namespace.into();
        crate::models::validate_namespace(&namespace)?;
        Ok(Self {
            memory,
            namespace,
            default_ttl_seconds,
            next_subscription: AtomicU64::new(1),
        })
    }

    /// Namespace holding the hints.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Posts a hint with the default TTL.
    ///
    /// # Errors
    ///
    /// See [`post_hint_with_ttl`](Self::post_hint_with_ttl).
    pub fn post_hint(&self, author: &AgentContext, key: &str, value: Vec<u8>) -> Result<Hint> {
        self.post_hint_with_ttl(author, key, value, self.default_ttl_seconds)
    }

    /// Posts a hint visible to the author's swarm, replacing any hint under
    /// the same key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for a malformed key or
    /// [`Error::Storage`] if the write fails.
    #[instrument(
        skip_all,
        fields(component = "blackboard", operation = "post_hint", key, author = %author.agent_id)
    )]
    pub fn post_hint_with_ttl(
        &self,
        author: &AgentContext,
        key: &str,
        value: Vec<u8>,
        ttl_seconds: u64,
    ) -> Result<Hint> {
        let entry_key = EntryKey::new(self.namespace.as_str(), key)?;
        let options = StoreOptions::new(author)
            .with_access(AccessLevel::Swarm)
            .with_ttl(ttl_seconds);
        let now = self.memory.clock().now_millis();
        let events = self.memory.event_log();

        let (entry, stored, posted) = self.memory.database().write("blackboard", "post_hint", |conn| {
            let entry = MemoryStore::write_entry(conn, &entry_key, value, &options, now)?;
            let stored = self.memory.stored_event(&entry);
            let posted = events.event(
                EventType::HintPosted,
                &author.agent_id,
                json!({
                    "namespace": self.namespace,
                    "key": key,
                    "version": entry.version,
                    "ttl_seconds": ttl_seconds,
                    "value": STANDARD.encode(&entry.value),
                }),
            );
            EventLog::insert(conn, &stored)?;
            EventLog::insert(conn, &posted)?;
            Ok((entry, stored, posted))
        })?;

        events.publish([stored, posted]);
        metrics::counter!("blackboard_hints_posted_total").increment(1);
        Ok(Hint::from(entry))
    }

    /// Returns live hints matching `pattern` that `requester` may read.
    ///
    /// This is a snapshot, not a feed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for a malformed pattern or
    /// [`Error::Storage`] if the query fails.
    #[instrument(skip(self, requester), fields(component = "blackboard", operation = "read_hints"))]
    pub fn read_hints(&self, pattern: &str, requester: &AgentContext) -> Result<Vec<Hint>> {
        let options = QueryOptions::in_namespace(self.namespace.as_str()).as_agent(requester);
        self.memory
            .query(pattern, options)?
            .map(|entry| entry.map(Hint::from))
            .collect()
    }

    /// Invokes `handler` for every hint posted under a key matching
    /// `pattern` from now on.
    ///
    /// Must be called within a tokio runtime. The handler runs on the
    /// delivery task and should be idempotent, keyed by
    /// [`Hint::version`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for a malformed pattern or when no tokio
    /// runtime is available.
    pub fn subscribe<F>(&self, pattern: &str, handler: F) -> Result<Subscription>
    where
        F: Fn(HintNotification) + Send + Sync + 'static,
    {
        validate_pattern(pattern)?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            Error::Validation("blackboard subscriptions require a tokio runtime".to_string())
        })?;

        let namespace = self.namespace.clone();
        let key_pattern = pattern.to_string();
        let mut receiver = self.memory.event_log().subscribe_filtered(move |event| {
            event.event_type == EventType::HintPosted
                && event.payload_str("namespace") == Some(namespace.as_str())
                && event
                    .payload_str("key")
                    .is_some_and(|key| glob_matches(&key_pattern, key))
        });

        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let task = runtime.spawn(async move {
            while let Ok(event) = receiver.recv().await {
                match HintNotification::from_event(&event) {
                    Some(notification) => handler(notification),
                    None => tracing::warn!(event_id = %event.id, "Malformed hint-posted payload"),
                }
                metrics::counter!("blackboard_notifications_total").increment(1);
            }
            tracing::debug!(subscription = id, "Hint subscription closed");
        });

        metrics::gauge!("blackboard_subscriptions_active").increment(1.0);
        tracing::debug!(subscription = id, pattern, "Hint subscription started");
        Ok(Subscription {
            id,
            pattern: pattern.to_string(),
            task,
        })
    }
}

impl std::fmt::Debug for Blackboard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blackboard")
            .field("namespace", &self.namespace)
            .field("default_ttl_seconds", &self.default_ttl_seconds)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SharedClock};
    use crate::events::{EventBus, EventFilter};
    use crate::storage::Database;
    use std::sync::Mutex;
    use std::time::Duration;

    fn board() -> (Blackboard, ManualClock) {
        let clock = ManualClock::new(10_000_000);
        let shared: SharedClock = Arc::new(clock.clone());
        let db = Arc::new(Database::in_memory().unwrap());
        let events = Arc::new(EventLog::new(
            Arc::clone(&db),
            EventBus::new(64),
            Arc::clone(&shared),
            0,
        ));
        let memory = Arc::new(MemoryStore::new(db, events, shared, 0));
        (Blackboard::new(memory, "blackboard", 1_800).unwrap(), clock)
    }

    fn agent(id: &str) -> AgentContext {
        AgentContext::new(id).with_swarm("s1")
    }

    #[test]
    fn test_post_and_read_within_swarm() {
        let (board, clock) = board();
        let hint = board
            .post_hint(&agent("x"), "queue/next", br#"{"priority":"high"}"#.to_vec())
            .unwrap();
        assert_eq!(hint.ttl_seconds, 1_800);
        assert_eq!(hint.author, "x");

        let hints = board.read_hints("queue/*", &agent("y")).unwrap();
        assert_eq!(hints.len(), 1);
        assert_eq!(hints[0].value, br#"{"priority":"high"}"#.to_vec());

        let outsider = AgentContext::new("z").with_swarm("s2");
        assert!(board.read_hints("queue/*", &outsider).unwrap().is_empty());

        clock.advance_secs(1_801);
        assert!(board.read_hints("queue/*", &agent("y")).unwrap().is_empty());
    }

    #[test]
    fn test_swarmless_author_reads_own_hint() {
        let (board, _) = board();
        let loner = AgentContext::new("loner");
        board
            .post_hint(&loner, "queue/next", b"mine".to_vec())
            .unwrap();

        let hints = board.read_hints("queue/*", &loner).unwrap();
        assert_eq!(hints.len(), 1);
        assert_eq!(hints[0].value, b"mine".to_vec());
        assert!(board.read_hints("queue/*", &agent("y")).unwrap().is_empty());
    }

    #[test]
    fn test_post_records_both_events() {
        let (board, _) = board();
        board
            .post_hint(&agent("x"), "queue/next", b"1".to_vec())
            .unwrap();
        let log = board.memory.event_log();
        let posted = log
            .recent(&EventFilter::new().with_type(EventType::HintPosted), 10)
            .unwrap();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].payload_str("key"), Some("queue/next"));
        let stored = log
            .recent(&EventFilter::new().with_type(EventType::EntryStored), 10)
            .unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[test]
    fn test_subscribe_outside_runtime_fails() {
        let (board, _) = board();
        assert!(matches!(
            board.subscribe("queue/*", |_| {}),
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_subscription_receives_matching_hints() {
        let (board, _) = board();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscription = board
            .subscribe("queue/*", move |n| sink.lock().unwrap().push(n.hint))
            .unwrap();
        assert!(subscription.is_active());

        board
            .post_hint(&agent("x"), "queue/next", b"go".to_vec())
            .unwrap();
        board
            .post_hint(&agent("x"), "status/now", b"skip".to_vec())
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while seen.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let hints = seen.lock().unwrap().clone();
        assert_eq!(hints.len(), 1);
        assert_eq!(hints[0].key, "queue/next");
        assert_eq!(hints[0].value, b"go".to_vec());
        assert_eq!(hints[0].version, 1);
        subscription.unsubscribe();
    }
}
