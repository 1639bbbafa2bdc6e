//! Lazy snapshot queries over memory entries.

use super::access::can_read;
use super::{ENTRY_COLUMNS, entry_from_row};
use crate::clock::SharedClock;
use crate::models::{AgentContext, MemoryEntry};
use crate::storage::Database;
use crate::storage::sqlite::to_sql_i64;
use crate::{Error, Result};
use rusqlite::params_from_iter;
use rusqlite::types::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Default number of rows loaded per page.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Options for [`MemoryStore::query`](super::MemoryStore::query).
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Restrict to one namespace; `None` searches every namespace.
    pub namespace: Option<String>,
    /// Maximum number of entries yielded.
    pub limit: Option<usize>,
    /// When set, entries this agent may not read are skipped.
    pub requester: Option<AgentContext>,
    /// Rows loaded per page.
    pub page_size: usize,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            namespace: None,
            limit: None,
            requester: None,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl QueryOptions {
    /// Queries within one namespace.
    #[must_use]
    pub fn in_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ..Self::default()
        }
    }

    /// Caps the number of yielded entries.
    #[must_use]
    pub const fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skips entries `requester` may not read.
    #[must_use]
    pub fn as_agent(mut self, requester: &AgentContext) -> Self {
        self.requester = Some(requester.clone());
        self
    }

    /// Sets the page size (minimum 1).
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }
}

/// Finite, lazy sequence of entries matching a key pattern.
///
/// The set of matching keys is fixed when the query is issued; rows are
/// loaded page by page as the iterator advances. Entries deleted or expired
/// after the query was issued are skipped, never resurrected. Dropping the
/// iterator early has no side effects.
pub struct EntryQuery {
    db: Arc<Database>,
    clock: SharedClock,
    keys: VecDeque<(String, String)>,
    page: VecDeque<MemoryEntry>,
    page_size: usize,
    remaining: Option<usize>,
    requester: Option<AgentContext>,
}

impl EntryQuery {
    pub(super) fn new(
        db: Arc<Database>,
        clock: SharedClock,
        keys: Vec<(String, String)>,
        options: QueryOptions,
    ) -> Self {
        Self {
            db,
            clock,
            keys: keys.into(),
            page: VecDeque::new(),
            page_size: options.page_size.max(1),
            remaining: options.limit,
            requester: options.requester,
        }
    }

    /// Number of snapshot keys not yet loaded.
    #[must_use]
    pub fn pending_keys(&self) -> usize {
        self.keys.len()
    }

    fn load_page(&mut self) -> Result<()> {
        let take = self.page_size.min(self.keys.len());
        let batch: Vec<(String, String)> = self.keys.drain(..take).collect();
        if batch.is_empty() {
            return Ok(());
        }

        let now = to_sql_i64(self.clock.now_millis());
        let tuples = (0..batch.len())
            .map(|i| format!("(?{}, ?{})", i * 2 + 2, i * 2 + 3))
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM memory_entries
             WHERE tombstoned_at IS NULL
               AND (expires_at IS NULL OR expires_at >= ?1)
               AND (namespace, key) IN (VALUES {tuples})"
        );
        let mut values: Vec<Value> = Vec::with_capacity(batch.len() * 2 + 1);
        values.push(now.into());
        for (namespace, key) in &batch {
            values.push(namespace.clone().into());
            values.push(key.clone().into());
        }

        let mut loaded: HashMap<(String, String), MemoryEntry> = self
            .db
            .read("memory", "query_page", |conn| {
                let mut stmt = conn
                    .prepare(&sql)
                    .map_err(Error::storage("prepare_query_page"))?;
                let rows = stmt
                    .query_map(params_from_iter(values.iter()), entry_from_row)
                    .map_err(Error::storage("query_page"))?;
                let mut out = HashMap::new();
                for row in rows {
                    let entry = row.map_err(Error::storage("read_entry_row"))?;
                    out.insert(
                        (entry.key.namespace().to_string(), entry.key.key().to_string()),
                        entry,
                    );
                }
                Ok(out)
            })?;

        for key in batch {
            if let Some(entry) = loaded.remove(&key) {
                let readable = self
                    .requester
                    .as_ref()
                    .is_none_or(|agent| can_read(&entry, agent));
                if readable {
                    self.page.push_back(entry);
                }
            }
        }
        Ok(())
    }
}

impl Iterator for EntryQuery {
    type Item = Result<MemoryEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == Some(0) {
            return None;
        }
        while self.page.is_empty() {
            if self.keys.is_empty() {
                return None;
            }
            if let Err(e) = self.load_page() {
                self.keys.clear();
                return Some(Err(e));
            }
        }
        let entry = self.page.pop_front()?;
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= 1;
        }
        Some(Ok(entry))
    }
}

impl std::fmt::Debug for EntryQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryQuery")
            .field("pending_keys", &self.keys.len())
            .field("buffered", &self.page.len())
            .field("remaining", &self.remaining)
            .finish_non_exhaustive()
    }
}
