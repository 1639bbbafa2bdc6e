//! Durable storage.
//!
//! All kernel state lives in one `SQLite` database: memory entries, events,
//! pattern rows, and consensus proposals. [`Database`] owns a single writer
//! connection and, for on-disk databases, a small pool of read-only
//! connections. With WAL journaling, readers never wait on the writer, so a
//! TTL sweep or a vote transaction does not block concurrent `retrieve`,
//! `query`, or `search` calls.
//!
//! In-memory databases are private to one connection, so they use the writer
//! for reads as well.

// Dropping database guards slightly early provides no meaningful benefit.
#![allow(clippy::significant_drop_tightening)]

pub mod schema;
pub mod sqlite;

use crate::{Error, Result};
use rusqlite::Connection;
use sqlite::{acquire_lock, observe, open_in_memory, open_reader, open_writer, try_acquire_lock};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tracing::instrument;

/// Read-only connections opened for on-disk databases.
pub const READER_CONNECTIONS: usize = 4;

/// Handle to the kernel database.
///
/// SQLite allows one writer at a time, so every write transaction goes
/// through a single mutex-guarded connection. Writes to different keys
/// therefore queue behind each other for the length of one short
/// transaction; they never wait on readers, and readers never wait on them
/// in WAL mode.
pub struct Database {
    writer: Mutex<Connection>,
    readers: Vec<Mutex<Connection>>,
    next_reader: AtomicUsize,
    path: Option<PathBuf>,
}

impl Database {
    /// Opens (or creates) an on-disk database and applies migrations.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the file cannot be opened or migrated.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let writer = open_writer(&path)?;
        schema::migrate(&writer, schema::MIGRATIONS)?;

        let readers = (0..READER_CONNECTIONS)
            .map(|_| open_reader(&path).map(Mutex::new))
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(readers = readers.len(), "Opened kernel database");
        Ok(Self {
            writer: Mutex::new(writer),
            readers,
            next_reader: AtomicUsize::new(0),
            path: Some(path),
        })
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the schema cannot be created.
    pub fn in_memory() -> Result<Self> {
        let writer = open_in_memory()?;
        schema::migrate(&writer, schema::MIGRATIONS)?;
        Ok(Self {
            writer: Mutex::new(writer),
            readers: Vec::new(),
            next_reader: AtomicUsize::new(0),
            path: None,
        })
    }

    /// Returns the database path, if on disk.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Runs `f` inside a `BEGIN IMMEDIATE` transaction on the writer.
    ///
    /// Commits when `f` returns `Ok`, rolls back otherwise. The writer lock is
    /// held only for the duration of the transaction.
    ///
    /// # Errors
    ///
    /// Returns the error from `f`, or [`Error::Storage`] if the transaction
    /// cannot be started or committed.
    pub fn write<T>(
        &self,
        component: &'static str,
        operation: &'static str,
        f: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<T> {
        let start = Instant::now();
        let result = (|| {
            let conn = acquire_lock(&self.writer);
            conn.execute_batch("BEGIN IMMEDIATE")
                .map_err(Error::storage("begin_transaction"))?;

            let result = f(&conn);

            if result.is_ok() {
                if let Err(e) = conn.execute_batch("COMMIT") {
                    let _ = conn.execute_batch("ROLLBACK");
                    return Err(Error::storage("commit_transaction")(e));
                }
            } else {
                let _ = conn.execute_batch("ROLLBACK");
            }
            result
        })();
        observe(component, operation, start, result)
    }

    /// Runs a read-only closure on a reader connection.
    ///
    /// Picks the first idle reader, falling back to waiting on one in
    /// round-robin order. In-memory databases read through the writer.
    ///
    /// # Errors
    ///
    /// Returns the error from `f`.
    pub fn read<T>(
        &self,
        component: &'static str,
        operation: &'static str,
        f: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<T> {
        let start = Instant::now();
        let result = if self.readers.is_empty() {
            let conn = acquire_lock(&self.writer);
            f(&conn)
        } else {
            let offset = self.next_reader.fetch_add(1, Ordering::Relaxed);
            let count = self.readers.len();
            let idle = (0..count)
                .map(|i| &self.readers[(offset + i) % count])
                .find_map(try_acquire_lock);
            match idle {
                Some(conn) => f(&conn),
                None => {
                    let conn = acquire_lock(&self.readers[offset % count]);
                    f(&conn)
                },
            }
        };
        observe(component, operation, start, result)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .field("readers", &self.readers.len())
            .finish_non_exhaustive()
    }
}
