//! Connection handling for the kernel database.
//!
//! Provides mutex acquisition with poison recovery and the pragmas every
//! connection gets before use.

use crate::{Error, Result};
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, TryLockError};

/// Busy timeout applied to every connection, in milliseconds.
pub const BUSY_TIMEOUT_MS: u32 = 5_000;

/// Acquires a mutex, recovering the inner value if it was poisoned.
///
/// A panic inside a previous critical section leaves the `SQLite` connection
/// usable (any open transaction is rolled back on the next `BEGIN`), so the
/// poison flag is logged and cleared rather than propagated.
pub fn acquire_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("SQLite mutex was poisoned, recovering");
            metrics::counter!("sqlite_mutex_poison_recovery_total").increment(1);
            poisoned.into_inner()
        },
    }
}

/// Attempts to acquire a mutex without blocking.
///
/// Returns `None` if another thread holds the lock.
pub fn try_acquire_lock<T>(mutex: &Mutex<T>) -> Option<MutexGuard<'_, T>> {
    match mutex.try_lock() {
        Ok(guard) => Some(guard),
        Err(TryLockError::Poisoned(poisoned)) => {
            tracing::warn!("SQLite mutex was poisoned, recovering");
            metrics::counter!("sqlite_mutex_poison_recovery_total").increment(1);
            Some(poisoned.into_inner())
        },
        Err(TryLockError::WouldBlock) => None,
    }
}

/// Applies WAL journaling, NORMAL sync and a busy timeout.
///
/// In-memory databases silently keep the `memory` journal mode.
///
/// # Errors
///
/// Returns [`Error::Storage`] if the busy timeout cannot be set.
pub fn configure_connection(conn: &Connection) -> Result<()> {
    // journal_mode returns a row, so failures here are ignored rather than
    // routed through execute_batch.
    let _ = conn.pragma_update(None, "journal_mode", "WAL");
    let _ = conn.pragma_update(None, "synchronous", "NORMAL");
    conn.pragma_update(None, "busy_timeout", BUSY_TIMEOUT_MS)
        .map_err(Error::storage("configure_connection"))?;
    Ok(())
}

/// Opens the read-write connection for a database file.
///
/// # Errors
///
/// Returns [`Error::Storage`] if the file cannot be opened.
pub fn open_writer(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(Error::storage("create_storage_dir"))?;
    }
    let conn = Connection::open(path).map_err(Error::storage("open_sqlite"))?;
    configure_connection(&conn)?;
    Ok(conn)
}

/// Opens a read-only connection to an existing database file.
///
/// # Errors
///
/// Returns [`Error::Storage`] if the file cannot be opened.
pub fn open_reader(path: &Path) -> Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn =
        Connection::open_with_flags(path, flags).map_err(Error::storage("open_sqlite_reader"))?;
    let _ = conn.pragma_update(None, "busy_timeout", BUSY_TIMEOUT_MS);
    Ok(conn)
}

/// Opens a private in-memory database.
///
/// # Errors
///
/// Returns [`Error::Storage`] if `SQLite` cannot allocate the database.
pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory().map_err(Error::storage("open_sqlite_memory"))?;
    configure_connection(&conn)?;
    Ok(conn)
}
