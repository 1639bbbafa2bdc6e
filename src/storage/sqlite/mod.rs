//! Shared `SQLite` utilities.
//!
//! - [`connection`]: mutex acquisition with poison recovery, connection pragmas
//! - [`sql`]: LIKE escaping, glob conversion and matching, integer conversions
//! - [`metrics`]: storage operation counters and latency histograms

mod connection;
mod metrics;
mod sql;

pub use connection::{
    BUSY_TIMEOUT_MS, acquire_lock, configure_connection, open_in_memory, open_reader,
    open_writer, try_acquire_lock,
};
pub use self::metrics::{observe, record_operation_metrics};
pub use sql::{
    escape_like_wildcards, from_sql_i64, glob_matches, glob_to_like_pattern,
    numbered_placeholders, to_sql_i64,
};
