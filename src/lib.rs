//! # Swarmkernel
//!
//! Shared memory and coordination kernel for fleets of autonomous agents.
//!
//! Agents persist state, discover reusable behavioral patterns, and agree on
//! critical decisions through one authoritative kernel instance. There is no
//! lock-holding controller: coordination is built strictly from the store's
//! own atomic primitives.
//!
//! ## Components
//!
//! - [`MemoryStore`]: namespaced key/value entries with access levels and TTL
//! - [`EventLog`]: append-only lifecycle events with a broadcast publish hook
//! - [`PatternIndex`]: embedding store with approximate nearest-neighbor search
//! - [`Blackboard`]: short-lived swarm-wide hints with pattern subscriptions
//! - [`ConsensusGate`]: quorum voting with exactly-once resolution
//!
//! All durable state lives in a single `SQLite` database. The ANN structure
//! is a derived cache that can be discarded and rebuilt at any time.
//!
//! ## Example
//!
//! ```rust,ignore
//! use swarmkernel::{AccessLevel, AgentContext, EntryKey, Kernel, KernelConfig, StoreOptions};
//!
//! let kernel = Kernel::open(KernelConfig::default())?;
//! let agent = AgentContext::new("agent-42").with_team("build");
//!
//! let key = EntryKey::new("agents", "agent/42/task")?;
//! kernel.memory().store(
//!     &key,
//!     br#"{"status":"done"}"#.to_vec(),
//!     StoreOptions::new(&agent).with_ttl(60).with_access(AccessLevel::Team),
//! )?;
//!
//! let value = kernel.memory().retrieve(&key, &agent)?;
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![allow(clippy::multiple_crate_versions)]

use std::fmt;
use thiserror::Error as ThisError;

// Module declarations
pub mod clock;
pub mod config;
pub mod coordination;
pub mod events;
pub mod kernel;
pub mod memory;
pub mod models;
pub mod observability;
pub mod patterns;
pub mod storage;
pub mod vector;

// Re-exports for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AnnIndexKind, AnnIndexParams, ConsensusSettings, KernelConfig, PatternSettings};
pub use coordination::{Blackboard, ConsensusGate, Hint, HintNotification, Subscription, VoteReceipt};
pub use events::{EventBus, EventFilter, EventLog, EventSink};
pub use kernel::{BackgroundTasks, Kernel, MaintenanceReport};
pub use memory::{EntryQuery, MemoryStore, QueryOptions, StoreOptions, SweepBatch};
pub use models::{
    AccessLevel, AgentContext, ConsensusProposal, EntryKey, Envelope, EventType, KernelEvent,
    MemoryEntry, Pattern, PatternId, PatternMatch, PatternTier, ProposalId, ProposalStatus,
};
pub use patterns::{NewPattern, PatternIndex};

/// Error type for kernel operations.
///
/// Every variant is discriminated so calling agents can tell "retry later"
/// conditions from "do not retry" ones; see [`Error::is_retryable`].
///
/// # Error Variant Triggers
///
/// | Variant | Raised When |
/// |---------|-------------|
/// | `Validation` | Malformed namespace, key, quorum, outcome, or config value |
/// | `NotFound` | Entry, pattern, or proposal does not exist (or has expired) |
/// | `AccessDenied` | Requesting agent may not read the entry at its access level |
/// | `Conflict` | Optimistic version mismatch, or a vote CAS lost twice |
/// | `Schema` | Embedding dimension differs from the index dimension |
/// | `Expired` | Proposal is past its TTL |
/// | `DuplicateVote` | Agent already voted on the proposal |
/// | `ProposalClosed` | Proposal already reached a terminal status |
/// | `Storage` | `SQLite` or filesystem failure |
#[derive(Debug, ThisError)]
pub enum Error {
    /// Malformed input.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The requested item does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// What was looked up ("entry", "pattern", "proposal").
        kind: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// The requesting agent is not allowed to read the entry.
    #[error("access denied: agent '{agent}' cannot read '{key}' ({level})")]
    AccessDenied {
        /// The requesting agent.
        agent: String,
        /// The entry key.
        key: String,
        /// The entry's access level.
        level: AccessLevel,
    },

    /// Optimistic concurrency check failed.
    #[error("conflict on '{key}': expected version {expected}, found {actual}")]
    Conflict {
        /// The contested key or proposal id.
        key: String,
        /// Version the caller expected.
        expected: u64,
        /// Version actually found.
        actual: u64,
    },

    /// Embedding dimension mismatch.
    #[error("schema mismatch: expected embedding dimension {expected}, got {actual}")]
    Schema {
        /// Index dimension.
        expected: usize,
        /// Supplied dimension.
        actual: usize,
    },

    /// The item outlived its TTL.
    #[error("{kind} expired: {id}")]
    Expired {
        /// What expired.
        kind: &'static str,
        /// Identifier of the expired item.
        id: String,
    },

    /// The agent already voted on this proposal.
    #[error("agent '{agent}' already voted on proposal {proposal}")]
    DuplicateVote {
        /// Proposal id.
        proposal: String,
        /// Voting agent.
        agent: String,
    },

    /// The proposal reached a terminal status and accepts no more votes.
    #[error("proposal {proposal} is closed ({status})")]
    ProposalClosed {
        /// Proposal id.
        proposal: String,
        /// Terminal status.
        status: ProposalStatus,
    },

    /// Underlying storage failure.
    #[error("storage operation '{operation}' failed: {cause}")]
    Storage {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },
}

/// Fieldless discriminant of [`Error`], convenient for matching and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`Error::Validation`].
    Validation,
    /// See [`Error::NotFound`].
    NotFound,
    /// See [`Error::AccessDenied`].
    AccessDenied,
    /// See [`Error::Conflict`].
    Conflict,
    /// See [`Error::Schema`].
    Schema,
    /// See [`Error::Expired`].
    Expired,
    /// See [`Error::DuplicateVote`].
    DuplicateVote,
    /// See [`Error::ProposalClosed`].
    ProposalClosed,
    /// See [`Error::Storage`].
    Storage,
}

impl ErrorKind {
    /// Returns the kind as a stable label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::AccessDenied => "access_denied",
            Self::Conflict => "conflict",
            Self::Schema => "schema",
            Self::Expired => "expired",
            Self::DuplicateVote => "duplicate_vote",
            Self::ProposalClosed => "proposal_closed",
            Self::Storage => "storage",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Returns the discriminant of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::AccessDenied { .. } => ErrorKind::AccessDenied,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::Schema { .. } => ErrorKind::Schema,
            Self::Expired { .. } => ErrorKind::Expired,
            Self::DuplicateVote { .. } => ErrorKind::DuplicateVote,
            Self::ProposalClosed { .. } => ErrorKind::ProposalClosed,
            Self::Storage { .. } => ErrorKind::Storage,
        }
    }

    /// Whether a caller may reasonably retry the operation later.
    ///
    /// Only storage failures and optimistic conflicts are transient.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage { .. } | Self::Conflict { .. })
    }

    /// Builds a closure mapping any displayable error into [`Error::Storage`].
    pub(crate) fn storage<E: fmt::Display>(operation: &'static str) -> impl FnOnce(E) -> Self {
        move |e| Self::Storage {
            operation: operation.to_string(),
            cause: e.to_string(),
        }
    }
}

/// Result type alias for kernel operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Returns the current Unix timestamp in seconds.
///
/// Falls back to 0 if the system clock is before the Unix epoch.
#[must_use]
pub fn current_timestamp() -> u64 {
    current_timestamp_millis() / 1000
}

/// Returns the current Unix timestamp in milliseconds.
#[must_use]
pub fn current_timestamp_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Validation("empty key".to_string());
        assert_eq!(err.to_string(), "validation failed: empty key");

        let err = Error::Storage {
            operation: "insert_entry".to_string(),
            cause: "disk full".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "storage operation 'insert_entry' failed: disk full"
        );

        let err = Error::Schema {
            expected: 384,
            actual: 3,
        };
        assert!(err.to_string().contains("384"));
    }

    #[test]
    fn test_retryable_classification() {
        let storage = Error::Storage {
            operation: "x".into(),
            cause: "y".into(),
        };
        let conflict = Error::Conflict {
            key: "k".into(),
            expected: 1,
            actual: 2,
        };
        assert!(storage.is_retryable());
        assert!(conflict.is_retryable());

        assert!(!Error::Validation("bad".into()).is_retryable());
        assert!(
            !Error::AccessDenied {
                agent: "b".into(),
                key: "k".into(),
                level: AccessLevel::Private,
            }
            .is_retryable()
        );
        assert!(
            !Error::Schema {
                expected: 3,
                actual: 4
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_error_kind_labels() {
        let err = Error::DuplicateVote {
            proposal: "p".into(),
            agent: "a".into(),
        };
        assert_eq!(err.kind(), ErrorKind::DuplicateVote);
        assert_eq!(err.kind().as_str(), "duplicate_vote");
    }

    #[test]
    fn test_timestamps_consistent() {
        let secs = current_timestamp();
        let millis = current_timestamp_millis();
        assert!(secs > 0);
        assert!(millis / 1000 >= secs);
    }
}
