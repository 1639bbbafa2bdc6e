//! Kernel lifecycle event types.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Kinds of lifecycle events recorded by the event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    /// An entry was written.
    EntryStored,
    /// An entry was explicitly deleted.
    EntryDeleted,
    /// The TTL sweep removed a batch of entries.
    EntrySwept,
    /// A blackboard hint was posted.
    HintPosted,
    /// A pattern was stored.
    PatternStored,
    /// A pattern moved between tiers.
    PatternTierChanged,
    /// Low-confidence patterns were garbage-collected.
    PatternCollected,
    /// The ANN index was rebuilt and swapped in.
    IndexRebuilt,
    /// A consensus proposal was created.
    ProposalCreated,
    /// A vote was recorded.
    VoteCast,
    /// A proposal resolved to approved or rejected.
    ConsensusReached,
    /// A pending proposal passed its TTL.
    ProposalExpired,
}

impl EventType {
    /// Every event type.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::EntryStored,
            Self::EntryDeleted,
            Self::EntrySwept,
            Self::HintPosted,
            Self::PatternStored,
            Self::PatternTierChanged,
            Self::PatternCollected,
            Self::IndexRebuilt,
            Self::ProposalCreated,
            Self::VoteCast,
            Self::ConsensusReached,
            Self::ProposalExpired,
        ]
    }

    /// Returns the wire name of the event type.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::EntryStored => "entry-stored",
            Self::EntryDeleted => "entry-deleted",
            Self::EntrySwept => "entry-swept",
            Self::HintPosted => "hint-posted",
            Self::PatternStored => "pattern-stored",
            Self::PatternTierChanged => "pattern-tier-changed",
            Self::PatternCollected => "pattern-collected",
            Self::IndexRebuilt => "index-rebuilt",
            Self::ProposalCreated => "proposal-created",
            Self::VoteCast => "vote-cast",
            Self::ConsensusReached => "consensus-reached",
            Self::ProposalExpired => "proposal-expired",
        }
    }

    /// Parses a wire name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Self::all().iter().copied().find(|t| t.as_str() == s)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelEvent {
    /// Unique, time-ordered identifier.
    pub id: String,
    /// Event kind.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Structured payload.
    pub payload: serde_json::Value,
    /// Unix milliseconds.
    pub timestamp: u64,
    /// Agent (or kernel component) that caused the event.
    pub source: String,
    /// Audit retention in seconds; 0 keeps the event forever.
    pub ttl_seconds: u64,
}

impl KernelEvent {
    /// Creates an event with a fresh id.
    #[must_use]
    pub fn new(
        event_type: EventType,
        source: impl Into<String>,
        payload: serde_json::Value,
        timestamp: u64,
        ttl_seconds: u64,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            event_type,
            payload,
            timestamp,
            source: source.into(),
            ttl_seconds,
        }
    }

    /// Returns the event type name.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        self.event_type.as_str()
    }

    /// Reads a string field from the payload.
    #[must_use]
    pub fn payload_str(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(serde_json::Value::as_str)
    }
}
