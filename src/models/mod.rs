//! Data models for the kernel.
//!
//! This module contains the core data structures shared by every component:
//! memory entries and their access metadata, lifecycle events, patterns, and
//! consensus proposals.

mod access;
mod consensus;
mod entry;
mod envelope;
mod events;
mod pattern;

pub use access::{AccessLevel, AgentContext};
pub use consensus::{ConsensusProposal, ProposalId, ProposalStatus, Vote};
pub use entry::{
    EntryKey, MAX_KEY_LEN, MAX_NAMESPACE_LEN, MemoryEntry, validate_key, validate_namespace,
};
pub use envelope::{CURRENT_SCHEMA_VERSION, Envelope};
pub use events::{EventType, KernelEvent};
pub use pattern::{Pattern, PatternId, PatternMatch, PatternTier};
