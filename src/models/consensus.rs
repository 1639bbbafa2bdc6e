//! Consensus proposal types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a consensus proposal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProposalId(String);

impl ProposalId {
    /// Creates a proposal ID from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh, time-ordered ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProposalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProposalId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle status of a proposal.
///
/// `Pending` is the only non-terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalStatus {
    /// Collecting votes.
    #[default]
    Pending,
    /// Quorum of approving votes reached.
    Approved,
    /// Vetoed.
    Rejected,
    /// TTL elapsed without resolution.
    Expired,
}

impl ProposalStatus {
    /// Returns the status as a string slice.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        }
    }

    /// Parses a status string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    /// Whether no further transitions are possible.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single recorded vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    /// Voting agent.
    pub agent_id: String,
    /// Whether the agent approves.
    pub approve: bool,
}

/// A quorum-voted decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusProposal {
    /// Unique identifier.
    pub id: ProposalId,
    /// Agent that opened the proposal.
    pub proposer: String,
    /// Opaque decision payload.
    pub decision: Vec<u8>,
    /// Approving votes required.
    pub quorum: u32,
    /// One vote per agent.
    pub votes: BTreeMap<String, bool>,
    /// Current status.
    pub status: ProposalStatus,
    /// Creation time, Unix milliseconds.
    pub created_at: u64,
    /// Lifetime in seconds; 0 never expires.
    pub ttl_seconds: u64,
    /// Row version used for compare-and-set transitions.
    pub version: u64,
}

impl ConsensusProposal {
    /// Number of approving votes.
    #[must_use]
    pub fn approvals(&self) -> u32 {
        count(self.votes.values().filter(|v| **v))
    }

    /// Number of rejecting votes.
    #[must_use]
    pub fn rejections(&self) -> u32 {
        count(self.votes.values().filter(|v| !**v))
    }

    /// Whether the agent already voted.
    #[must_use]
    pub fn has_voted(&self, agent_id: &str) -> bool {
        self.votes.contains_key(agent_id)
    }

    /// Votes as a list, ordered by agent id.
    #[must_use]
    pub fn vote_list(&self) -> Vec<Vote> {
        self.votes
            .iter()
            .map(|(agent_id, approve)| Vote {
                agent_id: agent_id.clone(),
                approve: *approve,
            })
            .collect()
    }

    /// Instant after which a pending proposal expires.
    #[must_use]
    pub const fn expires_at(&self) -> Option<u64> {
        if self.ttl_seconds == 0 {
            None
        } else {
            Some(
                self.created_at
                    .saturating_add(self.ttl_seconds.saturating_mul(1000)),
            )
        }
    }

    /// Whether the proposal is past its TTL at `now_millis`.
    #[must_use]
    pub fn is_past_ttl(&self, now_millis: u64) -> bool {
        self.expires_at().is_some_and(|at| now_millis > at)
    }
}

fn count<'a>(votes: impl Iterator<Item = &'a bool>) -> u32 {
    u32::try_from(votes.count()).unwrap_or(u32::MAX)
}
