//! Access levels and caller identity.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Visibility of a memory entry, enforced at read time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    /// Only the owning agent.
    #[default]
    Private,
    /// Agents sharing the owner's team.
    Team,
    /// Agents sharing the owner's swarm.
    Swarm,
    /// Any caller.
    Public,
    /// Privileged callers only.
    System,
}

impl AccessLevel {
    /// All access levels, most restrictive owner-scoped first.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::Private,
            Self::Team,
            Self::Swarm,
            Self::Public,
            Self::System,
        ]
    }

    /// Returns the level as a string slice.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Team => "team",
            Self::Swarm => "swarm",
            Self::Public => "public",
            Self::System => "system",
        }
    }

    /// Parses a level string (case-insensitive).
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "private" => Some(Self::Private),
            "team" => Some(Self::Team),
            "swarm" => Some(Self::Swarm),
            "public" => Some(Self::Public),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a calling agent.
///
/// Team and swarm membership are optional; an agent without a team can never
/// satisfy a `team` check on someone else's entry, even one written by another
/// team-less agent. Owners always read their own non-system entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentContext {
    /// Agent identifier.
    pub agent_id: String,
    /// Team the agent belongs to.
    pub team_id: Option<String>,
    /// Swarm the agent belongs to.
    pub swarm_id: Option<String>,
    /// Privileged callers may read `system` entries (and everything else).
    pub privileged: bool,
}

impl AgentContext {
    /// Creates an unprivileged agent with no team or swarm.
    #[must_use]
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            team_id: None,
            swarm_id: None,
            privileged: false,
        }
    }

    /// Creates a privileged system caller.
    #[must_use]
    pub fn system(agent_id: impl Into<String>) -> Self {
        Self {
            privileged: true,
            ..Self::new(agent_id)
        }
    }

    /// Sets the team.
    #[must_use]
    pub fn with_team(mut self, team_id: impl Into<String>) -> Self {
        self.team_id = Some(team_id.into());
        self
    }

    /// Sets the swarm.
    #[must_use]
    pub fn with_swarm(mut self, swarm_id: impl Into<String>) -> Self {
        self.swarm_id = Some(swarm_id.into());
        self
    }

    /// Marks the caller as privileged.
    #[must_use]
    pub const fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }
}
