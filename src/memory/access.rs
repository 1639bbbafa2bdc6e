//! Read-time access control.

use crate::models::{AccessLevel, AgentContext, MemoryEntry};
use crate::{Error, Result};

/// Whether `requester` may read `entry`.
///
/// The owner can always read its own entry unless it is a system entry.
/// Team and swarm checks compare against the owner's membership captured at
/// write time. Both sides must have the id set; two team-less agents do not
/// share a team.
#[must_use]
pub fn can_read(entry: &MemoryEntry, requester: &AgentContext) -> bool {
    if requester.privileged {
        return true;
    }
    let is_owner = entry.owner == requester.agent_id;
    match entry.access_level {
        AccessLevel::Private => is_owner,
        AccessLevel::Team | AccessLevel::Swarm if is_owner => true,
        AccessLevel::Team => same_group(entry.owner_team.as_deref(), requester.team_id.as_deref()),
        AccessLevel::Swarm => {
            same_group(entry.owner_swarm.as_deref(), requester.swarm_id.as_deref())
        },
        AccessLevel::Public => true,
        AccessLevel::System => false,
    }
}

/// Fails with [`Error::AccessDenied`] unless `requester` may read `entry`.
///
/// # Errors
///
/// Returns [`Error::AccessDenied`] on a violation.
pub fn check_read(entry: &MemoryEntry, requester: &AgentContext) -> Result<()> {
    if can_read(entry, requester) {
        return Ok(());
    }
    metrics::counter!(
        "memory_access_denied_total",
        "level" => entry.access_level.as_str()
    )
    .increment(1);
    Err(Error::AccessDenied {
        agent: requester.agent_id.clone(),
        key: entry.key.to_string(),
        level: entry.access_level,
    })
}

fn same_group(owner: Option<&str>, requester: Option<&str>) -> bool {
    matches!((owner, requester), (Some(a), Some(b)) if a == b)
}
