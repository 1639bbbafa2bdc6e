//! Quorum voting gate.
//!
//! Proposals move `pending -> approved | rejected | expired` and never leave a
//! terminal status. Every status change is a compare-and-set on the row
//! version, so concurrent votes that cross the quorum together still produce
//! exactly one transition and one `consensus-reached` event.

use crate::clock::SharedClock;
use crate::events::EventLog;
use crate::models::{ConsensusProposal, EventType, KernelEvent, ProposalId, ProposalStatus};
use crate::storage::Database;
use crate::storage::sqlite::{from_sql_i64, to_sql_i64};
use crate::{Error, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::instrument;

/// Attempts at the read-recount-CAS sequence before reporting a conflict.
const VOTE_ATTEMPTS: usize = 2;

const PROPOSAL_COLUMNS: &str =
    "id, proposer, decision, quorum, votes, status, created_at, ttl, version";

/// Result of a successful [`ConsensusGate::vote`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteReceipt {
    /// Proposal voted on.
    pub proposal: ProposalId,
    /// Status after the vote.
    pub status: ProposalStatus,
    /// Approving votes after this vote.
    pub approvals: u32,
    /// Rejecting votes after this vote.
    pub rejections: u32,
    /// Whether this vote moved the proposal out of `pending`.
    pub transitioned: bool,
}

/// Outcome of one vote transaction.
enum Attempt {
    Applied(VoteReceipt, Vec<KernelEvent>),
    /// The proposal was past its TTL; carries the expiry event if this call
    /// made the transition.
    Expired(Option<KernelEvent>),
    Lost { expected: u64 },
}

/// Quorum-based decision gate persisted in the kernel database.
pub struct ConsensusGate {
    db: Arc<Database>,
    events: Arc<EventLog>,
    clock: SharedClock,
    allow_veto: bool,
}

impl ConsensusGate {
    /// Creates a gate. With `allow_veto`, one rejecting vote rejects a
    /// pending proposal.
    #[must_use]
    pub fn new(
        db: Arc<Database>,
        events: Arc<EventLog>,
        clock: SharedClock,
        allow_veto: bool,
    ) -> Self {
        Self {
            db,
            events,
            clock,
            allow_veto,
        }
    }

    /// Opens a proposal in `pending` status.
    ///
    /// `ttl_seconds = 0` never expires.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if `quorum` is zero or `proposer` is
    /// empty.
    #[instrument(
        skip(self, decision),
        fields(component = "consensus", operation = "propose")
    )]
    pub fn propose(
        &self,
        proposer: &str,
        decision: Vec<u8>,
        quorum: u32,
        ttl_seconds: u64,
    ) -> Result<ProposalId> {
        if quorum == 0 {
            return Err(Error::Validation("quorum must be at least 1".to_string()));
        }
        if proposer.is_empty() {
            return Err(Error::Validation("proposer must not be empty".to_string()));
        }

        let id = ProposalId::generate();
        let now = self.clock.now_millis();
        let expires_at = (ttl_seconds > 0)
            .then(|| to_sql_i64(now.saturating_add(ttl_seconds.saturating_mul(1000))));

        let event = self.db.write("consensus", "propose", |conn| {
            conn.execute(
                "INSERT INTO consensus_proposals
                    (id, decision, proposer, quorum, votes, status, created_at, ttl,
                     expires_at, version)
                 VALUES (?1, ?2, ?3, ?4, '{}', ?5, ?6, ?7, ?8, 1)",
                params![
                    id.as_str(),
                    decision,
                    proposer,
                    quorum,
                    ProposalStatus::Pending.as_str(),
                    to_sql_i64(now),
                    to_sql_i64(ttl_seconds),
                    expires_at,
                ],
            )
            .map_err(Error::storage("insert_proposal"))?;
            let event = self.events.event(
                EventType::ProposalCreated,
                proposer,
                json!({ "id": id.as_str(), "quorum": quorum, "ttl_seconds": ttl_seconds }),
            );
            EventLog::insert(conn, &event)?;
            Ok(event)
        })?;

        self.events.publish([event]);
        metrics::counter!("consensus_proposals_total").increment(1);
        Ok(id)
    }

    /// Records one vote and resolves the proposal if it crossed a threshold.
    ///
    /// The read, the recount and the status compare-and-set run in one write
    /// transaction, so a vote from a new agent on a pending proposal is always
    /// recorded. The version guard on the update still protects against a
    /// writer outside this process; if it fails, the sequence is retried once
    /// and then reported as [`Error::Conflict`].
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the proposal does not exist
    /// - [`Error::Expired`] if it is past its TTL (it transitions to
    ///   `expired` on the first such call)
    /// - [`Error::ProposalClosed`] if it was already approved or rejected
    /// - [`Error::DuplicateVote`] if `agent_id` already voted
    /// - [`Error::Conflict`] if the row changed underneath the transaction
    ///   twice
    #[instrument(skip(self), fields(component = "consensus", operation = "vote"))]
    pub fn vote(&self, id: &ProposalId, agent_id: &str, approve: bool) -> Result<VoteReceipt> {
        if agent_id.is_empty() {
            return Err(Error::Validation("agent id must not be empty".to_string()));
        }

        let mut last_expected = 0;
        for attempt in 0..VOTE_ATTEMPTS {
            if attempt > 0 {
                metrics::counter!("consensus_cas_retries_total").increment(1);
            }
            let outcome = self.db.write("consensus", "vote", |conn| {
                let snapshot = load_proposal(conn, id)?;
                self.apply_vote(conn, snapshot, agent_id, approve)
            })?;
            match outcome {
                Attempt::Applied(receipt, events) => {
                    self.events.publish(events);
                    metrics::counter!(
                        "consensus_votes_total",
                        "approve" => if approve { "true" } else { "false" }
                    )
                    .increment(1);
                    return Ok(receipt);
                },
                Attempt::Expired(event) => {
                    if event.is_some() {
                        metrics::counter!("consensus_transitions_total", "status" => "expired")
                            .increment(1);
                    }
                    self.events.publish(event);
                    return Err(expired(id));
                },
                Attempt::Lost { expected } => last_expected = expected,
            }
        }

        metrics::counter!("consensus_cas_conflicts_total").increment(1);
        let actual = self.load(id).map_or(last_expected, |p| p.version);
        Err(Error::Conflict {
            key: id.to_string(),
            expected: last_expected,
            actual,
        })
    }

    /// Validates and applies a vote against `proposal` inside an open write
    /// transaction. Errors roll the transaction back.
    fn apply_vote(
        &self,
        conn: &Connection,
        proposal: ConsensusProposal,
        agent_id: &str,
        approve: bool,
    ) -> Result<Attempt> {
        let now = self.clock.now_millis();
        match proposal.status {
            ProposalStatus::Pending => {},
            ProposalStatus::Expired => return Err(expired(&proposal.id)),
            status @ (ProposalStatus::Approved | ProposalStatus::Rejected) => {
                return Err(Error::ProposalClosed {
                    proposal: proposal.id.to_string(),
                    status,
                });
            },
        }
        if proposal.is_past_ttl(now) {
            return self.expire_in(conn, &proposal);
        }
        if proposal.has_voted(agent_id) {
            return Err(Error::DuplicateVote {
                proposal: proposal.id.to_string(),
                agent: agent_id.to_string(),
            });
        }

        let mut votes = proposal.votes.clone();
        votes.insert(agent_id.to_string(), approve);
        let updated = ConsensusProposal {
            votes,
            ..proposal.clone()
        };
        let approvals = updated.approvals();
        let rejections = updated.rejections();
        let status = if approvals >= updated.quorum {
            ProposalStatus::Approved
        } else if self.allow_veto && !approve {
            ProposalStatus::Rejected
        } else {
            ProposalStatus::Pending
        };
        let transitioned = status != ProposalStatus::Pending;
        let votes_json = serde_json::to_string(&updated.votes)
            .map_err(|e| Error::Validation(format!("unserializable votes: {e}")))?;

        if !cas_update(conn, &proposal, &votes_json, status)? {
            return Ok(Attempt::Lost {
                expected: proposal.version,
            });
        }

        let mut events = vec![self.events.event(
            EventType::VoteCast,
            agent_id,
            json!({
                "id": proposal.id.as_str(),
                "approve": approve,
                "approvals": approvals,
                "rejections": rejections,
            }),
        )];
        if transitioned {
            events.push(self.events.event(
                EventType::ConsensusReached,
                agent_id,
                json!({
                    "id": proposal.id.as_str(),
                    "status": status.as_str(),
                    "approvals": approvals,
                    "rejections": rejections,
                    "quorum": proposal.quorum,
                }),
            ));
        }
        for event in &events {
            EventLog::insert(conn, event)?;
        }

        if transitioned {
            metrics::counter!("consensus_transitions_total", "status" => status.as_str())
                .increment(1);
            tracing::info!(
                proposal = %proposal.id,
                status = %status,
                approvals,
                rejections,
                "Consensus reached"
            );
        }
        Ok(Attempt::Applied(
            VoteReceipt {
                proposal: proposal.id.clone(),
                status,
                approvals,
                rejections,
                transitioned,
            },
            events,
        ))
    }

    /// Moves a pending, overdue proposal to `expired` inside an open write
    /// transaction. Only the CAS winner records the `proposal-expired` event.
    fn expire_in(&self, conn: &Connection, proposal: &ConsensusProposal) -> Result<Attempt> {
        let votes_json = serde_json::to_string(&proposal.votes)
            .map_err(|e| Error::Validation(format!("unserializable votes: {e}")))?;
        if !cas_update(conn, proposal, &votes_json, ProposalStatus::Expired)? {
            return Ok(Attempt::Expired(None));
        }
        let event = expired_event(&self.events, proposal.id.as_str());
        EventLog::insert(conn, &event)?;
        Ok(Attempt::Expired(Some(event)))
    }

    /// Current snapshot of a proposal. Read-only.
    ///
    /// A pending proposal past its TTL is reported as `expired` even before
    /// the transition is persisted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the proposal does not exist.
    pub fn get_status(&self, id: &ProposalId) -> Result<ConsensusProposal> {
        let mut proposal = self.load(id)?;
        if proposal.status == ProposalStatus::Pending
            && proposal.is_past_ttl(self.clock.now_millis())
        {
            proposal.status = ProposalStatus::Expired;
        }
        Ok(proposal)
    }

    /// Expires up to `limit` pending proposals past their TTL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the update fails.
    #[instrument(skip(self), fields(component = "consensus", operation = "expire_overdue"))]
    pub fn expire_overdue(&self, limit: usize) -> Result<usize> {
        if limit == 0 {
            return Ok(0);
        }
        let now = to_sql_i64(self.clock.now_millis());
        let events = self.db.write("consensus", "expire_overdue", |conn| {
            let ids: Vec<String> = {
                let mut stmt = conn
                    .prepare_cached(
                        "UPDATE consensus_proposals
                         SET status = 'expired', version = version + 1
                         WHERE id IN (
                            SELECT id FROM consensus_proposals
                            WHERE status = 'pending'
                              AND expires_at IS NOT NULL AND expires_at < ?1
                            ORDER BY expires_at
                            LIMIT ?2
                         )
                         RETURNING id",
                    )
                    .map_err(Error::storage("prepare_expire_overdue"))?;
                let rows = stmt
                    .query_map(params![now, to_sql_i64(limit as u64)], |row| row.get(0))
                    .map_err(Error::storage("expire_overdue"))?;
                rows.collect::<rusqlite::Result<_>>()
                    .map_err(Error::storage("read_expired_ids"))?
            };
            let events: Vec<KernelEvent> = ids
                .iter()
                .map(|id| expired_event(&self.events, id))
                .collect();
            for event in &events {
                EventLog::insert(conn, event)?;
            }
            Ok(events)
        })?;

        let expired = events.len();
        self.events.publish(events);
        if expired > 0 {
            metrics::counter!("consensus_transitions_total", "status" => "expired")
                .increment(expired as u64);
            tracing::info!(expired, "Expired overdue proposals");
        }
        Ok(expired)
    }

    /// Lists proposals, newest first, optionally filtered by stored status.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the query fails.
    pub fn list(
        &self,
        status: Option<ProposalStatus>,
        limit: usize,
    ) -> Result<Vec<ConsensusProposal>> {
        let sql = format!(
            "SELECT {PROPOSAL_COLUMNS} FROM consensus_proposals
             WHERE ?1 IS NULL OR status = ?1
             ORDER BY created_at DESC, id DESC
             LIMIT ?2"
        );
        let raws = self.db.read("consensus", "list", |conn| {
            let mut stmt = conn
                .prepare_cached(&sql)
                .map_err(Error::storage("prepare_list_proposals"))?;
            let rows = stmt
                .query_map(
                    params![status.map(|s| s.as_str()), to_sql_i64(limit as u64)],
                    RawProposal::from_row,
                )
                .map_err(Error::storage("list_proposals"))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(Error::storage("read_proposal_row"))
        })?;
        raws.into_iter().map(RawProposal::into_proposal).collect()
    }

    fn load(&self, id: &ProposalId) -> Result<ConsensusProposal> {
        self.db
            .read("consensus", "load", |conn| load_proposal(conn, id))
    }
}

fn load_proposal(conn: &Connection, id: &ProposalId) -> Result<ConsensusProposal> {
    let sql = format!("SELECT {PROPOSAL_COLUMNS} FROM consensus_proposals WHERE id = ?1");
    conn.query_row(&sql, [id.as_str()], RawProposal::from_row)
        .optional()
        .map_err(Error::storage("load_proposal"))?
        .ok_or_else(|| Error::NotFound {
            kind: "proposal",
            id: id.to_string(),
        })?
        .into_proposal()
}

impl std::fmt::Debug for ConsensusGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsensusGate")
            .field("allow_veto", &self.allow_veto)
            .finish_non_exhaustive()
    }
}

/// Writes new votes and status if the row is still at the snapshot version
/// and pending. Returns whether the CAS won.
fn cas_update(
    conn: &Connection,
    snapshot: &ConsensusProposal,
    votes_json: &str,
    status: ProposalStatus,
) -> Result<bool> {
    let updated = conn
        .execute(
            "UPDATE consensus_proposals
             SET votes = ?3, status = ?4, version = version + 1
             WHERE id = ?1 AND version = ?2 AND status = 'pending'",
            params![
                snapshot.id.as_str(),
                to_sql_i64(snapshot.version),
                votes_json,
                status.as_str(),
            ],
        )
        .map_err(Error::storage("cas_update_proposal"))?;
    Ok(updated == 1)
}

fn expired_event(events: &EventLog, id: &str) -> KernelEvent {
    events.event(EventType::ProposalExpired, "kernel", json!({ "id": id }))
}

fn expired(id: &ProposalId) -> Error {
    Error::Expired {
        kind: "proposal",
        id: id.to_string(),
    }
}

struct RawProposal {
    id: String,
    proposer: String,
    decision: Vec<u8>,
    quorum: u32,
    votes: String,
    status: String,
    created_at: i64,
    ttl: i64,
    version: i64,
}

impl RawProposal {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            proposer: row.get(1)?,
            decision: row.get(2)?,
            quorum: row.get(3)?,
            votes: row.get(4)?,
            status: row.get(5)?,
            created_at: row.get(6)?,
            ttl: row.get(7)?,
            version: row.get(8)?,
        })
    }

    fn into_proposal(self) -> Result<ConsensusProposal> {
        let votes: BTreeMap<String, bool> =
            serde_json::from_str(&self.votes).map_err(Error::storage("decode_votes"))?;
        let status = ProposalStatus::parse(&self.status).ok_or_else(|| Error::Storage {
            operation: "decode_proposal_status".to_string(),
            cause: format!("unknown status '{}'", self.status),
        })?;
        Ok(ConsensusProposal {
            id: ProposalId::new(self.id),
            proposer: self.proposer,
            decision: self.decision,
            quorum: self.quorum,
            votes,
            status,
            created_at: from_sql_i64(self.created_at),
            ttl_seconds: from_sql_i64(self.ttl),
            version: from_sql_i64(self.version),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::{EventBus, EventFilter};

    fn gate(allow_veto: bool) -> (ConsensusGate, ManualClock) {
        let clock = ManualClock::new(50_000_000);
        let shared: SharedClock = Arc::new(clock.clone());
        let db = Arc::new(Database::in_memory().unwrap());
        let events = Arc::new(EventLog::new(
            Arc::clone(&db),
            EventBus::new(64),
            Arc::clone(&shared),
            0,
        ));
        (ConsensusGate::new(db, events, shared, allow_veto), clock)
    }

    fn reached_events(gate: &ConsensusGate) -> usize {
        gate.events
            .recent(&EventFilter::new().with_type(EventType::ConsensusReached), 100)
            .unwrap()
            .len()
    }

    #[test]
    fn test_quorum_approves() {
        let (gate, _) = gate(false);
        let id = gate.propose("planner", b"deploy-v2".to_vec(), 2, 3_600).unwrap();

        let first = gate.vote(&id, "agentA", true).unwrap();
        assert_eq!(first.status, ProposalStatus::Pending);
        assert!(!first.transitioned);

        let second = gate.vote(&id, "agentB", true).unwrap();
        assert_eq!(second.status, ProposalStatus::Approved);
        assert!(second.transitioned);
        assert_eq!(second.approvals, 2);

        let status = gate.get_status(&id).unwrap();
        assert_eq!(status.status, ProposalStatus::Approved);
        assert_eq!(status.decision, b"deploy-v2".to_vec());
        assert_eq!(reached_events(&gate), 1);
    }

    #[test]
    fn test_duplicate_and_closed_votes() {
        let (gate, _) = gate(false);
        let id = gate.propose("p", vec![1], 1, 0).unwrap();
        let err = gate.vote(&id, "a", false).unwrap();
        assert_eq!(err.rejections, 1);
        assert!(matches!(
            gate.vote(&id, "a", true),
            Err(Error::DuplicateVote { .. })
        ));

        gate.vote(&id, "b", true).unwrap();
        assert!(matches!(
            gate.vote(&id, "c", true),
            Err(Error::ProposalClosed {
                status: ProposalStatus::Approved,
                ..
            })
        ));
    }

    #[test]
    fn test_rejection_without_veto_stays_pending() {
        let (gate, _) = gate(false);
        let id = gate.propose("p", vec![], 2, 0).unwrap();
        let receipt = gate.vote(&id, "a", false).unwrap();
        assert_eq!(receipt.status, ProposalStatus::Pending);
        assert_eq!(receipt.rejections, 1);
    }

    #[test]
    fn test_veto_rejects() {
        let (gate, _) = gate(true);
        let id = gate.propose("p", vec![], 3, 0).unwrap();
        gate.vote(&id, "a", true).unwrap();
        let receipt = gate.vote(&id, "b", false).unwrap();
        assert_eq!(receipt.status, ProposalStatus::Rejected);
        assert!(receipt.transitioned);
        assert!(matches!(
            gate.vote(&id, "c", true),
            Err(Error::ProposalClosed { .. })
        ));
        assert_eq!(reached_events(&gate), 1);
    }

    #[test]
    fn test_expiry_transitions_once() {
        let (gate, clock) = gate(false);
        let id = gate.propose("p", vec![], 2, 60).unwrap();
        gate.vote(&id, "a", true).unwrap();
        clock.advance_secs(61);

        assert_eq!(gate.get_status(&id).unwrap().status, ProposalStatus::Expired);
        assert!(matches!(gate.vote(&id, "b", true), Err(Error::Expired { .. })));
        assert!(matches!(gate.vote(&id, "c", true), Err(Error::Expired { .. })));
        assert_eq!(gate.expire_overdue(10).unwrap(), 0);

        let expired = gate
            .events
            .recent(&EventFilter::new().with_type(EventType::ProposalExpired), 10)
            .unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(reached_events(&gate), 0);
    }

    #[test]
    fn test_expire_overdue_and_list() {
        let (gate, clock) = gate(false);
        let short = gate.propose("p", vec![], 1, 10).unwrap();
        let forever = gate.propose("p", vec![], 1, 0).unwrap();
        clock.advance_secs(11);

        assert_eq!(gate.expire_overdue(10).unwrap(), 1);
        let expired = gate.list(Some(ProposalStatus::Expired), 10).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, short);
        let pending = gate.list(Some(ProposalStatus::Pending), 10).unwrap();
        assert_eq!(pending[0].id, forever);
        assert_eq!(gate.list(None, 10).unwrap().len(), 2);
    }

    #[test]
    fn test_invalid_proposals() {
        let (gate, _) = gate(false);
        assert!(matches!(
            gate.propose("p", vec![], 0, 0),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            gate.vote(&ProposalId::new("nope"), "a", true),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_stale_snapshot_loses_cas() {
        let (gate, _) = gate(false);
        let id = gate.propose("p", vec![], 5, 0).unwrap();
        let stale = gate.load(&id).unwrap();
        gate.vote(&id, "a", true).unwrap();

        let attempt = gate
            .db
            .write("consensus", "test_vote", |conn| {
                gate.apply_vote(conn, stale, "b", true)
            })
            .unwrap();
        match attempt {
            Attempt::Lost { expected } => assert_eq!(expected, 1),
            Attempt::Applied(..) | Attempt::Expired(_) => {
                panic!("stale snapshot must not apply")
            },
        }
        assert_eq!(gate.get_status(&id).unwrap().votes.len(), 1);
    }

    #[test]
    fn test_concurrent_single_votes_all_recorded() {
        let (gate, _) = gate(false);
        let gate = Arc::new(gate);
        let id = gate.propose("p", vec![], 100, 0).unwrap();
        let barrier = Arc::new(std::sync::Barrier::new(16));

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let gate = Arc::clone(&gate);
                let barrier = Arc::clone(&barrier);
                let id = id.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    gate.vote(&id, &format!("agent-{i}"), true)
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap().is_ok());
        }

        let status = gate.get_status(&id).unwrap();
        assert_eq!(status.votes.len(), 16);
        assert_eq!(status.status, ProposalStatus::Pending);
    }
}
