//! End-to-end scenarios against a full kernel.
//!
//! - Entry expiry through a sweep cycle
//! - Two-agent consensus
//! - Blackboard hints visible within a swarm until their TTL
//! - Access control, delete idempotence, and pattern self-match

// Integration tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use swarmkernel::{
    AccessLevel, AgentContext, EntryKey, Error, EventFilter, EventType, Kernel, KernelConfig,
    ManualClock, NewPattern, ProposalStatus, QueryOptions, StoreOptions,
};
use tempfile::TempDir;

const START_MILLIS: u64 = 1_700_000_000_000;

fn kernel_with_clock(config: KernelConfig) -> (Kernel, ManualClock) {
    let clock = ManualClock::new(START_MILLIS);
    let kernel = Kernel::open_with_clock(config, Arc::new(clock.clone())).unwrap();
    (kernel, clock)
}

fn test_config() -> KernelConfig {
    KernelConfig::default().with_embedding_dimension(8)
}

fn on_disk(dir: &TempDir) -> KernelConfig {
    test_config().with_storage_path(dir.path().join("kernel.db"))
}

// ============================================================================
// Scenario A: team entry expires after TTL plus one sweep
// ============================================================================

#[test]
fn scenario_a_entry_expires_after_sweep() {
    let dir = TempDir::new().unwrap();
    let (kernel, clock) = kernel_with_clock(on_disk(&dir));
    let writer = AgentContext::new("agent-42").with_team("build");
    let teammate = AgentContext::new("agent-7").with_team("build");
    let key = EntryKey::new("agents", "agent/42/task").unwrap();

    kernel
        .memory()
        .store(
            &key,
            br#"{"status":"done"}"#.to_vec(),
            StoreOptions::new(&writer)
                .with_ttl(60)
                .with_access(AccessLevel::Team),
        )
        .unwrap();
    assert_eq!(
        kernel.memory().retrieve(&key, &teammate).unwrap(),
        br#"{"status":"done"}"#
    );

    clock.advance_secs(61);
    let report = kernel.run_maintenance();
    assert!(report.is_clean());
    assert_eq!(report.entries_expired, 1);

    let err = kernel.memory().retrieve(&key, &writer).unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));

    let swept = kernel
        .events()
        .recent(&EventFilter::new().with_type(EventType::EntrySwept), 10)
        .unwrap();
    assert_eq!(swept.len(), 1);
}

// ============================================================================
// Scenario B: quorum of two approves
// ============================================================================

#[test]
fn scenario_b_two_votes_approve() {
    let (kernel, _clock) = kernel_with_clock(test_config());
    let gate = kernel.consensus();

    let id = gate.propose("planner", b"deploy-v2".to_vec(), 2, 3_600).unwrap();
    let first = gate.vote(&id, "agentA", true).unwrap();
    assert_eq!(first.status, ProposalStatus::Pending);
    assert!(!first.transitioned);

    let second = gate.vote(&id, "agentB", true).unwrap();
    assert!(second.transitioned);

    let status = gate.get_status(&id).unwrap();
    assert_eq!(status.status, ProposalStatus::Approved);
    assert_eq!(status.decision, b"deploy-v2");
    assert_eq!(status.approvals(), 2);

    let late = gate.vote(&id, "agentC", true).unwrap_err();
    assert!(matches!(late, Error::ProposalClosed { .. }));
}

// ============================================================================
// Scenario C: hints readable within the swarm until the TTL elapses
// ============================================================================

#[test]
fn scenario_c_hint_visible_until_ttl() {
    let (kernel, clock) = kernel_with_clock(test_config());
    let x = AgentContext::new("agent-x").with_swarm("s1");
    let y = AgentContext::new("agent-y").with_swarm("s1");
    let outsider = AgentContext::new("agent-z").with_swarm("s2");

    kernel
        .blackboard()
        .post_hint_with_ttl(&x, "queue/next", br#"{"priority":"high"}"#.to_vec(), 1_800)
        .unwrap();

    let hints = kernel.blackboard().read_hints("queue/*", &y).unwrap();
    assert_eq!(hints.len(), 1);
    assert_eq!(hints[0].key, "queue/next");
    assert_eq!(hints[0].author, "agent-x");
    assert_eq!(hints[0].value, br#"{"priority":"high"}"#);

    assert!(
        kernel
            .blackboard()
            .read_hints("queue/*", &outsider)
            .unwrap()
            .is_empty()
    );

    clock.advance_secs(1_799);
    assert_eq!(kernel.blackboard().read_hints("queue/*", &y).unwrap().len(), 1);

    clock.advance_secs(2);
    assert!(kernel.blackboard().read_hints("queue/*", &y).unwrap().is_empty());
}

// ============================================================================
// Testable properties
// ============================================================================

#[test]
fn ttl_boundary_holds_at_millisecond_precision() {
    let (kernel, clock) = kernel_with_clock(test_config());
    let agent = AgentContext::new("agent-1");
    let key = EntryKey::new("scratch", "boundary").unwrap();
    kernel
        .memory()
        .store(&key, b"v".to_vec(), StoreOptions::new(&agent).with_ttl(30))
        .unwrap();

    clock.advance_millis(30_000 - 1);
    assert!(kernel.memory().retrieve(&key, &agent).is_ok());

    clock.advance_millis(kernel.config().ttl_sweep_interval_ms + 2);
    let _ = kernel.run_maintenance();
    assert!(matches!(
        kernel.memory().retrieve(&key, &agent),
        Err(Error::NotFound { .. })
    ));
}

#[test]
fn zero_ttl_never_expires() {
    let (kernel, clock) = kernel_with_clock(test_config());
    let agent = AgentContext::new("agent-1");
    let key = EntryKey::new("scratch", "forever").unwrap();
    kernel
        .memory()
        .store(&key, b"v".to_vec(), StoreOptions::new(&agent).with_ttl(0))
        .unwrap();

    clock.advance_secs(10 * 365 * 24 * 3_600);
    assert_eq!(kernel.run_maintenance().entries_expired, 0);
    assert_eq!(kernel.memory().retrieve(&key, &agent).unwrap(), b"v");
}

#[test]
fn private_entry_denied_to_other_agents() {
    let (kernel, _clock) = kernel_with_clock(test_config());
    let a = AgentContext::new("agent-a").with_team("t").with_swarm("s");
    let b = AgentContext::new("agent-b").with_team("t").with_swarm("s");
    let key = EntryKey::new("secrets", "a/token").unwrap();
    kernel
        .memory()
        .store(
            &key,
            b"hunter2".to_vec(),
            StoreOptions::new(&a).with_access(AccessLevel::Private),
        )
        .unwrap();

    assert_eq!(kernel.memory().retrieve(&key, &a).unwrap(), b"hunter2");
    let err = kernel.memory().retrieve(&key, &b).unwrap_err();
    assert!(matches!(err, Error::AccessDenied { .. }));
    assert!(!err.is_retryable());

    let visible: Vec<_> = kernel
        .memory()
        .query("a/*", QueryOptions::in_namespace("secrets").as_agent(&b))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert!(visible.is_empty());
}

#[test]
fn groupless_owner_reads_and_deletes_own_entry() {
    let (kernel, _clock) = kernel_with_clock(test_config());
    let owner = AgentContext::new("agent-42");
    let key = EntryKey::new("agents", "agent/42/task").unwrap();
    for level in [AccessLevel::Team, AccessLevel::Swarm] {
        kernel
            .memory()
            .store(&key, b"done".to_vec(), StoreOptions::new(&owner).with_access(level))
            .unwrap();
        assert_eq!(kernel.memory().retrieve(&key, &owner).unwrap(), b"done");
        assert!(matches!(
            kernel.memory().retrieve(&key, &AgentContext::new("agent-7")),
            Err(Error::AccessDenied { .. })
        ));
        assert!(kernel.memory().delete(&key, &owner).unwrap());
    }
}

#[test]
fn system_entries_need_privilege() {
    let (kernel, _clock) = kernel_with_clock(test_config());
    let operator = AgentContext::new("operator").privileged();
    let worker = AgentContext::new("worker");
    let key = EntryKey::new("system", "limits").unwrap();
    kernel
        .memory()
        .store(
            &key,
            b"{}".to_vec(),
            StoreOptions::new(&operator).with_access(AccessLevel::System),
        )
        .unwrap();

    assert!(kernel.memory().retrieve(&key, &operator).is_ok());
    assert!(matches!(
        kernel.memory().retrieve(&key, &worker),
        Err(Error::AccessDenied { .. })
    ));
}

#[test]
fn delete_twice_is_not_an_error() {
    let (kernel, _clock) = kernel_with_clock(test_config());
    let agent = AgentContext::new("agent-1");
    let key = EntryKey::new("scratch", "gone").unwrap();
    kernel
        .memory()
        .store(&key, b"v".to_vec(), StoreOptions::new(&agent))
        .unwrap();

    assert!(kernel.memory().delete(&key, &agent).unwrap());
    assert!(!kernel.memory().delete(&key, &agent).unwrap());
    assert!(matches!(
        kernel.memory().retrieve(&key, &agent),
        Err(Error::NotFound { .. })
    ));

    let deleted = kernel
        .events()
        .recent(&EventFilter::new().with_type(EventType::EntryDeleted), 10)
        .unwrap();
    assert_eq!(deleted.len(), 1);
}

#[test]
fn optimistic_version_conflict() {
    let (kernel, _clock) = kernel_with_clock(test_config());
    let agent = AgentContext::new("agent-1");
    let key = EntryKey::new("scratch", "counter").unwrap();

    let created = kernel
        .memory()
        .store(&key, b"1".to_vec(), StoreOptions::new(&agent).expecting_version(0))
        .unwrap();
    assert_eq!(created.version, 1);

    let err = kernel
        .memory()
        .store(&key, b"2".to_vec(), StoreOptions::new(&agent).expecting_version(0))
        .unwrap_err();
    assert!(matches!(err, Error::Conflict { .. }));
    assert!(err.is_retryable());

    let updated = kernel
        .memory()
        .store(&key, b"2".to_vec(), StoreOptions::new(&agent).expecting_version(1))
        .unwrap();
    assert_eq!(updated.version, 2);
}

#[test]
fn pattern_self_match_is_top_result() {
    let (kernel, _clock) = kernel_with_clock(test_config());
    let mut ids = Vec::new();
    for i in 0..50u16 {
        let embedding: Vec<f32> = (0..8u16)
            .map(|d| (f32::from(i * 8 + d) * 0.731).sin())
            .collect();
        let id = kernel
            .patterns()
            .store(NewPattern::new("learner", embedding.clone()).with_tags(["probe"]))
            .unwrap();
        ids.push((id, embedding));
    }

    for (id, embedding) in ids.iter().step_by(7) {
        let hits = kernel.patterns().search(embedding, 5).unwrap();
        assert_eq!(&hits[0].pattern.id, id);
        assert!((hits[0].similarity - 1.0).abs() < 1e-4);
        assert!(hits.windows(2).all(|w| w[0].similarity >= w[1].similarity));
    }
}

#[test]
fn pattern_dimension_mismatch_is_schema_error() {
    let (kernel, _clock) = kernel_with_clock(test_config());
    let err = kernel
        .patterns()
        .store(NewPattern::new("learner", vec![1.0; 3]))
        .unwrap_err();
    assert!(matches!(err, Error::Schema { expected: 8, actual: 3 }));
    assert!(kernel.patterns().search(&[1.0; 8], 10).unwrap().is_empty());
}

#[test]
fn restart_recovers_patterns_and_proposals() {
    let dir = TempDir::new().unwrap();
    let (pattern, proposal) = {
        let (kernel, _clock) = kernel_with_clock(on_disk(&dir));
        let pattern = kernel
            .patterns()
            .store(NewPattern::new("learner", vec![0.5; 8]))
            .unwrap();
        let proposal = kernel
            .consensus()
            .propose("planner", b"scale-up".to_vec(), 3, 0)
            .unwrap();
        kernel.consensus().vote(&proposal, "a", true).unwrap();
        (pattern, proposal)
    };

    let (kernel, _clock) = kernel_with_clock(on_disk(&dir));
    assert_eq!(kernel.patterns().search(&[0.5; 8], 1).unwrap()[0].pattern.id, pattern);
    let status = kernel.consensus().get_status(&proposal).unwrap();
    assert_eq!(status.status, ProposalStatus::Pending);
    assert_eq!(status.approvals(), 1);
}
