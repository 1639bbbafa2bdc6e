//! Background tasks and blackboard subscriptions on a tokio runtime.

// Integration tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;
use swarmkernel::{
    AccessLevel, AgentContext, EntryKey, Error, Kernel, KernelConfig, ManualClock, NewPattern,
    StoreOptions,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn fast_config() -> KernelConfig {
    let mut config = KernelConfig::default()
        .with_embedding_dimension(4)
        .with_sweep_interval_ms(25);
    config.patterns.rebuild_check_interval_ms = 25;
    config
}

async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_subscriber_receives_matching_hints() {
    let kernel = Kernel::open(fast_config()).unwrap();
    let poster = AgentContext::new("agent-x").with_swarm("s1");
    let (tx, mut rx) = mpsc::unbounded_channel();

    let subscription = kernel
        .blackboard()
        .subscribe("queue/*", move |notification| {
            let _ = tx.send(notification);
        })
        .unwrap();
    assert!(subscription.is_active());

    kernel
        .blackboard()
        .post_hint(&poster, "other/ignored", b"skip".to_vec())
        .unwrap();
    kernel
        .blackboard()
        .post_hint(&poster, "queue/next", br#"{"priority":"high"}"#.to_vec())
        .unwrap();

    let notification = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(notification.hint.key, "queue/next");
    assert_eq!(notification.hint.author, "agent-x");
    assert_eq!(notification.hint.value, br#"{"priority":"high"}"#);
    assert_eq!(notification.hint.version, 1);

    subscription.unsubscribe();
    kernel
        .blackboard()
        .post_hint(&poster, "queue/later", b"late".to_vec())
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_dropping_subscription_stops_delivery() {
    let kernel = Kernel::open(fast_config()).unwrap();
    let poster = AgentContext::new("agent-x").with_swarm("s1");
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    {
        let _subscription = kernel
            .blackboard()
            .subscribe("*", move |n| {
                let _ = tx.send(n.hint.key);
            })
            .unwrap();
    }

    kernel
        .blackboard()
        .post_hint(&poster, "anything", b"v".to_vec())
        .unwrap();
    // The sender lives in the aborted task, so the channel closes.
    assert!(timeout(WAIT, rx.recv()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_background_sweep_expires_entries() {
    let clock = ManualClock::new(1_700_000_000_000);
    let kernel = Kernel::open_with_clock(fast_config(), Arc::new(clock.clone())).unwrap();
    let agent = AgentContext::new("agent-42").with_team("build");
    let key = EntryKey::new("agents", "agent/42/task").unwrap();
    kernel
        .memory()
        .store(
            &key,
            br#"{"status":"done"}"#.to_vec(),
            StoreOptions::new(&agent)
                .with_ttl(60)
                .with_access(AccessLevel::Team),
        )
        .unwrap();

    let tasks = kernel.start_background().unwrap();
    clock.advance_secs(61);

    let swept = eventually(|| kernel.memory().stats().unwrap().expired_pending == 0).await;
    tasks.shutdown().await;

    assert!(swept);
    assert!(matches!(
        kernel.memory().retrieve(&key, &agent),
        Err(Error::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_background_rebuilds_stale_index() {
    let kernel = Kernel::open(fast_config()).unwrap();
    let id = kernel
        .patterns()
        .store(NewPattern::new("learner", vec![1.0, 0.0, 0.0, 0.0]))
        .unwrap();
    kernel.patterns().mark_stale();
    assert!(kernel.patterns().is_stale().unwrap());

    let tasks = kernel.start_background().unwrap();
    let rebuilt = eventually(|| !kernel.patterns().is_stale().unwrap()).await;
    tasks.shutdown().await;

    assert!(rebuilt);
    let hits = kernel.patterns().search(&[1.0, 0.0, 0.0, 0.0], 1).unwrap();
    assert_eq!(hits[0].pattern.id, id);
}

#[tokio::test]
async fn test_shutdown_is_prompt() {
    let mut config = fast_config();
    config.ttl_sweep_interval_ms = 3_600_000;
    config.patterns.rebuild_check_interval_ms = 3_600_000;
    let kernel = Kernel::open(config).unwrap();

    let tasks = kernel.start_background().unwrap();
    assert!(tasks.is_running());
    timeout(WAIT, tasks.shutdown()).await.unwrap();
}
