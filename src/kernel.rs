//! Kernel lifecycle: opens the database, wires components, and owns the
//! periodic maintenance and index rebuild tasks.

use crate::clock::{SharedClock, SystemClock};
use crate::config::KernelConfig;
use crate::coordination::{Blackboard, ConsensusGate};
use crate::events::{EventBus, EventLog};
use crate::memory::MemoryStore;
use crate::patterns::{PatternIndex, RebuildReport};
use crate::storage::Database;
use crate::{Error, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::instrument;

/// Outcome of one maintenance cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Expired memory entries deleted.
    pub entries_expired: usize,
    /// Tombstones purged after their grace period.
    pub tombstones_purged: usize,
    /// Events past retention deleted.
    pub events_swept: usize,
    /// Pending proposals moved to `expired`.
    pub proposals_expired: usize,
    /// Low-confidence patterns collected.
    pub patterns_collected: usize,
    /// Steps that failed; each is retried next cycle.
    pub failed_steps: Vec<&'static str>,
    /// Wall time of the cycle.
    pub duration_ms: u64,
}

impl MaintenanceReport {
    /// Returns `true` if every step succeeded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed_steps.is_empty()
    }

    /// Total rows removed or transitioned.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.entries_expired
            + self.tombstones_purged
            + self.events_swept
            + self.proposals_expired
            + self.patterns_collected
    }

    fn fail(&mut self, step: &'static str, error: &Error) {
        tracing::warn!(step, error = %error, "Maintenance step failed; retrying next cycle");
        metrics::counter!("kernel_maintenance_failures_total", "step" => step).increment(1);
        self.failed_steps.push(step);
    }
}

/// Components touched by maintenance, shared with the background task.
struct Maintenance {
    memory: Arc<MemoryStore>,
    events: Arc<EventLog>,
    consensus: Arc<ConsensusGate>,
    patterns: Arc<PatternIndex>,
    batch_limit: usize,
}

impl Maintenance {
    #[instrument(skip(self), fields(component = "kernel", operation = "maintenance"))]
    fn run(&self) -> MaintenanceReport {
        let start = Instant::now();
        let mut report = MaintenanceReport::default();

        match self.memory.sweep_expired(self.batch_limit) {
            Ok(summary) => {
                report.entries_expired = summary.expired;
                report.tombstones_purged = summary.tombstones_purged;
            },
            Err(e) => report.fail("memory_sweep", &e),
        }
        match self.events.sweep_expired(self.batch_limit) {
            Ok(swept) => report.events_swept = swept,
            Err(e) => report.fail("event_sweep", &e),
        }
        match self.consensus.expire_overdue(self.batch_limit) {
            Ok(expired) => report.proposals_expired = expired,
            Err(e) => report.fail("proposal_expiry", &e),
        }
        match self.patterns.collect_garbage(self.batch_limit) {
            Ok(collected) => report.patterns_collected = collected.len(),
            Err(e) => report.fail("pattern_gc", &e),
        }

        report.duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        metrics::counter!("kernel_maintenance_runs_total").increment(1);
        metrics::histogram!("kernel_maintenance_duration_ms")
            .record(start.elapsed().as_secs_f64() * 1000.0);
        if report.total() > 0 {
            tracing::info!(
                entries_expired = report.entries_expired,
                tombstones_purged = report.tombstones_purged,
                events_swept = report.events_swept,
                proposals_expired = report.proposals_expired,
                patterns_collected = report.patterns_collected,
                duration_ms = report.duration_ms,
                "Maintenance cycle completed"
            );
        }
        report
    }
}

/// The swarm kernel: one authoritative instance owning every component.
pub struct Kernel {
    config: KernelConfig,
    db: Arc<Database>,
    clock: SharedClock,
    events: Arc<EventLog>,
    memory: Arc<MemoryStore>,
    patterns: Arc<PatternIndex>,
    blackboard: Blackboard,
    consensus: Arc<ConsensusGate>,
    maintenance: Arc<Maintenance>,
}

impl Kernel {
    /// Opens a kernel using the system clock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for an invalid configuration and
    /// [`Error::Storage`] if the database cannot be opened.
    pub fn open(config: KernelConfig) -> Result<Self> {
        Self::open_with_clock(config, Arc::new(SystemClock))
    }

    /// Opens a kernel reading time from `clock`.
    ///
    /// Persisted patterns are loaded into the ANN index before returning. A
    /// failed load leaves the index stale for the background rebuild task.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for an invalid configuration and
    /// [`Error::Storage`] if the database cannot be opened.
    #[instrument(skip_all, fields(component = "kernel", operation = "open"))]
    pub fn open_with_clock(config: KernelConfig, clock: SharedClock) -> Result<Self> {
        config.validate()?;

        let db = Arc::new(match &config.storage_path {
            Some(path) => Database::open(path)?,
            None => Database::in_memory()?,
        });
        let events = Arc::new(EventLog::new(
            Arc::clone(&db),
            EventBus::new(config.event_bus_capacity),
            Arc::clone(&clock),
            config.event_ttl_seconds,
        ));
        let memory = Arc::new(MemoryStore::new(
            Arc::clone(&db),
            Arc::clone(&events),
            Arc::clone(&clock),
            config.tombstone_grace_seconds,
        ));
        let patterns = Arc::new(PatternIndex::new(
            Arc::clone(&db),
            Arc::clone(&events),
            Arc::clone(&clock),
            config.embedding_dimension,
            config.ann,
            config.patterns,
        )?);
        let blackboard = Blackboard::new(
            Arc::clone(&memory),
            config.hint_namespace.clone(),
            config.default_hint_ttl_seconds,
        )?;
        let consensus = Arc::new(ConsensusGate::new(
            Arc::clone(&db),
            Arc::clone(&events),
            Arc::clone(&clock),
            config.consensus.allow_veto,
        ));
        let maintenance = Arc::new(Maintenance {
            memory: Arc::clone(&memory),
            events: Arc::clone(&events),
            consensus: Arc::clone(&consensus),
            patterns: Arc::clone(&patterns),
            batch_limit: config.sweep_batch_limit,
        });

        if let Err(e) = patterns.rebuild() {
            tracing::warn!(error = %e, "Initial pattern index load failed; index left stale");
        }

        tracing::info!(
            path = ?config.storage_path,
            dimensions = config.embedding_dimension,
            ann = config.ann.kind.as_str(),
            "Kernel opened"
        );
        Ok(Self {
            config,
            db,
            clock,
            events,
            memory,
            patterns,
            blackboard,
            consensus,
            maintenance,
        })
    }

    /// Configuration the kernel was opened with.
    #[must_use]
    pub const fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Underlying database handle.
    #[must_use]
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Kernel clock.
    #[must_use]
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Key/value store.
    #[must_use]
    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    /// Event log and publish hook.
    #[must_use]
    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Pattern store and ANN index.
    #[must_use]
    pub fn patterns(&self) -> &PatternIndex {
        &self.patterns
    }

    /// Shared hint board.
    #[must_use]
    pub const fn blackboard(&self) -> &Blackboard {
        &self.blackboard
    }

    /// Quorum voting gate.
    #[must_use]
    pub fn consensus(&self) -> &ConsensusGate {
        &self.consensus
    }

    /// Runs one maintenance cycle on the calling thread.
    ///
    /// Sweeps expired entries and events, expires overdue proposals, and
    /// collects low-confidence patterns. A failing step is logged and
    /// reported; the remaining steps still run.
    #[must_use]
    pub fn run_maintenance(&self) -> MaintenanceReport {
        self.maintenance.run()
    }

    /// Rebuilds the pattern index if it is stale.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the staleness check or rebuild fails.
    pub fn rebuild_if_stale(&self) -> Result<Option<RebuildReport>> {
        rebuild_if_stale(&self.patterns)
    }

    /// Spawns the maintenance and index rebuild tasks on the current tokio
    /// runtime.
    ///
    /// Blocking store work runs on the blocking pool. The returned handle
    /// stops both tasks on [`BackgroundTasks::shutdown`] or drop.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] when called outside a tokio runtime.
    pub fn start_background(&self) -> Result<BackgroundTasks> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            Error::Validation("background tasks require a tokio runtime".to_string())
        })?;
        let (shutdown, signal) = watch::channel(false);

        let sweep_every = Duration::from_millis(self.config.ttl_sweep_interval_ms.max(1));
        let check_every =
            Duration::from_millis(self.config.patterns.rebuild_check_interval_ms.max(1));

        let maintenance = Arc::clone(&self.maintenance);
        let maintenance_task = runtime.spawn(every(sweep_every, signal.clone(), move || {
            let maintenance = Arc::clone(&maintenance);
            move || {
                maintenance.run();
            }
        }));

        let patterns = Arc::clone(&self.patterns);
        let rebuild_task = runtime.spawn(every(check_every, signal, move || {
            let patterns = Arc::clone(&patterns);
            move || {
                if let Err(e) = rebuild_if_stale(&patterns) {
                    tracing::warn!(error = %e, "Pattern index rebuild failed; retrying next cycle");
                }
            }
        }));

        tracing::debug!(
            sweep_interval_ms = self.config.ttl_sweep_interval_ms,
            rebuild_check_interval_ms = self.config.patterns.rebuild_check_interval_ms,
            "Background tasks started"
        );
        Ok(BackgroundTasks {
            shutdown,
            tasks: vec![maintenance_task, rebuild_task],
        })
    }
}

fn rebuild_if_stale(patterns: &PatternIndex) -> Result<Option<RebuildReport>> {
    if patterns.is_stale()? {
        patterns.rebuild().map(Some)
    } else {
        Ok(None)
    }
}

/// Runs the job produced by `make_job` on the blocking pool once per
/// `period`, skipping the immediate first tick, until `signal` flips.
async fn every<M, J>(period: Duration, mut signal: watch::Receiver<bool>, make_job: M)
where
    M: Fn() -> J + Send + 'static,
    J: FnOnce() + Send + 'static,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            changed = signal.changed() => {
                if changed.is_err() || *signal.borrow() {
                    break;
                }
            },
            _ = ticker.tick() => {
                if let Err(e) = tokio::task::spawn_blocking(make_job()).await {
                    tracing::error!(error = %e, "Background job aborted");
                }
            },
        }
    }
}

/// Handle to the kernel's background tasks.
///
/// Dropping the handle aborts the tasks; [`shutdown`](Self::shutdown) lets
/// an in-flight cycle finish first.
pub struct BackgroundTasks {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Whether any task is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(|task| !task.is_finished())
    }

    /// Signals the tasks to stop and waits for them.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::warn!(error = %e, "Background task ended abnormally");
                }
            }
        }
        tracing::debug!("Background tasks stopped");
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl std::fmt::Debug for BackgroundTasks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundTasks")
            .field("tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}
