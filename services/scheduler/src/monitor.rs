//! Overdue and reservation monitor.
//!
//! Periodically scans every known instance and:
//!
//! - kills tasks whose launch was not confirmed in time
//! - releases reservations whose deadline has passed
//! - retires unreachable tasks once their unreachable strategy says so,
//!   except resident tasks, which keep their reservation and volumes
//! - expunges terminal tasks after a grace delay
//!
//! The monitor holds no state of its own between scans. Kills go to the
//! kill service; every state change goes through the state op processor.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use keel_id::InstanceId;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::kill::{KillReason, KillService};
use crate::model::{Condition, Instance, Task};
use crate::processor::StateOpSink;
use crate::state::{TaskStateChange, TaskStateOp};
use crate::tracker::InstanceTracker;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Bound on a launch the resource manager never acknowledged.
    pub unconfirmed_timeout: Duration,
    /// Bound on a task staying in `Staging`.
    pub launch_timeout: Duration,
    /// How long terminal tasks stay tracked before they are expunged.
    pub terminal_expunge_delay: Duration,
    pub initial_delay: Duration,
    pub interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            unconfirmed_timeout: Duration::from_secs(300),
            launch_timeout: Duration::from_secs(300),
            terminal_expunge_delay: Duration::ZERO,
            initial_delay: Duration::from_secs(30),
            interval: Duration::from_secs(5),
        }
    }
}

/// Counters of one scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub tasks_scanned: usize,
    pub overdue_killed: usize,
    pub reservations_timed_out: usize,
    pub marked_inactive: usize,
    pub expunged: usize,
    pub errors: usize,
}

pub struct OverdueMonitor {
    config: MonitorConfig,
    tracker: Arc<dyn InstanceTracker>,
    processor: Arc<dyn StateOpSink>,
    killer: Arc<dyn KillService>,
}

impl OverdueMonitor {
    pub fn new(
        config: MonitorConfig,
        tracker: Arc<dyn InstanceTracker>,
        processor: Arc<dyn StateOpSink>,
        killer: Arc<dyn KillService>,
    ) -> Self {
        Self {
            config,
            tracker,
            processor,
            killer,
        }
    }

    /// Run scans until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            initial_delay_secs = self.config.initial_delay.as_secs(),
            interval_secs = self.config.interval.as_secs(),
            "Starting overdue monitor"
        );

        let start = tokio::time::Instant::now() + self.config.initial_delay;
        // `interval_at` panics on a zero period.
        let period = self.config.interval.max(Duration::from_millis(1));
        let mut interval = tokio::time::interval_at(start, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let stats = self.scan_once(Utc::now()).await;
                    if stats.errors > 0 {
                        warn!(errors = stats.errors, "Overdue scan finished with errors");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Overdue monitor shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Run a single scan as of `now`.
    pub async fn scan_once(&self, now: DateTime<Utc>) -> ScanStats {
        let instances = self.tracker.snapshot().await;
        let mut stats = ScanStats::default();
        let mut overdue: BTreeMap<InstanceId, &Instance> = BTreeMap::new();

        for instance in &instances {
            for task in instance.tasks.values() {
                stats.tasks_scanned += 1;
                if self.is_overdue(task, now) {
                    overdue.insert(instance.id, instance);
                    continue;
                }
                if let Some(op) = self.housekeeping_op(task, now) {
                    self.apply(op, &mut stats).await;
                }
            }
        }

        for (instance_id, instance) in overdue {
            info!(instance_id = %instance_id, "Killing overdue instance");
            match self.killer.kill_instance(instance, KillReason::Overdue).await {
                Ok(()) => stats.overdue_killed += 1,
                Err(e) => {
                    stats.errors += 1;
                    error!(instance_id = %instance_id, error = %e, "Failed to kill overdue instance");
                }
            }
        }

        if stats != ScanStats::default() {
            debug!(
                tasks = stats.tasks_scanned,
                overdue_killed = stats.overdue_killed,
                reservations_timed_out = stats.reservations_timed_out,
                marked_inactive = stats.marked_inactive,
                expunged = stats.expunged,
                errors = stats.errors,
                "Overdue scan complete"
            );
        }
        stats
    }

    fn is_overdue(&self, task: &Task, now: DateTime<Utc>) -> bool {
        let waited = elapsed(task.status.staged_at, now);
        match task.condition() {
            // Launched but never acknowledged by the resource manager.
            Condition::Created => waited > self.config.unconfirmed_timeout,
            Condition::Staging => waited > self.config.launch_timeout,
            _ => false,
        }
    }

    /// State op the task is due for, if any.
    fn housekeeping_op(&self, task: &Task, now: DateTime<Utc>) -> Option<TaskStateOp> {
        let since = elapsed(task.status.since, now);
        let condition = task.condition();

        if condition == Condition::Reserved {
            return task
                .reservation_deadline()
                .filter(|deadline| *deadline <= now)
                .map(|_| TaskStateOp::ReservationTimeout(task.id.clone()));
        }
        if condition.is_terminal() {
            return (since >= self.config.terminal_expunge_delay)
                .then(|| TaskStateOp::ForceExpunge(task.id.clone()));
        }

        // Resident tasks wait for their agent to come back.
        if task.is_resident() {
            return None;
        }
        let strategy = &task.unreachable_strategy;
        match condition {
            Condition::Unreachable if since >= strategy.inactive_after => {
                Some(TaskStateOp::MarkUnreachableInactive(task.id.clone()))
            }
            Condition::UnreachableInactive if since >= strategy.expunge_after => {
                Some(TaskStateOp::ForceExpunge(task.id.clone()))
            }
            _ => None,
        }
    }

    async fn apply(&self, op: TaskStateOp, stats: &mut ScanStats) {
        let task_id = op.task_id().clone();
        let name = op.name();
        let is_timeout = matches!(op, TaskStateOp::ReservationTimeout(_));

        match self.processor.process(op).await {
            TaskStateChange::Failure(e) => {
                stats.errors += 1;
                warn!(task_id = %task_id, op = name, error = %e, "Monitor state op failed");
            }
            TaskStateChange::NoChange(_) => {}
            TaskStateChange::Expunge(_) if is_timeout => {
                info!(task_id = %task_id, "Reservation timed out, released");
                stats.reservations_timed_out += 1;
            }
            TaskStateChange::Expunge(_) => {
                info!(task_id = %task_id, "Task expunged");
                stats.expunged += 1;
            }
            TaskStateChange::Update { .. } => {
                info!(task_id = %task_id, "Unreachable task marked inactive");
                stats.marked_inactive += 1;
            }
        }
    }
}

/// Time from `from` to `now`, zero if `from` is in the future.
fn elapsed(from: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - from).to_std().unwrap_or_default()
}
