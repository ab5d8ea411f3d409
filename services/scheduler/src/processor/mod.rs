//! State op processor.
//!
//! Applies [`TaskStateOp`]s to the tracker and the task repository. Every op
//! for a task ID goes through the same sequential actor, so two ops on one
//! task never interleave. Per op:
//!
//! 1. resolve against the task the tracker currently holds
//! 2. notify the tracker; its acknowledgement gates the rest
//! 3. persist (`Update` stores, `Expunge` deletes) with a timeout
//! 4. on a failed write, reload and compare against the intended state
//!
//! Each request gets exactly one reply, including when the processor is
//! shutting down.

mod framework;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keel_id::TaskId;
use keel_reconcile::{with_timeout, ConvergenceStatus, Intent};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error, instrument, warn};

use crate::model::Task;
use crate::state::{resolve, StateChangeError, TaskStateChange, TaskStateOp};
use crate::store::{StoreError, TaskRepository};
use crate::tracker::InstanceTracker;

pub use framework::{Actor, ActorError, ActorHandle, Message, ShardedPool};

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Number of sequential workers; task IDs are spread over them by hash.
    pub shards: usize,
    pub mailbox_size: usize,
    /// Bound on every repository call, the reload included.
    pub store_timeout: Duration,
    /// Deadline given to ops submitted through [`StateOpProcessor::process`].
    pub op_deadline: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            shards: 8,
            mailbox_size: 256,
            store_timeout: keel_reconcile::DEFAULT_STORE_TIMEOUT,
            op_deadline: keel_reconcile::DEFAULT_OP_DEADLINE,
        }
    }
}

/// One queued state op and where to send its outcome.
#[derive(Debug)]
pub struct StateOpRequest {
    pub deadline: Instant,
    pub op: TaskStateOp,
    pub reply: oneshot::Sender<TaskStateChange>,
}

/// Anything that can take a state op and answer with its outcome.
#[async_trait]
pub trait StateOpSink: Send + Sync {
    async fn process(&self, op: TaskStateOp) -> TaskStateChange;
}

pub struct StateOpProcessor {
    pool: ShardedPool<StateOpRequest>,
    op_deadline: Duration,
}

impl StateOpProcessor {
    /// Spawn the worker shards. Must be called inside a tokio runtime.
    pub fn start(
        config: ProcessorConfig,
        tracker: Arc<dyn InstanceTracker>,
        repository: Arc<dyn TaskRepository>,
    ) -> Self {
        let store_timeout = config.store_timeout;
        let pool = ShardedPool::spawn(config.shards, config.mailbox_size, |index| StateOpActor {
            name: format!("state_op_{index}"),
            tracker: tracker.clone(),
            repository: repository.clone(),
            store_timeout,
        });
        Self {
            pool,
            op_deadline: config.op_deadline,
        }
    }

    /// Queue `op` with an explicit deadline and wait for its outcome.
    pub async fn process_with_deadline(&self, op: TaskStateOp, deadline: Instant) -> TaskStateChange {
        let (reply, rx) = oneshot::channel();
        let shard = self.pool.route(op.task_id());
        let task_id = op.task_id().clone();

        if let Err(e) = shard.send(StateOpRequest { deadline, op, reply }).await {
            warn!(task_id = %task_id, error = %e, "State op processor unavailable");
            return TaskStateChange::Failure(StateChangeError::Unavailable);
        }
        // A dropped sender means the worker stopped with the op still queued.
        rx.await
            .unwrap_or(TaskStateChange::Failure(StateChangeError::Unavailable))
    }

    /// Stop all workers. Ops still queued are answered with `Unavailable`.
    pub async fn shutdown(&self) {
        self.pool.stop_all(Duration::from_secs(10)).await;
    }
}

#[async_trait]
impl StateOpSink for StateOpProcessor {
    async fn process(&self, op: TaskStateOp) -> TaskStateChange {
        let deadline = Instant::now() + self.op_deadline;
        self.process_with_deadline(op, deadline).await
    }
}

struct StateOpActor {
    name: String,
    tracker: Arc<dyn InstanceTracker>,
    repository: Arc<dyn TaskRepository>,
    store_timeout: Duration,
}

#[async_trait]
impl Actor for StateOpActor {
    type Message = StateOpRequest;

    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&mut self, msg: StateOpRequest) {
        let StateOpRequest {
            deadline,
            op,
            reply,
        } = msg;
        let task_id = op.task_id().clone();

        let change = if Instant::now() > deadline {
            warn!(task_id = %task_id, op = op.name(), "State op deadline passed while queued");
            TaskStateChange::Failure(StateChangeError::DeadlineExceeded {
                task_id: task_id.clone(),
            })
        } else {
            self.apply(op).await
        };

        if reply.send(change).is_err() {
            debug!(task_id = %task_id, "Requester went away before the reply");
        }
    }
}

impl StateOpActor {
    #[instrument(skip(self, op), fields(task_id = %op.task_id(), op = op.name()))]
    async fn apply(&self, op: TaskStateOp) -> TaskStateChange {
        let task_id = op.task_id().clone();
        let current = self.tracker.task(&task_id).await;
        let change = resolve(&op, current.as_ref());
        debug!(change = change.kind(), "State op resolved");

        if let TaskStateChange::Failure(e) = &change {
            warn!(error = %e, "State op rejected");
        }

        if let Err(e) = self.tracker.notify(&change).await {
            error!(error = %e, "Tracker did not accept state change");
            return TaskStateChange::Failure(StateChangeError::Tracker {
                task_id,
                message: e.to_string(),
            });
        }

        let (intent, written) = match &change {
            TaskStateChange::Update { new, .. } => (
                Intent::Present(new.clone()),
                self.bounded(&task_id, self.repository.store(new)).await,
            ),
            TaskStateChange::Expunge(old) => (
                Intent::Absent,
                self.bounded(&task_id, self.repository.delete(&old.id)).await,
            ),
            TaskStateChange::NoChange(_) | TaskStateChange::Failure(_) => return change,
        };

        match written {
            Ok(()) => change,
            Err(write) => self.verify(task_id, change, intent, write).await,
        }
    }

    /// Decide the outcome of a failed write by reloading the task.
    async fn verify(
        &self,
        task_id: TaskId,
        change: TaskStateChange,
        intent: Intent<Task>,
        write: StoreError,
    ) -> TaskStateChange {
        warn!(error = %write, "Failed to persist state change, reloading task");
        let reloaded = self.bounded(&task_id, self.repository.get(&task_id)).await;

        match intent.check_reload(&reloaded) {
            ConvergenceStatus::Converged => {
                warn!(
                    error = %write,
                    "Store already holds the intended state despite the write error"
                );
                change
            }
            ConvergenceStatus::Unknown => {
                let reload = match reloaded {
                    Err(e) => e,
                    Ok(_) => StoreError::Unavailable("reload outcome unknown".to_string()),
                };
                warn!(error = %reload, "Failed to reload task after write error");
                TaskStateChange::Failure(StateChangeError::Unverified {
                    task_id,
                    write,
                    reload,
                })
            }
            ConvergenceStatus::Diverged => {
                let believed = change.new_task().cloned();
                let correction = match reloaded {
                    Ok(Some(stored)) => Some(TaskStateChange::Update {
                        new: stored,
                        old: believed,
                    }),
                    Ok(None) => believed.map(TaskStateChange::Expunge),
                    Err(_) => None,
                };
                if let Some(correction) = correction {
                    warn!(
                        correction = correction.kind(),
                        "Store diverged from intended state, resetting tracker to stored state"
                    );
                    if let Err(e) = self.tracker.notify(&correction).await {
                        error!(error = %e, "Failed to reset tracker to stored state");
                    }
                }
                TaskStateChange::Failure(StateChangeError::Persist {
                    task_id,
                    source: write,
                })
            }
        }
    }

    async fn bounded<T, F>(&self, task_id: &TaskId, call: F) -> Result<T, StoreError>
    where
        F: std::future::Future<Output = Result<T, StoreError>>,
    {
        with_timeout(self.store_timeout, format!("task {task_id}"), call)
            .await
            .map_err(StoreError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AgentInfo, Condition, ResourceManagerStatus, TaskState, TaskStatus};
    use crate::store::{InMemoryTaskRepository, WriteFault};
    use crate::tracker::InMemoryInstanceTracker;
    use chrono::Utc;
    use keel_id::{AgentId, InstanceId, RunSpecId};
    use std::collections::BTreeMap;

    struct Fixture {
        tracker: Arc<InMemoryInstanceTracker>,
        repo: Arc<InMemoryTaskRepository>,
        processor: StateOpProcessor,
    }

    fn fixture() -> Fixture {
        let tracker = Arc::new(InMemoryInstanceTracker::new());
        let repo = Arc::new(InMemoryTaskRepository::new());
        let config = ProcessorConfig {
            shards: 2,
            store_timeout: Duration::from_millis(200),
            ..ProcessorConfig::default()
        };
        let processor = StateOpProcessor::start(config, tracker.clone(), repo.clone());
        Fixture {
            tracker,
            repo,
            processor,
        }
    }

    fn task(condition: Condition) -> Task {
        let now = Utc::now();
        Task {
            id: TaskId::for_instance(&RunSpecId::parse("/web").unwrap(), InstanceId::new()),
            agent: AgentInfo {
                agent_id: AgentId::new(),
                host: "agent-1".to_string(),
                attributes: BTreeMap::new(),
            },
            run_spec_version: now,
            status: TaskStatus::new(condition, now),
            host_ports: vec![],
            reservation: None,
            unreachable_strategy: Default::default(),
        }
    }

    fn running_update(task: &Task) -> TaskStateOp {
        TaskStateOp::MesosUpdate {
            task_id: task.id.clone(),
            status: ResourceManagerStatus::new(TaskState::Running, Utc::now()),
            now: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_launch_is_tracked_and_persisted() {
        let f = fixture();
        let t = task(Condition::Created);

        let change = f.processor.process(TaskStateOp::LaunchEphemeral(t.clone())).await;
        assert!(matches!(change, TaskStateChange::Update { .. }));
        assert_eq!(f.tracker.task(&t.id).await, Some(t.clone()));
        assert_eq!(f.repo.get(&t.id).await.unwrap(), Some(t.clone()));

        let change = f.processor.process(running_update(&t)).await;
        let new = change.new_task().unwrap();
        assert_eq!(new.condition(), Condition::Running);
        assert_eq!(f.repo.get(&t.id).await.unwrap().as_ref(), Some(new));
    }

    #[tokio::test]
    async fn test_expunge_converges_despite_lost_ack() {
        let f = fixture();
        let t = task(Condition::Failed);
        f.repo.put_raw(&t).await.unwrap();
        f.tracker
            .notify(&TaskStateChange::Update {
                new: t.clone(),
                old: None,
            })
            .await
            .unwrap();

        f.repo.fail_next_write(WriteFault::LostAck).await;
        let change = f.processor.process(TaskStateOp::ForceExpunge(t.id.clone())).await;
        assert_eq!(change, TaskStateChange::Expunge(t.clone()));
        assert!(f.tracker.task(&t.id).await.is_none());
    }

    #[tokio::test]
    async fn test_rejected_write_diverges_and_resets_tracker() {
        let f = fixture();
        let t = task(Condition::Created);
        f.repo.fail_next_write(WriteFault::Reject).await;

        let change = f.processor.process(TaskStateOp::LaunchEphemeral(t.clone())).await;
        assert!(matches!(
            change,
            TaskStateChange::Failure(StateChangeError::Persist { .. })
        ));
        // Nothing was stored, so the tracker must not keep the task either.
        assert!(f.tracker.task(&t.id).await.is_none());
    }

    #[tokio::test]
    async fn test_failed_reload_wraps_write_error() {
        let f = fixture();
        let t = task(Condition::Created);
        f.repo.fail_next_write(WriteFault::Reject).await;
        f.repo.fail_next_reads(1).await;

        let change = f.processor.process(TaskStateOp::LaunchEphemeral(t.clone())).await;
        let TaskStateChange::Failure(StateChangeError::Unverified { write, reload, .. }) = change
        else {
            panic!("expected unverified failure, got {change:?}");
        };
        assert!(matches!(write, StoreError::Unavailable(_)));
        assert!(matches!(reload, StoreError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_hanging_write_times_out() {
        let f = fixture();
        let t = task(Condition::Created);
        f.repo.fail_next_write(WriteFault::Hang).await;

        let change = f.processor.process(TaskStateOp::LaunchEphemeral(t.clone())).await;
        assert!(matches!(
            change,
            TaskStateChange::Failure(StateChangeError::Persist {
                source: StoreError::Timeout(_),
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_rejected_op_gets_failure_without_io() {
        let f = fixture();
        let t = task(Condition::Running);
        let change = f.processor.process(running_update(&t)).await;
        assert!(matches!(
            change,
            TaskStateChange::Failure(StateChangeError::UnknownTask { .. })
        ));
        assert!(f.repo.is_empty().await);
    }

    #[tokio::test]
    async fn test_expired_deadline_is_rejected() {
        let f = fixture();
        let t = task(Condition::Created);
        let past = Instant::now() - Duration::from_millis(1);
        let change = f
            .processor
            .process_with_deadline(TaskStateOp::LaunchEphemeral(t.clone()), past)
            .await;
        assert!(matches!(
            change,
            TaskStateChange::Failure(StateChangeError::DeadlineExceeded { .. })
        ));
        assert!(f.tracker.task(&t.id).await.is_none());
    }

    #[tokio::test]
    async fn test_stopped_processor_replies_unavailable() {
        let f = fixture();
        f.processor.shutdown().await;
        let change = f
            .processor
            .process(TaskStateOp::LaunchEphemeral(task(Condition::Created)))
            .await;
        assert_eq!(change, TaskStateChange::Failure(StateChangeError::Unavailable));
    }

    #[tokio::test]
    async fn test_concurrent_ops_on_one_task_are_ordered() {
        let f = Arc::new(fixture());
        let t = task(Condition::Created);
        f.processor.process(TaskStateOp::LaunchEphemeral(t.clone())).await;

        let mut handles = Vec::new();
        for state in [TaskState::Starting, TaskState::Running, TaskState::Killing] {
            let f = f.clone();
            let id = t.id.clone();
            handles.push(tokio::spawn(async move {
                f.processor
                    .process(TaskStateOp::MesosUpdate {
                        task_id: id,
                        status: ResourceManagerStatus::new(state, Utc::now()),
                        now: Utc::now(),
                    })
                    .await
            }));
        }
        for handle in handles {
            assert!(!handle.await.unwrap().is_failure());
        }
        // Whatever order they ran in, tracker and store agree.
        assert_eq!(
            f.tracker.task(&t.id).await,
            f.repo.get(&t.id).await.unwrap()
        );
    }
}
