//! Instances and the tasks they own.
//!
//! Tasks are the persisted entities; an [`Instance`] is the placement unit
//! assembled from the tasks that share an instance ID.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use keel_id::{InstanceId, LocalVolumeId, RunSpecId, TaskId};
use serde::{Deserialize, Serialize};

use super::condition::Condition;
use super::offer::AgentInfo;
use super::run_spec::UnreachableStrategy;

/// Task state as reported by the resource manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Staging,
    Starting,
    Running,
    Killing,
    Finished,
    Failed,
    Killed,
    Error,
    Lost,
    Dropped,
    Unreachable,
    Gone,
    GoneByOperator,
    Unknown,
}

impl TaskState {
    pub fn condition(&self) -> Condition {
        match self {
            Self::Staging => Condition::Staging,
            Self::Starting => Condition::Starting,
            Self::Running => Condition::Running,
            Self::Killing => Condition::Killing,
            Self::Finished => Condition::Finished,
            Self::Failed => Condition::Failed,
            Self::Killed => Condition::Killed,
            Self::Error => Condition::Error,
            Self::Dropped => Condition::Dropped,
            Self::Lost | Self::Unreachable => Condition::Unreachable,
            Self::Gone | Self::GoneByOperator => Condition::Gone,
            Self::Unknown => Condition::Unknown,
        }
    }
}

/// Last status update received from the resource manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceManagerStatus {
    pub state: TaskState,
    pub healthy: Option<bool>,
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ResourceManagerStatus {
    pub fn new(state: TaskState, timestamp: DateTime<Utc>) -> Self {
        Self {
            state,
            healthy: None,
            message: None,
            timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub staged_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub condition: Condition,
    /// When `condition` was entered.
    pub since: DateTime<Utc>,
    pub resource_manager_status: Option<ResourceManagerStatus>,
}

impl TaskStatus {
    pub fn new(condition: Condition, now: DateTime<Utc>) -> Self {
        Self {
            staged_at: now,
            started_at: None,
            condition,
            since: now,
            resource_manager_status: None,
        }
    }

    pub fn healthy(&self) -> Option<bool> {
        self.resource_manager_status.as_ref().and_then(|s| s.healthy)
    }
}

/// Deadline after which an unused reservation is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationTimeout {
    pub initiated: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ReservationState {
    /// Resources reserved and volumes created, nothing launched yet.
    New { timeout: Option<ReservationTimeout> },
    /// A task is running on the reservation.
    Launched,
    /// The task on the reservation terminated; volumes are kept for relaunch.
    Suspended { timeout: Option<ReservationTimeout> },
}

impl ReservationState {
    pub fn timeout(&self) -> Option<&ReservationTimeout> {
        match self {
            Self::New { timeout } | Self::Suspended { timeout } => timeout.as_ref(),
            Self::Launched => None,
        }
    }
}

/// Resources and volumes held on an agent for a resident task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub volume_ids: Vec<LocalVolumeId>,
    pub state: ReservationState,
}

/// The individually tracked execution unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub agent: AgentInfo,
    pub run_spec_version: DateTime<Utc>,
    pub status: TaskStatus,
    pub host_ports: Vec<u16>,
    pub reservation: Option<Reservation>,
    /// Taken from the run spec at launch.
    #[serde(default)]
    pub unreachable_strategy: UnreachableStrategy,
}

impl Task {
    pub fn condition(&self) -> Condition {
        self.status.condition
    }

    pub fn instance_id(&self) -> InstanceId {
        self.id.instance_id()
    }

    pub fn run_spec_id(&self) -> &RunSpecId {
        self.id.run_spec_id()
    }

    pub fn is_resident(&self) -> bool {
        self.reservation.is_some()
    }

    /// Waiting on its reservation for a launch.
    pub fn is_reserved(&self) -> bool {
        self.condition() == Condition::Reserved
    }

    pub fn reservation_deadline(&self) -> Option<DateTime<Utc>> {
        self.reservation
            .as_ref()
            .and_then(|r| r.state.timeout())
            .map(|t| t.deadline)
    }

    pub fn volume_ids(&self) -> &[LocalVolumeId] {
        self.reservation
            .as_ref()
            .map(|r| r.volume_ids.as_slice())
            .unwrap_or_default()
    }
}

/// Condition of an instance derived from its tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceState {
    pub condition: Condition,
    pub since: DateTime<Utc>,
    pub healthy: Option<bool>,
}

/// The placement unit the scheduler tracks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub run_spec_id: RunSpecId,
    pub agent: AgentInfo,
    pub run_spec_version: DateTime<Utc>,
    pub state: InstanceState,
    pub tasks: BTreeMap<TaskId, Task>,
}

impl Instance {
    /// Assemble an instance from its tasks. Returns `None` when `tasks` is empty.
    pub fn from_tasks(tasks: impl IntoIterator<Item = Task>) -> Option<Self> {
        let tasks: BTreeMap<TaskId, Task> =
            tasks.into_iter().map(|t| (t.id.clone(), t)).collect();
        let first = tasks.values().next()?;

        Some(Self {
            id: first.instance_id(),
            run_spec_id: first.run_spec_id().clone(),
            agent: first.agent.clone(),
            run_spec_version: first.run_spec_version,
            state: aggregate_state(tasks.values())?,
            tasks,
        })
    }

    /// Copy with `task` inserted or replaced.
    #[must_use]
    pub fn with_task(&self, task: Task) -> Self {
        let mut tasks = self.tasks.clone();
        tasks.insert(task.id.clone(), task);
        Self::from_tasks(tasks.into_values()).unwrap_or_else(|| self.clone())
    }

    /// Copy without `task_id`; `None` once no task is left.
    pub fn without_task(&self, task_id: &TaskId) -> Option<Self> {
        let mut tasks = self.tasks.clone();
        tasks.remove(task_id);
        Self::from_tasks(tasks.into_values())
    }

    pub fn condition(&self) -> Condition {
        self.state.condition
    }

    /// Counts towards the desired instance count: Active, or Terminal but
    /// still tracked.
    pub fn is_placed(&self) -> bool {
        let condition = self.condition();
        condition.is_active() || condition.is_terminal()
    }

    pub fn task(&self, task_id: &TaskId) -> Option<&Task> {
        self.tasks.get(task_id)
    }
}

fn aggregate_state<'a>(tasks: impl Iterator<Item = &'a Task>) -> Option<InstanceState> {
    let tasks: Vec<&Task> = tasks.collect();
    let dominant = tasks
        .iter()
        .min_by_key(|t| t.condition().aggregation_rank())?;

    let healthy = tasks.iter().try_fold(true, |acc, t| t.status.healthy().map(|h| acc && h));

    Some(InstanceState {
        condition: dominant.condition(),
        since: dominant.status.since,
        healthy,
    })
}
