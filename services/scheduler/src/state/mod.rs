//! Requested task transitions and their resolved outcomes.

mod resolver;

use chrono::{DateTime, Utc};
use keel_id::TaskId;
use thiserror::Error;

use crate::model::{Condition, ResourceManagerStatus, Task, TaskStatus};
use crate::store::StoreError;

pub use resolver::resolve;

/// A requested transition, not yet applied.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskStateOp {
    /// Record a freshly launched ephemeral task.
    LaunchEphemeral(Task),
    /// Record a task that holds a new reservation.
    Reserve(Task),
    /// Launch a task on its existing reservation.
    LaunchOnReservation {
        task_id: TaskId,
        run_spec_version: DateTime<Utc>,
        status: TaskStatus,
        host_ports: Vec<u16>,
    },
    /// Apply a status update from the resource manager.
    MesosUpdate {
        task_id: TaskId,
        status: ResourceManagerStatus,
        now: DateTime<Utc>,
    },
    /// Release a reservation nothing was launched on in time.
    ReservationTimeout(TaskId),
    /// Remove the task whatever its state.
    ForceExpunge(TaskId),
    /// Stop counting an unreachable task as placed.
    MarkUnreachableInactive(TaskId),
}

impl TaskStateOp {
    pub fn task_id(&self) -> &TaskId {
        match self {
            Self::LaunchEphemeral(task) | Self::Reserve(task) => &task.id,
            Self::LaunchOnReservation { task_id, .. }
            | Self::MesosUpdate { task_id, .. }
            | Self::ReservationTimeout(task_id)
            | Self::ForceExpunge(task_id)
            | Self::MarkUnreachableInactive(task_id) => task_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::LaunchEphemeral(_) => "launch_ephemeral",
            Self::Reserve(_) => "reserve",
            Self::LaunchOnReservation { .. } => "launch_on_reservation",
            Self::MesosUpdate { .. } => "mesos_update",
            Self::ReservationTimeout(_) => "reservation_timeout",
            Self::ForceExpunge(_) => "force_expunge",
            Self::MarkUnreachableInactive(_) => "mark_unreachable_inactive",
        }
    }
}

/// Why a state op could not be applied.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateChangeError {
    #[error("task {task_id} is unknown, cannot apply {op}")]
    UnknownTask { task_id: TaskId, op: &'static str },

    #[error("task {task_id} is terminal ({condition}), cannot apply {op}")]
    TerminalTask {
        task_id: TaskId,
        condition: Condition,
        op: &'static str,
    },

    #[error("task {task_id} already exists")]
    AlreadyExists { task_id: TaskId },

    #[error("cannot apply {op} to task {task_id} in condition {condition}")]
    InvalidTransition {
        task_id: TaskId,
        condition: Condition,
        op: &'static str,
    },

    #[error("tracker rejected change of task {task_id}: {message}")]
    Tracker { task_id: TaskId, message: String },

    #[error("failed to persist task {task_id}: {source}")]
    Persist { task_id: TaskId, source: StoreError },

    #[error("failed to persist task {task_id}: {write}; reload failed too: {reload}")]
    Unverified {
        task_id: TaskId,
        write: StoreError,
        reload: StoreError,
    },

    #[error("deadline passed before op on task {task_id} was processed")]
    DeadlineExceeded { task_id: TaskId },

    #[error("state op processor is not running")]
    Unavailable,
}

/// Resolved outcome of a [`TaskStateOp`].
#[derive(Debug, Clone, PartialEq)]
pub enum TaskStateChange {
    Update { new: Task, old: Option<Task> },
    Expunge(Task),
    NoChange(TaskId),
    Failure(StateChangeError),
}

impl TaskStateChange {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    /// The task as it is after this change, if it still exists.
    pub fn new_task(&self) -> Option<&Task> {
        match self {
            Self::Update { new, .. } => Some(new),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Update { .. } => "update",
            Self::Expunge(_) => "expunge",
            Self::NoChange(_) => "no_change",
            Self::Failure(_) => "failure",
        }
    }
}
