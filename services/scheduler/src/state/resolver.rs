//! Task condition state machine.
//!
//! `resolve` is pure: it looks only at the op and the last known task and
//! never performs I/O. Rules, in precedence order:
//!
//! 1. `ForceExpunge` removes any existing task.
//! 2. A terminal task accepts nothing else.
//! 3. Per-op transitions; anything without semantic effect is `NoChange`.

use chrono::{DateTime, Utc};

use super::{StateChangeError, TaskStateChange, TaskStateOp};
use crate::model::{Condition, ReservationState, ResourceManagerStatus, Task};

pub fn resolve(op: &TaskStateOp, current: Option<&Task>) -> TaskStateChange {
    let task_id = op.task_id();

    if let TaskStateOp::ForceExpunge(_) = op {
        return match current {
            Some(task) => TaskStateChange::Expunge(task.clone()),
            None => TaskStateChange::NoChange(task_id.clone()),
        };
    }

    let Some(task) = current else {
        return match op {
            TaskStateOp::LaunchEphemeral(new) | TaskStateOp::Reserve(new) => {
                TaskStateChange::Update {
                    new: new.clone(),
                    old: None,
                }
            }
            _ => TaskStateChange::Failure(StateChangeError::UnknownTask {
                task_id: task_id.clone(),
                op: op.name(),
            }),
        };
    };

    let condition = task.condition();
    if condition.is_terminal() {
        return TaskStateChange::Failure(StateChangeError::TerminalTask {
            task_id: task_id.clone(),
            condition,
            op: op.name(),
        });
    }

    let invalid = || {
        TaskStateChange::Failure(StateChangeError::InvalidTransition {
            task_id: task_id.clone(),
            condition,
            op: op.name(),
        })
    };

    match op {
        TaskStateOp::LaunchEphemeral(_) => {
            TaskStateChange::Failure(StateChangeError::AlreadyExists {
                task_id: task_id.clone(),
            })
        }

        TaskStateOp::Reserve(_) if condition == Condition::Reserved => {
            TaskStateChange::NoChange(task_id.clone())
        }
        TaskStateOp::Reserve(_) => invalid(),

        TaskStateOp::LaunchOnReservation {
            run_spec_version,
            status,
            host_ports,
            ..
        } if condition == Condition::Reserved => {
            let mut new = task.clone();
            new.run_spec_version = *run_spec_version;
            new.status = status.clone();
            new.host_ports = host_ports.clone();
            if let Some(reservation) = new.reservation.as_mut() {
                reservation.state = ReservationState::Launched;
            }
            update(new, task)
        }
        TaskStateOp::LaunchOnReservation { .. } => invalid(),

        TaskStateOp::MesosUpdate { status, now, .. } => apply_status(task, status, *now),

        TaskStateOp::ReservationTimeout(_) if condition == Condition::Reserved => {
            TaskStateChange::Expunge(task.clone())
        }
        TaskStateOp::ReservationTimeout(_) => invalid(),

        TaskStateOp::MarkUnreachableInactive(_) if condition == Condition::Unreachable => {
            let mut new = task.clone();
            // `since` keeps the moment the task became unreachable so the
            // expunge deadline counts from there.
            new.status.condition = Condition::UnreachableInactive;
            update(new, task)
        }
        TaskStateOp::MarkUnreachableInactive(_) => TaskStateChange::NoChange(task_id.clone()),

        TaskStateOp::ForceExpunge(_) => TaskStateChange::Expunge(task.clone()),
    }
}

fn update(new: Task, old: &Task) -> TaskStateChange {
    TaskStateChange::Update {
        new,
        old: Some(old.clone()),
    }
}

fn apply_status(task: &Task, status: &ResourceManagerStatus, now: DateTime<Utc>) -> TaskStateChange {
    let current = task.condition();
    let next = status.state.condition();

    // A reservation waiting for a launch has no running task to update.
    if current == Condition::Reserved {
        return TaskStateChange::NoChange(task.id.clone());
    }
    if next == current && status.healthy == task.status.healthy() {
        return TaskStateChange::NoChange(task.id.clone());
    }
    if current == Condition::UnreachableInactive && next == Condition::Unreachable {
        return TaskStateChange::NoChange(task.id.clone());
    }

    let mut new = task.clone();
    new.status.resource_manager_status = Some(status.clone());

    if next.is_terminal() {
        if let Some(reservation) = new.reservation.as_mut() {
            // Volumes outlive the task; keep the reservation for a relaunch.
            reservation.state = ReservationState::Suspended { timeout: None };
            new.status.condition = Condition::Reserved;
            new.status.since = now;
            new.host_ports.clear();
            return update(new, task);
        }
        if next.is_lost() {
            return TaskStateChange::Expunge(task.clone());
        }
    }

    if next != current {
        new.status.condition = next;
        new.status.since = now;
    }
    if next == Condition::Running && new.status.started_at.is_none() {
        new.status.started_at = Some(now);
    }
    update(new, task)
}
