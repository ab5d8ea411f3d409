//! Kill path.
//!
//! Killing is a command to the resource manager. The resulting status
//! update flows back through the state op processor like any other.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use keel_id::{InstanceId, TaskId};
use thiserror::Error;
use tracing::{info, warn};

use crate::driver::{DriverError, ResourceManagerDriver};
use crate::model::Instance;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KillReason {
    /// Launch was not confirmed in time.
    Overdue,
    ReservationTimeout,
    ScaleDown,
    Unreachable,
}

impl fmt::Display for KillReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Overdue => "overdue",
            Self::ReservationTimeout => "reservation_timeout",
            Self::ScaleDown => "scale_down",
            Self::Unreachable => "unreachable",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum KillError {
    #[error("failed to kill task {task_id}: {source}")]
    Driver {
        task_id: TaskId,
        #[source]
        source: DriverError,
    },
}

#[async_trait]
pub trait KillService: Send + Sync {
    /// Request a kill of every live task of `instance`.
    async fn kill_instance(&self, instance: &Instance, reason: KillReason) -> Result<(), KillError>;
}

/// Kills tasks one by one through the resource manager driver.
pub struct DriverKillService {
    driver: Arc<dyn ResourceManagerDriver>,
}

impl DriverKillService {
    pub fn new(driver: Arc<dyn ResourceManagerDriver>) -> Self {
        Self { driver }
    }
}

#[async_trait]
impl KillService for DriverKillService {
    async fn kill_instance(&self, instance: &Instance, reason: KillReason) -> Result<(), KillError> {
        let instance_id: InstanceId = instance.id;
        let mut first_error = None;

        // Keep going on errors so one unreachable task does not shield the rest.
        for task in instance.tasks.values().filter(|t| !t.condition().is_terminal()) {
            info!(
                instance_id = %instance_id,
                task_id = %task.id,
                reason = %reason,
                "Killing task"
            );
            if let Err(e) = self.driver.kill_task(&task.id, &task.agent.agent_id).await {
                warn!(task_id = %task.id, error = %e, "Kill request failed");
                first_error.get_or_insert(KillError::Driver {
                    task_id: task.id.clone(),
                    source: e,
                });
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
