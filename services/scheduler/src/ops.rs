//! Operations handed to the resource manager, paired with the local state
//! change to apply when they are accepted.

use std::collections::BTreeMap;
use std::time::Duration;

use keel_id::{AgentId, IdError, RunSpecId, TaskId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{HealthCheckProtocol, Protocol, Resource};
use crate::state::TaskStateOp;

/// Errors building an instance operation. All of them indicate a bug in the caller.
#[derive(Debug, Error)]
pub enum InstanceOpError {
    #[error("resident run spec {run_spec_id} has more than one task per instance")]
    UnsupportedResidentPod { run_spec_id: RunSpecId },

    #[error("launch payload is for task {payload} but the state op is for task {state_op}")]
    TaskIdMismatch { payload: TaskId, state_op: TaskId },

    #[error("task group launches {payload} tasks but records {state_ops}")]
    TaskCountMismatch { payload: usize, state_ops: usize },

    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommandInfo {
    /// Shell command; `None` runs the image entrypoint.
    pub value: Option<String>,
    pub arguments: Vec<String>,
    pub uris: Vec<String>,
    pub environment: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub image: String,
}

/// Health check executed by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckInfo {
    pub protocol: HealthCheckProtocol,
    pub path: Option<String>,
    pub command: Option<String>,
    pub port: Option<u16>,
    pub grace_period: Duration,
    pub interval: Duration,
    pub timeout: Duration,
    pub max_consecutive_failures: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryPort {
    pub number: u16,
    pub name: Option<String>,
    pub protocol: Protocol,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DiscoveryInfo {
    pub name: String,
    pub ports: Vec<DiscoveryPort>,
}

/// Launch payload of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: TaskId,
    pub name: String,
    pub agent_id: AgentId,
    pub resources: Vec<Resource>,
    pub command: CommandInfo,
    pub container: Option<ContainerInfo>,
    pub health_check: Option<HealthCheckInfo>,
    pub discovery: DiscoveryInfo,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorInfo {
    pub executor_id: String,
    pub resources: Vec<Resource>,
}

/// Launch payload of a task group sharing one executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskGroupInfo {
    pub executor: ExecutorInfo,
    pub tasks: Vec<TaskInfo>,
}

/// Operation as sent to the resource manager when accepting an offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WireOperation {
    Launch { tasks: Vec<TaskInfo> },
    LaunchGroup { group: TaskGroupInfo },
    Reserve { resources: Vec<Resource> },
    CreateVolumes { volumes: Vec<Resource> },
}

/// What to do with an offer for one instance, and how to record it locally.
#[derive(Debug, Clone, PartialEq)]
pub enum InstanceOp {
    LaunchTask {
        task_info: TaskInfo,
        state_op: TaskStateOp,
    },
    LaunchTaskGroup {
        group: TaskGroupInfo,
        state_ops: Vec<TaskStateOp>,
    },
    /// Reserve resources, then create the volumes on them.
    ReserveAndCreateVolumes {
        /// Offer fragments as offered, before they were reserved.
        consumed: Vec<Resource>,
        reserve: Vec<Resource>,
        create: Vec<Resource>,
        state_op: TaskStateOp,
    },
}

impl InstanceOp {
    /// Launch of a single task; the payload must launch the task the state
    /// op records.
    pub fn launch_task(task_info: TaskInfo, state_op: TaskStateOp) -> Result<Self, InstanceOpError> {
        ensure_same_task(&task_info, &state_op)?;
        Ok(Self::LaunchTask {
            task_info,
            state_op,
        })
    }

    /// Launch of a task group; payload tasks and state ops pair up in order.
    pub fn launch_task_group(
        group: TaskGroupInfo,
        state_ops: Vec<TaskStateOp>,
    ) -> Result<Self, InstanceOpError> {
        if group.tasks.len() != state_ops.len() {
            return Err(InstanceOpError::TaskCountMismatch {
                payload: group.tasks.len(),
                state_ops: state_ops.len(),
            });
        }
        for (info, op) in group.tasks.iter().zip(&state_ops) {
            ensure_same_task(info, op)?;
        }
        Ok(Self::LaunchTaskGroup { group, state_ops })
    }

    pub fn wire_operations(&self) -> Vec<WireOperation> {
        match self {
            Self::LaunchTask { task_info, .. } => vec![WireOperation::Launch {
                tasks: vec![task_info.clone()],
            }],
            Self::LaunchTaskGroup { group, .. } => vec![WireOperation::LaunchGroup {
                group: group.clone(),
            }],
            Self::ReserveAndCreateVolumes {
                reserve, create, ..
            } => vec![
                WireOperation::Reserve {
                    resources: reserve.clone(),
                },
                WireOperation::CreateVolumes {
                    volumes: create.clone(),
                },
            ],
        }
    }

    pub fn state_ops(&self) -> Vec<&TaskStateOp> {
        match self {
            Self::LaunchTask { state_op, .. } | Self::ReserveAndCreateVolumes { state_op, .. } => {
                vec![state_op]
            }
            Self::LaunchTaskGroup { state_ops, .. } => state_ops.iter().collect(),
        }
    }

    /// Offer resources this operation uses up.
    pub fn consumed_resources(&self) -> Vec<Resource> {
        match self {
            Self::LaunchTask { task_info, .. } => task_info.resources.clone(),
            Self::LaunchTaskGroup { group, .. } => group
                .executor
                .resources
                .iter()
                .chain(group.tasks.iter().flat_map(|t| &t.resources))
                .cloned()
                .collect(),
            Self::ReserveAndCreateVolumes { consumed, .. } => consumed.clone(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::LaunchTask { .. } => "launch_task",
            Self::LaunchTaskGroup { .. } => "launch_task_group",
            Self::ReserveAndCreateVolumes { .. } => "reserve_and_create_volumes",
        }
    }
}

fn ensure_same_task(info: &TaskInfo, op: &TaskStateOp) -> Result<(), InstanceOpError> {
    if &info.task_id != op.task_id() {
        return Err(InstanceOpError::TaskIdMismatch {
            payload: info.task_id.clone(),
            state_op: op.task_id().clone(),
        });
    }
    Ok(())
}
