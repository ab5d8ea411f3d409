//! Boundary to the resource manager.
//!
//! The scheduler never talks to the resource manager directly; it goes
//! through [`ResourceManagerDriver`]. [`MockDriver`] records every call and
//! is used by the binary and tests.

use async_trait::async_trait;
use keel_id::{AgentId, OfferId, TaskId};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

use crate::ops::WireOperation;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("not connected to the resource manager")]
    NotConnected,

    #[error("offer {0} was rescinded")]
    OfferRescinded(OfferId),

    #[error("resource manager call failed: {0}")]
    Call(String),
}

#[async_trait]
pub trait ResourceManagerDriver: Send + Sync {
    /// Accept an offer, running `operations` in order against it.
    async fn accept_offer(
        &self,
        offer_id: &OfferId,
        operations: Vec<WireOperation>,
    ) -> Result<(), DriverError>;

    async fn decline_offer(&self, offer_id: &OfferId) -> Result<(), DriverError>;

    async fn kill_task(&self, task_id: &TaskId, agent_id: &AgentId) -> Result<(), DriverError>;
}

/// Call recorded by [`MockDriver`].
#[derive(Debug, Clone, PartialEq)]
pub enum DriverCall {
    Accept {
        offer_id: OfferId,
        operations: Vec<WireOperation>,
    },
    Decline {
        offer_id: OfferId,
    },
    Kill {
        task_id: TaskId,
        agent_id: AgentId,
    },
}

#[derive(Debug, Default)]
pub struct MockDriver {
    calls: Mutex<Vec<DriverCall>>,
    /// Whether calls should "fail" after being recorded.
    fail_calls: bool,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock driver that fails all calls.
    pub fn failing() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_calls: true,
        }
    }

    pub async fn calls(&self) -> Vec<DriverCall> {
        self.calls.lock().await.clone()
    }

    /// Operations of every accept call, per offer.
    pub async fn accepted(&self) -> Vec<(OfferId, Vec<WireOperation>)> {
        self.calls
            .lock()
            .await
            .iter()
            .filter_map(|c| match c {
                DriverCall::Accept {
                    offer_id,
                    operations,
                } => Some((*offer_id, operations.clone())),
                _ => None,
            })
            .collect()
    }

    pub async fn declined(&self) -> Vec<OfferId> {
        self.calls
            .lock()
            .await
            .iter()
            .filter_map(|c| match c {
                DriverCall::Decline { offer_id } => Some(*offer_id),
                _ => None,
            })
            .collect()
    }

    pub async fn killed(&self) -> Vec<TaskId> {
        self.calls
            .lock()
            .await
            .iter()
            .filter_map(|c| match c {
                DriverCall::Kill { task_id, .. } => Some(task_id.clone()),
                _ => None,
            })
            .collect()
    }

    async fn record(&self, call: DriverCall) -> Result<(), DriverError> {
        self.calls.lock().await.push(call);
        if self.fail_calls {
            return Err(DriverError::Call("mock driver configured to fail".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceManagerDriver for MockDriver {
    async fn accept_offer(
        &self,
        offer_id: &OfferId,
        operations: Vec<WireOperation>,
    ) -> Result<(), DriverError> {
        info!(offer_id = %offer_id, operations = operations.len(), "[MOCK] Accepting offer");
        self.record(DriverCall::Accept {
            offer_id: *offer_id,
            operations,
        })
        .await
    }

    async fn decline_offer(&self, offer_id: &OfferId) -> Result<(), DriverError> {
        info!(offer_id = %offer_id, "[MOCK] Declining offer");
        self.record(DriverCall::Decline {
            offer_id: *offer_id,
        })
        .await
    }

    async fn kill_task(&self, task_id: &TaskId, agent_id: &AgentId) -> Result<(), DriverError> {
        info!(task_id = %task_id, agent_id = %agent_id, "[MOCK] Killing task");
        self.record(DriverCall::Kill {
            task_id: task_id.clone(),
            agent_id: *agent_id,
        })
        .await
    }
}
