//! Task persistence.
//!
//! The scheduler only needs get/store/delete by task ID plus a full scan at
//! startup. Backends implement [`TaskRepository`]; the in-memory backend is
//! used by the binary and by tests.

mod memory;

use async_trait::async_trait;
use keel_id::TaskId;
use thiserror::Error;

use crate::model::Task;

pub use memory::{InMemoryTaskRepository, WriteFault};

/// Errors from task repository operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store call timed out: {0}")]
    Timeout(String),

    #[error("failed to encode task {task_id}: {message}")]
    Encode { task_id: TaskId, message: String },

    #[error("failed to decode task {task_id}: {message}")]
    Decode { task_id: TaskId, message: String },
}

impl From<keel_reconcile::ReconcileError> for StoreError {
    fn from(err: keel_reconcile::ReconcileError) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else {
            Self::Unavailable(err.to_string())
        }
    }
}

/// Durable storage of tasks keyed by task ID.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn get(&self, id: &TaskId) -> Result<Option<Task>, StoreError>;

    /// Insert or overwrite.
    async fn store(&self, task: &Task) -> Result<(), StoreError>;

    /// Delete if present; deleting a missing task succeeds.
    async fn delete(&self, id: &TaskId) -> Result<(), StoreError>;

    async fn all(&self) -> Result<Vec<Task>, StoreError>;
}
