//! In-process task repository.
//!
//! Tasks are kept JSON-encoded, the same shape a remote backend would hold,
//! so encode/decode problems surface here too. Faults can be queued to
//! exercise reconciliation against a misbehaving store.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use keel_id::TaskId;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use super::{StoreError, TaskRepository};
use crate::model::Task;

/// Fault applied to the next write (store or delete).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteFault {
    /// The write is rejected and not applied.
    Reject,
    /// The write is applied but reported as failed.
    LostAck,
    /// The write never completes.
    Hang,
}

#[derive(Debug, Default)]
struct Faults {
    writes: VecDeque<WriteFault>,
    failing_reads: usize,
}

/// Repository backed by a map of JSON documents.
#[derive(Debug, Default)]
pub struct InMemoryTaskRepository {
    tasks: RwLock<HashMap<TaskId, String>>,
    faults: Mutex<Faults>,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a fault for the next write.
    pub async fn fail_next_write(&self, fault: WriteFault) {
        self.faults.lock().await.writes.push_back(fault);
    }

    /// Fail the next `count` reads.
    pub async fn fail_next_reads(&self, count: usize) {
        self.faults.lock().await.failing_reads += count;
    }

    /// Overwrite an entry without going through fault injection.
    pub async fn put_raw(&self, task: &Task) -> Result<(), StoreError> {
        let encoded = encode(task)?;
        self.tasks.write().await.insert(task.id.clone(), encoded);
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }

    async fn next_write_fault(&self) -> Option<WriteFault> {
        self.faults.lock().await.writes.pop_front()
    }

    async fn read_fault(&self) -> Result<(), StoreError> {
        let mut faults = self.faults.lock().await;
        if faults.failing_reads > 0 {
            faults.failing_reads -= 1;
            return Err(StoreError::Unavailable("injected read failure".to_string()));
        }
        Ok(())
    }
}

fn encode(task: &Task) -> Result<String, StoreError> {
    serde_json::to_string(task).map_err(|e| StoreError::Encode {
        task_id: task.id.clone(),
        message: e.to_string(),
    })
}

fn decode(id: &TaskId, raw: &str) -> Result<Task, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Decode {
        task_id: id.clone(),
        message: e.to_string(),
    })
}

/// Resolve a queued fault around an apply step.
async fn with_fault<F>(fault: Option<WriteFault>, apply: F) -> Result<(), StoreError>
where
    F: std::future::Future<Output = Result<(), StoreError>>,
{
    match fault {
        None => apply.await,
        Some(WriteFault::Reject) => Err(StoreError::Unavailable("injected write rejection".to_string())),
        Some(WriteFault::LostAck) => {
            apply.await?;
            Err(StoreError::Unavailable("injected lost acknowledgement".to_string()))
        }
        Some(WriteFault::Hang) => std::future::pending().await,
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn get(&self, id: &TaskId) -> Result<Option<Task>, StoreError> {
        self.read_fault().await?;
        let tasks = self.tasks.read().await;
        tasks.get(id).map(|raw| decode(id, raw)).transpose()
    }

    async fn store(&self, task: &Task) -> Result<(), StoreError> {
        let fault = self.next_write_fault().await;
        let encoded = encode(task)?;
        with_fault(fault, async {
            self.tasks.write().await.insert(task.id.clone(), encoded);
            debug!(task_id = %task.id, "task stored");
            Ok(())
        })
        .await
    }

    async fn delete(&self, id: &TaskId) -> Result<(), StoreError> {
        let fault = self.next_write_fault().await;
        with_fault(fault, async {
            if self.tasks.write().await.remove(id).is_some() {
                debug!(task_id = %id, "task deleted");
            }
            Ok(())
        })
        .await
    }

    async fn all(&self) -> Result<Vec<Task>, StoreError> {
        self.read_fault().await?;
        let tasks = self.tasks.read().await;
        tasks.iter().map(|(id, raw)| decode(id, raw)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AgentInfo, Condition, TaskStatus};
    use chrono::Utc;
    use keel_id::{AgentId, InstanceId, RunSpecId};
    use std::collections::BTreeMap;

    fn task() -> Task {
        let now = Utc::now();
        Task {
            id: TaskId::for_instance(&RunSpecId::parse("/db").unwrap(), InstanceId::new()),
            agent: AgentInfo {
                agent_id: AgentId::new(),
                host: "agent-1".to_string(),
                attributes: BTreeMap::new(),
            },
            run_spec_version: now,
            status: TaskStatus::new(Condition::Running, now),
            host_ports: vec![31000],
            reservation: None,
            unreachable_strategy: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_store_get_delete() {
        let repo = InMemoryTaskRepository::new();
        let task = task();

        repo.store(&task).await.unwrap();
        assert_eq!(repo.get(&task.id).await.unwrap(), Some(task.clone()));
        assert_eq!(repo.all().await.unwrap().len(), 1);

        repo.delete(&task.id).await.unwrap();
        assert!(repo.get(&task.id).await.unwrap().is_none());
        // Missing entries delete fine.
        repo.delete(&task.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_write_is_not_applied() {
        let repo = InMemoryTaskRepository::new();
        let task = task();
        repo.fail_next_write(WriteFault::Reject).await;

        assert!(repo.store(&task).await.is_err());
        assert!(repo.is_empty().await);
        repo.store(&task).await.unwrap();
        assert_eq!(repo.len().await, 1);
    }

    #[tokio::test]
    async fn test_lost_ack_write_is_applied() {
        let repo = InMemoryTaskRepository::new();
        let task = task();
        repo.put_raw(&task).await.unwrap();
        repo.fail_next_write(WriteFault::LostAck).await;

        assert!(repo.delete(&task.id).await.is_err());
        assert!(repo.get(&task.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failing_reads() {
        let repo = InMemoryTaskRepository::new();
        repo.fail_next_reads(1).await;
        assert!(matches!(
            repo.all().await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(repo.all().await.unwrap().is_empty());
    }
}
