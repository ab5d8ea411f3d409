//! In-memory view of every known instance.
//!
//! The tracker is the source of "currently known instances" for offer
//! matching and the monitor. It only changes through [`InstanceTracker::notify`],
//! which the state op processor calls once per resolved change.

use std::collections::HashMap;

use async_trait::async_trait;
use keel_id::{InstanceId, RunSpecId, TaskId};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::model::{Instance, Task};
use crate::state::TaskStateChange;
use crate::store::{StoreError, TaskRepository};

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("failed to load tasks: {0}")]
    Load(#[from] StoreError),

    #[error("change of task {task_id} rejected: {message}")]
    Rejected { task_id: TaskId, message: String },
}

#[async_trait]
pub trait InstanceTracker: Send + Sync {
    /// Instances of one run spec.
    async fn known_instances(&self, run_spec_id: &RunSpecId) -> Vec<Instance>;

    async fn task(&self, task_id: &TaskId) -> Option<Task>;

    /// Every known instance.
    async fn snapshot(&self) -> Vec<Instance>;

    /// Apply a resolved change. `NoChange` and `Failure` leave the view as is.
    async fn notify(&self, change: &TaskStateChange) -> Result<(), TrackerError>;
}

/// Tracker holding all instances in a map guarded by one lock.
///
/// Writers hold the lock only for the map update itself; readers get
/// owned copies and never hold it across an await.
#[derive(Debug, Default)]
pub struct InMemoryInstanceTracker {
    instances: RwLock<HashMap<InstanceId, Instance>>,
}

impl InMemoryInstanceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the tracker from every task in `repository`.
    pub async fn load(repository: &dyn TaskRepository) -> Result<Self, TrackerError> {
        let tasks = repository.all().await?;
        let task_count = tasks.len();

        let mut grouped: HashMap<InstanceId, Vec<Task>> = HashMap::new();
        for task in tasks {
            grouped.entry(task.instance_id()).or_default().push(task);
        }
        let instances: HashMap<InstanceId, Instance> = grouped
            .into_iter()
            .filter_map(|(id, tasks)| Instance::from_tasks(tasks).map(|i| (id, i)))
            .collect();

        info!(
            tasks = task_count,
            instances = instances.len(),
            "Loaded instance tracker from repository"
        );
        Ok(Self {
            instances: RwLock::new(instances),
        })
    }

    pub async fn instance_count(&self) -> usize {
        self.instances.read().await.len()
    }
}

#[async_trait]
impl InstanceTracker for InMemoryInstanceTracker {
    async fn known_instances(&self, run_spec_id: &RunSpecId) -> Vec<Instance> {
        let instances = self.instances.read().await;
        instances
            .values()
            .filter(|i| &i.run_spec_id == run_spec_id)
            .cloned()
            .collect()
    }

    async fn task(&self, task_id: &TaskId) -> Option<Task> {
        let instances = self.instances.read().await;
        instances
            .get(&task_id.instance_id())
            .and_then(|i| i.task(task_id))
            .cloned()
    }

    async fn snapshot(&self) -> Vec<Instance> {
        self.instances.read().await.values().cloned().collect()
    }

    async fn notify(&self, change: &TaskStateChange) -> Result<(), TrackerError> {
        match change {
            TaskStateChange::Update { new, .. } => {
                let instance_id = new.instance_id();
                let mut instances = self.instances.write().await;
                let updated = match instances.get(&instance_id) {
                    Some(existing) => {
                        if existing.run_spec_id != *new.run_spec_id() {
                            return Err(TrackerError::Rejected {
                                task_id: new.id.clone(),
                                message: format!(
                                    "instance {instance_id} belongs to {}",
                                    existing.run_spec_id
                                ),
                            });
                        }
                        existing.with_task(new.clone())
                    }
                    None => Instance::from_tasks([new.clone()]).ok_or_else(|| {
                        TrackerError::Rejected {
                            task_id: new.id.clone(),
                            message: "could not build instance".to_string(),
                        }
                    })?,
                };
                debug!(task_id = %new.id, condition = %new.condition(), "Tracker updated");
                instances.insert(instance_id, updated);
            }
            TaskStateChange::Expunge(task) => {
                let instance_id = task.instance_id();
                let mut instances = self.instances.write().await;
                match instances.get(&instance_id).map(|i| i.without_task(&task.id)) {
                    Some(Some(remaining)) => {
                        instances.insert(instance_id, remaining);
                    }
                    Some(None) => {
                        instances.remove(&instance_id);
                    }
                    None => warn!(task_id = %task.id, "Expunged task was not tracked"),
                }
                debug!(task_id = %task.id, "Task expunged from tracker");
            }
            TaskStateChange::NoChange(_) | TaskStateChange::Failure(_) => {}
        }
        Ok(())
    }
}
