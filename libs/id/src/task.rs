//! Identifiers derived from a run spec: tasks and local volumes.

use uuid::Uuid;

use crate::run_spec::validate_segment;
use crate::{string_serde, IdError, InstanceId, RunSpecId};

/// Identifier of a single tracked task.
///
/// Format: `{run_spec_safe_path}.{instance_id}` for single-task instances and
/// `{run_spec_safe_path}.{instance_id}.{container}` for task groups.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId {
    run_spec_id: RunSpecId,
    instance_id: InstanceId,
    container: Option<String>,
}

impl TaskId {
    /// Task ID of the only task of an instance.
    #[must_use]
    pub fn for_instance(run_spec_id: &RunSpecId, instance_id: InstanceId) -> Self {
        Self {
            run_spec_id: run_spec_id.clone(),
            instance_id,
            container: None,
        }
    }

    /// Task ID of one container of a task group.
    pub fn for_container(
        run_spec_id: &RunSpecId,
        instance_id: InstanceId,
        container: &str,
    ) -> Result<Self, IdError> {
        validate_segment(container)?;
        Ok(Self {
            run_spec_id: run_spec_id.clone(),
            instance_id,
            container: Some(container.to_string()),
        })
    }

    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        let mut parts = s.split('.');
        let safe = parts.next().unwrap_or_default();
        let Some(instance) = parts.next() else {
            return Err(IdError::MissingSeparator('.'));
        };
        let container = parts.next();
        if parts.next().is_some() {
            return Err(IdError::format(format!("task id '{s}' has too many parts")));
        }

        let run_spec_id = RunSpecId::from_safe_path(safe)?;
        let instance_id = InstanceId::parse(instance)?;
        match container {
            Some(name) => Self::for_container(&run_spec_id, instance_id, name),
            None => Ok(Self::for_instance(&run_spec_id, instance_id)),
        }
    }

    pub fn run_spec_id(&self) -> &RunSpecId {
        &self.run_spec_id
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn container(&self) -> Option<&str> {
        self.container.as_deref()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.run_spec_id.safe_path(), self.instance_id)?;
        if let Some(container) = &self.container {
            write!(f, ".{container}")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for TaskId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

string_serde!(TaskId);

/// Identifier of a persistent volume created on an agent for a run spec.
///
/// Format: `{run_spec_safe_path}#{volume_name}#{uuid}`. The name is derived
/// from the volume's container path (`/var/data` → `var_data`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocalVolumeId {
    run_spec_id: RunSpecId,
    name: String,
    uuid: Uuid,
}

impl LocalVolumeId {
    /// Generates a fresh volume ID for the volume mounted at `container_path`.
    pub fn new(run_spec_id: &RunSpecId, container_path: &str) -> Result<Self, IdError> {
        let name = container_path.trim_matches('/').replace('/', "_");
        if name.is_empty() {
            return Err(IdError::format("volume container path is empty"));
        }
        if name.contains('#') {
            return Err(IdError::format(format!(
                "volume container path '{container_path}' contains '#'"
            )));
        }
        Ok(Self {
            run_spec_id: run_spec_id.clone(),
            name,
            uuid: Uuid::new_v4(),
        })
    }

    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        let parts: Vec<&str> = s.split('#').collect();
        let [safe, name, uuid] = parts.as_slice() else {
            return Err(IdError::format(format!(
                "volume id '{s}' must have three '#'-separated parts"
            )));
        };
        if name.is_empty() {
            return Err(IdError::format("volume name is empty"));
        }
        Ok(Self {
            run_spec_id: RunSpecId::from_safe_path(safe)?,
            name: (*name).to_string(),
            uuid: Uuid::parse_str(uuid).map_err(|e| IdError::InvalidUuid(e.to_string()))?,
        })
    }

    pub fn run_spec_id(&self) -> &RunSpecId {
        &self.run_spec_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Display for LocalVolumeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}#{}#{}",
            self.run_spec_id.safe_path(),
            self.name,
            self.uuid
        )
    }
}

impl std::str::FromStr for LocalVolumeId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

string_serde!(LocalVolumeId);
