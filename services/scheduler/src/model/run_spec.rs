//! Declared workloads.
//!
//! A run spec is immutable per version. Changing any field produces a new
//! value with a new `version`; nothing here mutates a spec in place.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use keel_id::RunSpecId;
use serde::{Deserialize, Serialize};

use super::resources::{DiskType, UNRESERVED_ROLE};

/// Per-task scalar resource requirements.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub cpus: f64,
    pub mem: f64,
    pub disk: f64,
    pub gpus: f64,
}

impl ResourceRequirements {
    pub fn new(cpus: f64, mem: f64) -> Self {
        Self {
            cpus,
            mem,
            ..Self::default()
        }
    }
}

impl std::ops::Add for ResourceRequirements {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            cpus: self.cpus + other.cpus,
            mem: self.mem + other.mem,
            disk: self.disk + other.disk,
            gpus: self.gpus + other.gpus,
        }
    }
}

/// Resources reserved for the executor running a task group.
pub const POD_EXECUTOR_RESOURCES: ResourceRequirements = ResourceRequirements {
    cpus: 0.1,
    mem: 32.0,
    disk: 10.0,
    gpus: 0.0,
};

/// How a declared port is bound on the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostPort {
    /// This exact host port is required.
    Fixed(u16),
    /// Any free host port from the offer.
    Dynamic,
    /// No host port; the container assigns the port internally.
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

/// Declared port of an app, or endpoint of a pod container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDefinition {
    pub name: Option<String>,
    pub host_port: HostPort,
    pub container_port: Option<u16>,
    pub protocol: Protocol,
    pub labels: BTreeMap<String, String>,
}

impl PortDefinition {
    pub fn fixed(port: u16) -> Self {
        Self::with_host_port(HostPort::Fixed(port))
    }

    pub fn dynamic() -> Self {
        Self::with_host_port(HostPort::Dynamic)
    }

    fn with_host_port(host_port: HostPort) -> Self {
        Self {
            name: None,
            host_port,
            container_port: None,
            protocol: Protocol::Tcp,
            labels: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Persistent volume that must live on the agent across relaunches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistentVolume {
    pub container_path: String,
    pub size_mb: f64,
    pub disk_type: DiskType,
}

impl PersistentVolume {
    pub fn new(container_path: impl Into<String>, size_mb: f64) -> Self {
        Self {
            container_path: container_path.into(),
            size_mb,
            disk_type: DiskType::Root,
        }
    }
}

/// What to run for a single-task instance.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecutorSpec {
    pub command: Option<String>,
    pub args: Vec<String>,
    pub image: Option<String>,
    pub uris: Vec<String>,
}

/// One container of a task group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub resources: ResourceRequirements,
    pub endpoints: Vec<PortDefinition>,
    pub exec: ExecutorSpec,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthCheckProtocol {
    /// Checked by the scheduler side.
    Http,
    /// Checked by the scheduler side.
    Tcp,
    /// Executed on the agent.
    MesosHttp,
    /// Executed on the agent.
    MesosTcp,
    /// Executed on the agent.
    Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub protocol: HealthCheckProtocol,
    pub path: Option<String>,
    pub command: Option<String>,
    pub port_index: Option<usize>,
    pub grace_period: Duration,
    pub interval: Duration,
    pub timeout: Duration,
    pub max_consecutive_failures: u32,
}

impl HealthCheck {
    pub fn new(protocol: HealthCheckProtocol) -> Self {
        Self {
            protocol,
            path: None,
            command: None,
            port_index: None,
            grace_period: Duration::from_secs(300),
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(20),
            max_consecutive_failures: 3,
        }
    }

    /// Checks the agent executes and that therefore travel with the task.
    pub fn is_wire_level(&self) -> bool {
        matches!(
            self.protocol,
            HealthCheckProtocol::MesosHttp
                | HealthCheckProtocol::MesosTcp
                | HealthCheckProtocol::Command
        )
    }
}

/// When unreachable tasks are replaced and forgotten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreachableStrategy {
    pub inactive_after: Duration,
    pub expunge_after: Duration,
}

impl Default for UnreachableStrategy {
    fn default() -> Self {
        Self {
            inactive_after: Duration::from_secs(5 * 60),
            expunge_after: Duration::from_secs(10 * 60),
        }
    }
}

/// A declared workload: an app (single task) or a pod (task group).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSpec {
    pub id: RunSpecId,
    pub instances: u32,
    pub resources: ResourceRequirements,
    pub ports: Vec<PortDefinition>,
    pub accepted_resource_roles: BTreeSet<String>,
    pub volumes: Vec<PersistentVolume>,
    pub executor: ExecutorSpec,
    pub containers: Vec<ContainerSpec>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub health_checks: Vec<HealthCheck>,
    pub unreachable_strategy: UnreachableStrategy,
    pub version: DateTime<Utc>,
}

impl RunSpec {
    /// An app with no requirements; callers fill in what they need.
    pub fn new(id: RunSpecId, instances: u32) -> Self {
        Self {
            id,
            instances,
            resources: ResourceRequirements::default(),
            ports: Vec::new(),
            accepted_resource_roles: BTreeSet::new(),
            volumes: Vec::new(),
            executor: ExecutorSpec::default(),
            containers: Vec::new(),
            env: BTreeMap::new(),
            labels: BTreeMap::new(),
            health_checks: Vec::new(),
            unreachable_strategy: UnreachableStrategy::default(),
            version: Utc::now(),
        }
    }

    /// Volume-resident workloads need reservations instead of plain launches.
    pub fn is_resident(&self) -> bool {
        !self.volumes.is_empty()
    }

    pub fn is_pod(&self) -> bool {
        !self.containers.is_empty()
    }

    /// Scalar resources needed by one instance, including executor overhead
    /// for task groups.
    pub fn total_resources(&self) -> ResourceRequirements {
        if self.is_pod() {
            self.containers
                .iter()
                .fold(POD_EXECUTOR_RESOURCES, |acc, c| acc + c.resources)
        } else {
            self.resources
        }
    }

    /// Port definitions in host-port assignment order.
    pub fn port_definitions(&self) -> Vec<&PortDefinition> {
        if self.is_pod() {
            self.containers.iter().flat_map(|c| c.endpoints.iter()).collect()
        } else {
            self.ports.iter().collect()
        }
    }

    pub fn port_requests(&self) -> Vec<HostPort> {
        self.port_definitions().iter().map(|p| p.host_port).collect()
    }

    /// Roles this run spec may consume; falls back to `default_role`.
    pub fn roles(&self, default_role: &str) -> BTreeSet<String> {
        if self.accepted_resource_roles.is_empty() {
            BTreeSet::from([default_role.to_string()])
        } else {
            self.accepted_resource_roles.clone()
        }
    }
}

/// Roles used when neither the run spec nor configuration names any.
pub fn default_roles() -> BTreeSet<String> {
    BTreeSet::from([UNRESERVED_ROLE.to_string()])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod() -> RunSpec {
        let mut spec = RunSpec::new(RunSpecId::parse("/pods/web").unwrap(), 1);
        spec.containers = vec![
            ContainerSpec {
                name: "app".to_string(),
                resources: ResourceRequirements::new(1.0, 256.0),
                endpoints: vec![PortDefinition::dynamic().named("http")],
                exec: ExecutorSpec::default(),
                env: BTreeMap::new(),
            },
            ContainerSpec {
                name: "sidecar".to_string(),
                resources: ResourceRequirements::new(0.5, 64.0),
                endpoints: vec![PortDefinition::fixed(9100)],
                exec: ExecutorSpec::default(),
                env: BTreeMap::new(),
            },
        ];
        spec
    }

    #[test]
    fn test_pod_resources_include_executor() {
        let total = pod().total_resources();
        assert!((total.cpus - 1.6).abs() < 1e-9);
        assert!((total.mem - 352.0).abs() < 1e-9);
        assert!((total.disk - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_pod_ports_flatten_in_container_order() {
        assert_eq!(
            pod().port_requests(),
            vec![HostPort::Dynamic, HostPort::Fixed(9100)]
        );
    }

    #[test]
    fn test_roles_default() {
        let mut spec = RunSpec::new(RunSpecId::parse("/a").unwrap(), 1);
        assert_eq!(spec.roles("*"), default_roles());
        spec.accepted_resource_roles.insert("prod".to_string());
        assert_eq!(spec.roles("*"), BTreeSet::from(["prod".to_string()]));
    }

    #[test]
    fn test_wire_level_health_checks() {
        assert!(HealthCheck::new(HealthCheckProtocol::MesosHttp).is_wire_level());
        assert!(HealthCheck::new(HealthCheckProtocol::Command).is_wire_level());
        assert!(!HealthCheck::new(HealthCheckProtocol::Http).is_wire_level());
    }
}
