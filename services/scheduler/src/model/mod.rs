//! Scheduler data model: run specs, offers, resources, instances and tasks.

mod condition;
mod instance;
mod offer;
mod resources;
mod run_spec;

pub use condition::Condition;
pub use instance::{
    Instance, InstanceState, Reservation, ReservationState, ReservationTimeout,
    ResourceManagerStatus, Task, TaskState, TaskStatus,
};
pub use offer::{AgentInfo, Offer};
pub use resources::{
    ports_to_ranges, DiskInfo, DiskSource, DiskType, Persistence, PortRange, ReservationInfo,
    Resource, ResourceName, ResourceValue, UNRESERVED_ROLE,
};
pub(crate) use resources::SCALAR_EPSILON;
pub use run_spec::{
    default_roles, ContainerSpec, ExecutorSpec, HealthCheck, HealthCheckProtocol, HostPort,
    PersistentVolume, PortDefinition, Protocol, ResourceRequirements, RunSpec,
    UnreachableStrategy, POD_EXECUTOR_RESOURCES,
};
