//! Instance operation factory.
//!
//! Decides what, if anything, to do with an offer for one run spec:
//!
//! - nothing, when enough instances are already placed
//! - launch a task (or task group) for stateless run specs
//! - for resident run specs, relaunch on an existing reservation found on
//!   the offer, or found a new reservation and create its volumes
//!
//! The factory is pure apart from ID generation and the clock; it never
//! touches the tracker or the store.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use keel_id::{InstanceId, LocalVolumeId, TaskId};
use tracing::{debug, info, instrument, warn};

use crate::matcher::{
    NoOfferMatchReason, ResourceMatch, ResourceMatchResponse, ResourceMatcher, ResourceSelector,
    VolumeRequest,
};
use crate::model::{
    Condition, ContainerSpec, DiskInfo, Instance, Offer, Persistence, PortDefinition, PortRange,
    Reservation, ReservationInfo, ReservationState, ReservationTimeout, Resource,
    ResourceName, ResourceRequirements, ResourceValue, RunSpec, Task, TaskStatus,
    POD_EXECUTOR_RESOURCES, SCALAR_EPSILON,
};
use crate::ops::{
    CommandInfo, ContainerInfo, DiscoveryInfo, DiscoveryPort, ExecutorInfo, HealthCheckInfo,
    InstanceOp, InstanceOpError, TaskGroupInfo, TaskInfo,
};
use crate::state::TaskStateOp;

/// Reservation label carrying the framework ID.
pub const FRAMEWORK_ID_LABEL: &str = "keel_framework_id";

/// Reservation label carrying the task the reservation belongs to.
pub const TASK_ID_LABEL: &str = "keel_task_id";

#[derive(Debug, Clone)]
pub struct FactoryConfig {
    pub framework_id: String,
    /// Role new reservations are made for.
    pub reservation_role: String,
    /// Role accepted when a run spec names none.
    pub default_role: String,
    /// How long a new reservation may wait for its launch.
    pub reservation_timeout: chrono::Duration,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            framework_id: "keel".to_string(),
            reservation_role: "keel".to_string(),
            default_role: crate::model::UNRESERVED_ROLE.to_string(),
            reservation_timeout: chrono::Duration::minutes(5),
        }
    }
}

/// Outcome of evaluating one offer for one run spec.
#[derive(Debug, Clone, PartialEq)]
pub enum BuildOutcome {
    Op(InstanceOp),
    /// Nothing left to launch for this run spec.
    FullyPlaced,
    NoMatch(Vec<NoOfferMatchReason>),
}

impl BuildOutcome {
    pub fn into_op(self) -> Option<InstanceOp> {
        match self {
            Self::Op(op) => Some(op),
            Self::FullyPlaced | Self::NoMatch(_) => None,
        }
    }
}

pub struct InstanceOpFactory {
    config: FactoryConfig,
    matcher: ResourceMatcher,
}

impl InstanceOpFactory {
    pub fn new(config: FactoryConfig, matcher: ResourceMatcher) -> Self {
        Self { config, matcher }
    }

    pub fn config(&self) -> &FactoryConfig {
        &self.config
    }

    /// Operation for `offer`, or `None` when there is nothing to do with it.
    ///
    /// `known_instances` may contain instances of other run specs; they are
    /// used to avoid host ports already bound on the agent.
    pub fn build_op(
        &self,
        run_spec: &RunSpec,
        offer: &Offer,
        known_instances: &[Instance],
        additional_launches: u32,
    ) -> Result<Option<InstanceOp>, InstanceOpError> {
        self.evaluate(run_spec, offer, known_instances, additional_launches)
            .map(BuildOutcome::into_op)
    }

    /// Like [`Self::build_op`], keeping the reasons an offer was not used.
    #[instrument(skip_all, fields(run_spec_id = %run_spec.id, offer_id = %offer.id))]
    pub fn evaluate(
        &self,
        run_spec: &RunSpec,
        offer: &Offer,
        known_instances: &[Instance],
        additional_launches: u32,
    ) -> Result<BuildOutcome, InstanceOpError> {
        let own: Vec<&Instance> = known_instances
            .iter()
            .filter(|i| i.run_spec_id == run_spec.id)
            .collect();
        let placed = own.iter().filter(|i| i.is_placed()).count();
        let desired = usize::try_from(run_spec.instances).unwrap_or(usize::MAX);

        if additional_launches == 0 || placed >= desired {
            debug!(placed, desired, "run spec fully placed");
            return Ok(BuildOutcome::FullyPlaced);
        }

        let now = Utc::now();
        if run_spec.is_resident() {
            self.evaluate_resident(run_spec, offer, known_instances, &own, placed, now)
        } else {
            self.evaluate_ephemeral(run_spec, offer, known_instances, now)
        }
    }

    fn evaluate_ephemeral(
        &self,
        run_spec: &RunSpec,
        offer: &Offer,
        known_instances: &[Instance],
        now: DateTime<Utc>,
    ) -> Result<BuildOutcome, InstanceOpError> {
        let selector = ResourceSelector::unreserved(run_spec.roles(&self.config.default_role));
        let matched = match self.matcher.match_offer(offer, run_spec, known_instances, &selector) {
            ResourceMatchResponse::Match(m) => m,
            ResourceMatchResponse::NoMatch(reasons) => return Ok(no_match(run_spec, reasons)),
        };

        let op = if run_spec.is_pod() {
            self.launch_group(run_spec, offer, &matched, now)?
        } else {
            let task_id = TaskId::for_instance(&run_spec.id, InstanceId::new());
            let task_info = self.task_info(
                run_spec,
                offer,
                &task_id,
                None,
                matched.resources.clone(),
                &matched.host_ports,
            );
            let task = new_task(
                task_id,
                run_spec,
                offer,
                TaskStatus::new(Condition::Created, now),
                matched.assigned_ports(),
            );
            InstanceOp::launch_task(task_info, TaskStateOp::LaunchEphemeral(task))?
        };
        debug!(kind = op.kind(), "instance operation built");
        Ok(BuildOutcome::Op(op))
    }

    fn evaluate_resident(
        &self,
        run_spec: &RunSpec,
        offer: &Offer,
        known_instances: &[Instance],
        own: &[&Instance],
        placed: usize,
        now: DateTime<Utc>,
    ) -> Result<BuildOutcome, InstanceOpError> {
        if run_spec.is_pod() {
            return Err(InstanceOpError::UnsupportedResidentPod {
                run_spec_id: run_spec.id.clone(),
            });
        }

        let reserved: Vec<&Instance> = own
            .iter()
            .copied()
            .filter(|i| i.tasks.values().any(Task::is_reserved))
            .collect();
        if reserved.iter().any(|i| i.tasks.len() != 1) {
            return Err(InstanceOpError::UnsupportedResidentPod {
                run_spec_id: run_spec.id.clone(),
            });
        }

        let offered: BTreeSet<&LocalVolumeId> = offer
            .resources
            .iter()
            .filter_map(Resource::persistence)
            .map(|p| &p.volume_id)
            .collect();
        let on_offer = reserved.iter().flat_map(|i| i.tasks.values()).find(|t| {
            t.is_reserved()
                && t.agent.agent_id == offer.agent_id
                && !t.volume_ids().is_empty()
                && t.volume_ids().iter().all(|v| offered.contains(v))
        });

        if let Some(task) = on_offer {
            return self.launch_on_reservation(run_spec, offer, known_instances, task, now);
        }

        let desired = usize::try_from(run_spec.instances).unwrap_or(usize::MAX);
        if placed + reserved.len() >= desired {
            // Every missing instance already holds a reservation elsewhere.
            return Ok(BuildOutcome::NoMatch(vec![
                NoOfferMatchReason::NoCorrespondingReservationFound,
            ]));
        }
        self.reserve_and_create(run_spec, offer, known_instances, now)
    }

    fn launch_on_reservation(
        &self,
        run_spec: &RunSpec,
        offer: &Offer,
        known_instances: &[Instance],
        task: &Task,
        now: DateTime<Utc>,
    ) -> Result<BuildOutcome, InstanceOpError> {
        let mut roles = run_spec.roles(&self.config.default_role);
        roles.insert(self.config.reservation_role.clone());
        let selector = ResourceSelector::prefer_reserved(roles, self.reservation_labels(&task.id));

        let matched = match self.matcher.match_with_volumes(
            offer,
            run_spec,
            known_instances,
            &selector,
            VolumeRequest::Existing(task.volume_ids()),
        ) {
            ResourceMatchResponse::Match(m) => m,
            ResourceMatchResponse::NoMatch(reasons) => return Ok(no_match(run_spec, reasons)),
        };

        let task_info = self.task_info(
            run_spec,
            offer,
            &task.id,
            None,
            matched.resources.clone(),
            &matched.host_ports,
        );
        let state_op = TaskStateOp::LaunchOnReservation {
            task_id: task.id.clone(),
            run_spec_version: run_spec.version,
            status: TaskStatus::new(Condition::Created, now),
            host_ports: matched.assigned_ports(),
        };
        let op = InstanceOp::launch_task(task_info, state_op)?;
        info!(task_id = %task.id, "relaunching on existing reservation");
        Ok(BuildOutcome::Op(op))
    }

    fn reserve_and_create(
        &self,
        run_spec: &RunSpec,
        offer: &Offer,
        known_instances: &[Instance],
        now: DateTime<Utc>,
    ) -> Result<BuildOutcome, InstanceOpError> {
        let selector = ResourceSelector::unreserved(run_spec.roles(&self.config.default_role));
        let matched = match self.matcher.match_with_volumes(
            offer,
            run_spec,
            known_instances,
            &selector,
            VolumeRequest::Create(&run_spec.volumes),
        ) {
            ResourceMatchResponse::Match(m) => m,
            ResourceMatchResponse::NoMatch(reasons) => return Ok(no_match(run_spec, reasons)),
        };

        let task_id = TaskId::for_instance(&run_spec.id, InstanceId::new());
        let reservation = ReservationInfo {
            principal: Some(self.config.framework_id.clone()),
            labels: self.reservation_labels(&task_id),
        };
        let reserve: Vec<Resource> = matched
            .resources
            .iter()
            .map(|r| self.reserved(r, &reservation))
            .collect();

        let mut volume_ids = Vec::with_capacity(matched.new_volumes.len());
        let mut create = Vec::with_capacity(matched.new_volumes.len());
        for (volume, fragment) in &matched.new_volumes {
            let volume_id = LocalVolumeId::new(&run_spec.id, &volume.container_path)?;
            let mut disk = self.reserved(fragment, &reservation);
            disk.disk = Some(DiskInfo {
                source: fragment.disk_source(),
                persistence: Some(Persistence {
                    volume_id: volume_id.clone(),
                    container_path: volume.container_path.clone(),
                }),
            });
            volume_ids.push(volume_id);
            create.push(disk);
        }

        let mut task = new_task(
            task_id,
            run_spec,
            offer,
            TaskStatus::new(Condition::Reserved, now),
            Vec::new(),
        );
        task.reservation = Some(Reservation {
            volume_ids,
            state: ReservationState::New {
                timeout: Some(ReservationTimeout {
                    initiated: now,
                    deadline: now + self.config.reservation_timeout,
                }),
            },
        });

        info!(task_id = %task.id, volumes = create.len(), "founding new reservation");
        Ok(BuildOutcome::Op(InstanceOp::ReserveAndCreateVolumes {
            consumed: matched.resources,
            reserve,
            create,
            state_op: TaskStateOp::Reserve(task),
        }))
    }

    fn launch_group(
        &self,
        run_spec: &RunSpec,
        offer: &Offer,
        matched: &ResourceMatch,
        now: DateTime<Utc>,
    ) -> Result<InstanceOp, InstanceOpError> {
        let instance_id = InstanceId::new();
        let mut split = FragmentSplitter::new(&matched.resources);
        let executor = ExecutorInfo {
            executor_id: format!("executor.{instance_id}"),
            resources: split.take_requirements(POD_EXECUTOR_RESOURCES),
        };

        let mut tasks = Vec::with_capacity(run_spec.containers.len());
        let mut state_ops = Vec::with_capacity(run_spec.containers.len());
        let mut port_offset = 0;
        for container in &run_spec.containers {
            let task_id = TaskId::for_container(&run_spec.id, instance_id, &container.name)?;
            let count = container.endpoints.len();
            let host_ports = matched
                .host_ports
                .get(port_offset..port_offset + count)
                .unwrap_or_default();
            port_offset += count;

            let mut resources = split.take_requirements(container.resources);
            resources.extend(split.take_ports(host_ports));

            tasks.push(self.task_info(
                run_spec,
                offer,
                &task_id,
                Some(container),
                resources,
                host_ports,
            ));
            let task = new_task(
                task_id,
                run_spec,
                offer,
                TaskStatus::new(Condition::Created, now),
                host_ports.iter().flatten().copied().collect(),
            );
            state_ops.push(TaskStateOp::LaunchEphemeral(task));
        }

        InstanceOp::launch_task_group(TaskGroupInfo { executor, tasks }, state_ops)
    }

    fn reservation_labels(&self, task_id: &TaskId) -> BTreeMap<String, String> {
        BTreeMap::from([
            (FRAMEWORK_ID_LABEL.to_string(), self.config.framework_id.clone()),
            (TASK_ID_LABEL.to_string(), task_id.to_string()),
        ])
    }

    fn reserved(&self, resource: &Resource, reservation: &ReservationInfo) -> Resource {
        resource
            .clone()
            .with_role(self.config.reservation_role.clone())
            .with_reservation(reservation.clone())
    }

    /// Launch payload of one task; `container` is set for task group members.
    fn task_info(
        &self,
        run_spec: &RunSpec,
        offer: &Offer,
        task_id: &TaskId,
        container: Option<&ContainerSpec>,
        resources: Vec<Resource>,
        host_ports: &[Option<u16>],
    ) -> TaskInfo {
        let definitions: Vec<&PortDefinition> = match container {
            Some(c) => c.endpoints.iter().collect(),
            None => run_spec.ports.iter().collect(),
        };
        let exec = container.map_or(&run_spec.executor, |c| &c.exec);
        let requirements = container.map_or(run_spec.resources, |c| c.resources);

        let mut environment = task_environment(
            run_spec,
            task_id,
            &offer.hostname,
            &definitions,
            host_ports,
            requirements,
        );
        environment.extend(run_spec.env.clone());
        if let Some(c) = container {
            environment.extend(c.env.clone());
        }

        let discovery = DiscoveryInfo {
            name: run_spec.id.safe_path(),
            ports: definitions
                .iter()
                .zip(host_ports)
                .filter_map(|(def, port)| {
                    port.map(|number| DiscoveryPort {
                        number,
                        name: def.name.clone(),
                        protocol: def.protocol,
                        labels: def.labels.clone(),
                    })
                })
                .collect(),
        };

        TaskInfo {
            task_id: task_id.clone(),
            name: container.map_or_else(|| run_spec.id.safe_path(), |c| c.name.clone()),
            agent_id: offer.agent_id,
            resources,
            command: CommandInfo {
                value: exec.command.clone(),
                arguments: exec.args.clone(),
                uris: exec.uris.clone(),
                environment,
            },
            container: exec.image.clone().map(|image| ContainerInfo { image }),
            health_check: container
                .is_none()
                .then(|| wire_health_check(run_spec, host_ports))
                .flatten(),
            discovery,
            labels: run_spec.labels.clone(),
        }
    }
}

fn no_match(run_spec: &RunSpec, reasons: Vec<NoOfferMatchReason>) -> BuildOutcome {
    info!(run_spec_id = %run_spec.id, reasons = ?reasons, "offer does not satisfy run spec");
    BuildOutcome::NoMatch(reasons)
}

fn new_task(
    id: TaskId,
    run_spec: &RunSpec,
    offer: &Offer,
    status: TaskStatus,
    host_ports: Vec<u16>,
) -> Task {
    Task {
        id,
        agent: offer.agent_info(),
        run_spec_version: run_spec.version,
        status,
        host_ports,
        reservation: None,
        unreachable_strategy: run_spec.unreachable_strategy,
    }
}

/// The first agent-side health check. Only one travels with a task; the rest
/// are dropped with a warning.
fn wire_health_check(run_spec: &RunSpec, host_ports: &[Option<u16>]) -> Option<HealthCheckInfo> {
    let mut wire_level = run_spec.health_checks.iter().filter(|h| h.is_wire_level());
    let check = wire_level.next()?;
    let dropped = wire_level.count();
    if dropped > 0 {
        warn!(
            run_spec_id = %run_spec.id,
            dropped,
            "only one agent-side health check is supported per task, dropping the rest"
        );
    }

    Some(HealthCheckInfo {
        protocol: check.protocol,
        path: check.path.clone(),
        command: check.command.clone(),
        port: check
            .port_index
            .and_then(|i| host_ports.get(i).copied().flatten()),
        grace_period: check.grace_period,
        interval: check.interval,
        timeout: check.timeout,
        max_consecutive_failures: check.max_consecutive_failures,
    })
}

fn task_environment(
    run_spec: &RunSpec,
    task_id: &TaskId,
    host: &str,
    definitions: &[&PortDefinition],
    host_ports: &[Option<u16>],
    requirements: ResourceRequirements,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::from([
        ("KEEL_RUN_SPEC_ID".to_string(), run_spec.id.to_string()),
        ("KEEL_RUN_SPEC_VERSION".to_string(), run_spec.version.to_rfc3339()),
        ("KEEL_TASK_ID".to_string(), task_id.to_string()),
        ("HOST".to_string(), host.to_string()),
        ("KEEL_RESOURCE_CPUS".to_string(), requirements.cpus.to_string()),
        ("KEEL_RESOURCE_MEM".to_string(), requirements.mem.to_string()),
        ("KEEL_RESOURCE_DISK".to_string(), requirements.disk.to_string()),
        ("KEEL_RESOURCE_GPUS".to_string(), requirements.gpus.to_string()),
    ]);

    let ports: Vec<(usize, u16)> = definitions
        .iter()
        .zip(host_ports.iter().copied().chain(std::iter::repeat(None)))
        .enumerate()
        .filter_map(|(i, (def, host))| host.or(def.container_port).map(|p| (i, p)))
        .collect();

    if let Some((_, first)) = ports.first() {
        env.insert("PORT".to_string(), first.to_string());
    }
    if !ports.is_empty() {
        let all: Vec<String> = ports.iter().map(|(_, p)| p.to_string()).collect();
        env.insert("PORTS".to_string(), all.join(","));
    }
    for (i, port) in &ports {
        env.insert(format!("PORT{i}"), port.to_string());
        if let Some(name) = &definitions[*i].name {
            env.insert(format!("PORT_{}", env_name(name)), port.to_string());
        }
    }
    env
}

fn env_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Hands out pieces of matched fragments, e.g. per task group member.
struct FragmentSplitter {
    fragments: Vec<Resource>,
}

impl FragmentSplitter {
    fn new(fragments: &[Resource]) -> Self {
        Self {
            fragments: fragments.to_vec(),
        }
    }

    fn take_requirements(&mut self, requirements: ResourceRequirements) -> Vec<Resource> {
        let mut taken = Vec::new();
        for (name, amount) in [
            (ResourceName::Cpus, requirements.cpus),
            (ResourceName::Mem, requirements.mem),
            (ResourceName::Disk, requirements.disk),
            (ResourceName::Gpus, requirements.gpus),
        ] {
            taken.extend(self.take_scalar(name, amount));
        }
        taken
    }

    fn take_scalar(&mut self, name: ResourceName, amount: f64) -> Vec<Resource> {
        let mut taken = Vec::new();
        let mut missing = amount;
        for fragment in self.fragments.iter_mut().filter(|f| f.name == name) {
            if missing <= SCALAR_EPSILON {
                break;
            }
            if let ResourceValue::Scalar(have) = &mut fragment.value {
                let take = have.min(missing);
                if take <= SCALAR_EPSILON {
                    continue;
                }
                *have -= take;
                missing -= take;
                taken.push(fragment.with_value(ResourceValue::Scalar(take)));
            }
        }
        taken
    }

    fn take_ports(&self, ports: &[Option<u16>]) -> Vec<Resource> {
        ports
            .iter()
            .flatten()
            .filter_map(|&port| {
                self.fragments
                    .iter()
                    .find(|f| f.value.ranges().iter().any(|r| r.contains(port)))
                    .map(|f| f.with_value(ResourceValue::Ranges(vec![PortRange::single(port)])))
            })
            .collect()
    }
}
