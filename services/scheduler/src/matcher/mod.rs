//! Resource matching.
//!
//! Decides whether an offer satisfies a run spec's scalar, port and volume
//! requirements, and which exact resource fragments would be consumed.
//! Matching is a pure function of its inputs: it never mutates the offer
//! and can run concurrently for different offers.

mod pool;
mod ports;

use std::collections::{BTreeMap, BTreeSet};

use keel_id::LocalVolumeId;
use serde::{Deserialize, Serialize};

use crate::model::{
    Instance, Offer, PersistentVolume, Resource, ResourceName, ResourceValue, RunSpec,
    SCALAR_EPSILON,
};

use pool::ResourcePool;

/// Why an offer did not match a run spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NoOfferMatchReason {
    UnfulfilledRole,
    InsufficientCpus,
    InsufficientMemory,
    InsufficientDisk,
    InsufficientGpus,
    InsufficientPorts,
    DeclinedScarceResources,
    NoCorrespondingReservationFound,
}

impl NoOfferMatchReason {
    fn for_scalar(name: ResourceName) -> Self {
        match name {
            ResourceName::Cpus => Self::InsufficientCpus,
            ResourceName::Mem => Self::InsufficientMemory,
            ResourceName::Disk => Self::InsufficientDisk,
            ResourceName::Gpus => Self::InsufficientGpus,
            ResourceName::Ports => Self::InsufficientPorts,
        }
    }
}

impl std::fmt::Display for NoOfferMatchReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Whether GPU agents may run workloads that need no GPUs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GpuSchedulingBehavior {
    /// Keep GPU agents for GPU workloads.
    #[default]
    Restricted,
    Unrestricted,
}

impl std::str::FromStr for GpuSchedulingBehavior {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "restricted" => Ok(Self::Restricted),
            "unrestricted" => Ok(Self::Unrestricted),
            other => Err(format!("unknown gpu scheduling behavior '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ReservationFilter {
    /// Only resources without a dynamic reservation.
    Unreserved,
    /// Only resources reserved with (at least) these labels.
    ReservedWith(BTreeMap<String, String>),
    /// Either of the above; reserved fragments are consumed first.
    PreferReserved(BTreeMap<String, String>),
}

/// Which offer resources a match may consume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSelector {
    roles: BTreeSet<String>,
    reservation: ReservationFilter,
}

impl ResourceSelector {
    pub fn unreserved(roles: BTreeSet<String>) -> Self {
        Self {
            roles,
            reservation: ReservationFilter::Unreserved,
        }
    }

    pub fn reserved_with(roles: BTreeSet<String>, labels: BTreeMap<String, String>) -> Self {
        Self {
            roles,
            reservation: ReservationFilter::ReservedWith(labels),
        }
    }

    pub fn prefer_reserved(roles: BTreeSet<String>, labels: BTreeMap<String, String>) -> Self {
        Self {
            roles,
            reservation: ReservationFilter::PreferReserved(labels),
        }
    }

    pub fn roles(&self) -> &BTreeSet<String> {
        &self.roles
    }

    pub fn accepts(&self, resource: &Resource) -> bool {
        if !self.roles.contains(&resource.role) {
            return false;
        }
        let labelled = |labels: &BTreeMap<String, String>| {
            resource.reservation_labels().is_some_and(|have| {
                labels.iter().all(|(k, v)| have.get(k) == Some(v))
            })
        };
        match &self.reservation {
            ReservationFilter::Unreserved => !resource.is_reserved(),
            ReservationFilter::ReservedWith(labels) => labelled(labels),
            ReservationFilter::PreferReserved(labels) => !resource.is_reserved() || labelled(labels),
        }
    }
}

/// Volume handling requested from the matcher.
#[derive(Debug, Clone, Copy)]
pub enum VolumeRequest<'a> {
    None,
    /// Found a new reservation: carve these volumes out of unreserved disk.
    Create(&'a [PersistentVolume]),
    /// Relaunch on a reservation: these volumes must already exist on the offer.
    Existing(&'a [LocalVolumeId]),
}

/// Exact resources an instance would consume from an offer.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceMatch {
    /// Every consumed fragment, volumes included.
    pub resources: Vec<Resource>,
    /// One entry per requested port: `Some(host port)` or `None` when the
    /// port is assigned inside the container.
    pub host_ports: Vec<Option<u16>>,
    /// Disk fragment backing each newly created volume, in declaration order.
    pub new_volumes: Vec<(PersistentVolume, Resource)>,
}

impl ResourceMatch {
    pub fn scalar_sum(&self, name: ResourceName) -> f64 {
        self.resources
            .iter()
            .filter(|r| r.name == name)
            .map(|r| r.value.scalar())
            .sum()
    }

    pub fn assigned_ports(&self) -> Vec<u16> {
        self.host_ports.iter().flatten().copied().collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResourceMatchResponse {
    Match(ResourceMatch),
    NoMatch(Vec<NoOfferMatchReason>),
}

impl ResourceMatchResponse {
    pub fn into_match(self) -> Option<ResourceMatch> {
        match self {
            Self::Match(m) => Some(m),
            Self::NoMatch(_) => None,
        }
    }

    pub fn reasons(&self) -> &[NoOfferMatchReason] {
        match self {
            Self::Match(_) => &[],
            Self::NoMatch(reasons) => reasons,
        }
    }
}

/// Matches offers against run specs.
#[derive(Debug, Clone, Default)]
pub struct ResourceMatcher {
    gpu_scheduling: GpuSchedulingBehavior,
}

impl ResourceMatcher {
    pub fn new(gpu_scheduling: GpuSchedulingBehavior) -> Self {
        Self { gpu_scheduling }
    }

    /// Match a run spec's full requirement set against an offer.
    pub fn match_offer(
        &self,
        offer: &Offer,
        run_spec: &RunSpec,
        known_instances: &[Instance],
        selector: &ResourceSelector,
    ) -> ResourceMatchResponse {
        self.match_with_volumes(offer, run_spec, known_instances, selector, VolumeRequest::None)
    }

    /// Match with explicit volume handling; used for resident workloads.
    pub fn match_with_volumes(
        &self,
        offer: &Offer,
        run_spec: &RunSpec,
        known_instances: &[Instance],
        selector: &ResourceSelector,
        volumes: VolumeRequest<'_>,
    ) -> ResourceMatchResponse {
        let required = run_spec.total_resources();

        if self.gpu_scheduling == GpuSchedulingBehavior::Restricted
            && required.gpus <= SCALAR_EPSILON
            && offer.has_gpus()
        {
            return ResourceMatchResponse::NoMatch(vec![
                NoOfferMatchReason::DeclinedScarceResources,
            ]);
        }

        if !offer.resources.iter().any(|r| selector.accepts(r)) {
            return ResourceMatchResponse::NoMatch(vec![NoOfferMatchReason::UnfulfilledRole]);
        }

        let mut pool = ResourcePool::new(offer);
        let mut reasons = Vec::new();
        let mut resources = Vec::new();
        let mut new_volumes = Vec::new();

        // Volumes before root disk so that a volume is never starved by it.
        match volumes {
            VolumeRequest::None => {}
            VolumeRequest::Create(declared) => {
                let mut ok = true;
                for volume in declared {
                    match pool.take_new_volume(volume, selector) {
                        Some(fragment) => new_volumes.push((volume.clone(), fragment)),
                        None => ok = false,
                    }
                }
                if !ok {
                    reasons.push(NoOfferMatchReason::InsufficientDisk);
                }
            }
            VolumeRequest::Existing(ids) => match pool.take_existing_volumes(ids) {
                Some(fragments) => resources.extend(fragments),
                None => reasons.push(NoOfferMatchReason::NoCorrespondingReservationFound),
            },
        }

        let scalars = [
            (ResourceName::Cpus, required.cpus),
            (ResourceName::Mem, required.mem),
            (ResourceName::Disk, required.disk),
            (ResourceName::Gpus, required.gpus),
        ];
        for (name, amount) in scalars {
            if amount <= SCALAR_EPSILON {
                continue;
            }
            match pool.take_scalar(name, amount, selector) {
                Some(fragments) => resources.extend(fragments),
                None => {
                    let reason = NoOfferMatchReason::for_scalar(name);
                    if !reasons.contains(&reason) {
                        reasons.push(reason);
                    }
                }
            }
        }

        let excluded = ports_in_use(offer, known_instances);
        let host_ports =
            match ports::assign_ports(&mut pool, &run_spec.port_requests(), selector, &excluded) {
                Some(ports) => ports,
                None => {
                    reasons.push(NoOfferMatchReason::InsufficientPorts);
                    Vec::new()
                }
            };

        if !reasons.is_empty() {
            return ResourceMatchResponse::NoMatch(reasons);
        }

        resources.extend(new_volumes.iter().map(|(_, fragment)| fragment.clone()));
        resources.extend(pool.consumed_ports());

        ResourceMatchResponse::Match(ResourceMatch {
            resources,
            host_ports,
            new_volumes,
        })
    }
}

/// Host ports held by active tasks on the offer's agent.
fn ports_in_use(offer: &Offer, known_instances: &[Instance]) -> BTreeSet<u16> {
    known_instances
        .iter()
        .filter(|i| i.agent.agent_id == offer.agent_id)
        .flat_map(|i| i.tasks.values())
        .filter(|t| t.condition().is_active())
        .flat_map(|t| t.host_ports.iter().copied())
        .collect()
}

/// The offer minus everything in `consumed`.
///
/// Fragments are matched to offer resources by their metadata (name, role,
/// reservation and disk info); resources that drop to zero are removed.
pub fn remaining_offer(offer: &Offer, consumed: &[Resource]) -> Offer {
    let mut resources = offer.resources.clone();
    for used in consumed {
        let same_kind = |r: &Resource| {
            r.name == used.name
                && r.role == used.role
                && r.reservation == used.reservation
                && r.disk == used.disk
        };
        match &used.value {
            ResourceValue::Scalar(amount) => {
                let mut missing = *amount;
                for r in resources.iter_mut().filter(|r| same_kind(r)) {
                    if missing <= SCALAR_EPSILON {
                        break;
                    }
                    if let ResourceValue::Scalar(have) = &mut r.value {
                        let take = have.min(missing);
                        *have -= take;
                        missing -= take;
                    }
                }
            }
            ResourceValue::Ranges(used_ranges) => {
                let used_ports: BTreeSet<u16> = used_ranges.iter().flat_map(|r| r.ports()).collect();
                for r in resources.iter_mut().filter(|r| same_kind(r)) {
                    if let ResourceValue::Ranges(ranges) = &r.value {
                        let left: Vec<u16> = ranges
                            .iter()
                            .flat_map(|range| range.ports())
                            .filter(|p| !used_ports.contains(p))
                            .collect();
                        r.value = ResourceValue::Ranges(crate::model::ports_to_ranges(&left));
                    }
                }
            }
        }
    }
    resources.retain(|r| match &r.value {
        ResourceValue::Scalar(v) => *v > SCALAR_EPSILON,
        ResourceValue::Ranges(ranges) => !ranges.is_empty(),
    });

    Offer {
        resources,
        ..offer.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        default_roles, DiskSource, HostPort, PortDefinition, PortRange, ReservationInfo,
        ResourceRequirements,
    };
    use keel_id::{AgentId, RunSpecId};
    use proptest::prelude::*;

    fn offer(cpus: f64, mem: f64, ports: Vec<PortRange>) -> Offer {
        Offer::new(
            AgentId::new(),
            "agent-1",
            vec![
                Resource::scalar(ResourceName::Cpus, cpus),
                Resource::scalar(ResourceName::Mem, mem),
                Resource::disk(10_000.0, DiskSource::Root),
                Resource::ports(ports),
            ],
        )
    }

    fn app(cpus: f64, mem: f64, ports: Vec<PortDefinition>) -> RunSpec {
        let mut spec = RunSpec::new(RunSpecId::parse("/test/app").unwrap(), 1);
        spec.resources = ResourceRequirements::new(cpus, mem);
        spec.ports = ports;
        spec
    }

    fn any_role() -> ResourceSelector {
        ResourceSelector::unreserved(default_roles())
    }

    #[test]
    fn test_static_port_match() {
        let offer = offer(4.0, 2048.0, vec![PortRange::single(31000)]);
        let spec = app(1.0, 512.0, vec![PortDefinition::fixed(31000)]);
        let matched = ResourceMatcher::default()
            .match_offer(&offer, &spec, &[], &any_role())
            .into_match()
            .unwrap();
        assert_eq!(matched.host_ports, vec![Some(31000)]);
        assert!((matched.scalar_sum(ResourceName::Cpus) - 1.0).abs() < 1e-9);
        assert!((matched.scalar_sum(ResourceName::Mem) - 512.0).abs() < 1e-9);
    }

    #[test]
    fn test_insufficient_resources_report_every_reason() {
        let offer = offer(0.01, 64.0, vec![]);
        let spec = app(1.0, 512.0, vec![PortDefinition::dynamic()]);
        let response = ResourceMatcher::default().match_offer(&offer, &spec, &[], &any_role());
        assert_eq!(
            response.reasons(),
            &[
                NoOfferMatchReason::InsufficientCpus,
                NoOfferMatchReason::InsufficientMemory,
                NoOfferMatchReason::InsufficientPorts
            ]
        );
    }

    #[test]
    fn test_unfulfilled_role() {
        let offer = offer(4.0, 2048.0, vec![]);
        let mut spec = app(1.0, 128.0, vec![]);
        spec.accepted_resource_roles.insert("gpu-team".to_string());
        let selector = ResourceSelector::unreserved(spec.roles("*"));
        let response = ResourceMatcher::default().match_offer(&offer, &spec, &[], &selector);
        assert_eq!(response.reasons(), &[NoOfferMatchReason::UnfulfilledRole]);
    }

    #[test]
    fn test_gpu_offers_are_kept_for_gpu_workloads() {
        let mut offer = offer(4.0, 2048.0, vec![]);
        offer.resources.push(Resource::scalar(ResourceName::Gpus, 1.0));
        let spec = app(1.0, 128.0, vec![]);

        let restricted = ResourceMatcher::new(GpuSchedulingBehavior::Restricted);
        assert_eq!(
            restricted.match_offer(&offer, &spec, &[], &any_role()).reasons(),
            &[NoOfferMatchReason::DeclinedScarceResources]
        );

        let unrestricted = ResourceMatcher::new(GpuSchedulingBehavior::Unrestricted);
        assert!(unrestricted
            .match_offer(&offer, &spec, &[], &any_role())
            .into_match()
            .is_some());
    }

    #[test]
    fn test_reserved_resources_need_matching_labels() {
        let labels = BTreeMap::from([("task".to_string(), "a".to_string())]);
        let reserved = Resource::scalar(ResourceName::Cpus, 1.0)
            .with_role("keel")
            .with_reservation(ReservationInfo {
                principal: None,
                labels: labels.clone(),
            });
        let roles = BTreeSet::from(["keel".to_string()]);

        assert!(ResourceSelector::reserved_with(roles.clone(), labels.clone()).accepts(&reserved));
        assert!(!ResourceSelector::unreserved(roles.clone()).accepts(&reserved));

        let other = BTreeMap::from([("task".to_string(), "b".to_string())]);
        assert!(!ResourceSelector::prefer_reserved(roles, other).accepts(&reserved));
    }

    #[test]
    fn test_container_ports_are_not_bound() {
        let offer = offer(1.0, 128.0, vec![]);
        let mut spec = app(0.5, 64.0, vec![]);
        let mut port = PortDefinition::dynamic();
        port.host_port = HostPort::None;
        spec.ports = vec![port];
        let matched = ResourceMatcher::default()
            .match_offer(&offer, &spec, &[], &any_role())
            .into_match()
            .unwrap();
        assert_eq!(matched.host_ports, vec![None]);
    }

    #[test]
    fn test_remaining_offer_subtracts_match() {
        let offer = offer(4.0, 2048.0, vec![PortRange::new(31000, 31002)]);
        let spec = app(1.5, 1024.0, vec![PortDefinition::fixed(31001)]);
        let matched = ResourceMatcher::default()
            .match_offer(&offer, &spec, &[], &any_role())
            .into_match()
            .unwrap();
        let rest = remaining_offer(&offer, &matched.resources);
        assert!((rest.scalar_total(ResourceName::Cpus) - 2.5).abs() < 1e-9);
        assert!((rest.scalar_total(ResourceName::Mem) - 1024.0).abs() < 1e-9);
        let ports: Vec<_> = rest
            .resources
            .iter()
            .flat_map(|r| r.value.ranges().to_vec())
            .collect();
        assert_eq!(ports, vec![PortRange::single(31000), PortRange::single(31002)]);
    }

    proptest! {
        #[test]
        fn match_never_exceeds_offer(
            cpus in 0.0f64..8.0,
            mem in 0.0f64..4096.0,
            want_cpus in 0.0f64..8.0,
            want_mem in 0.0f64..4096.0,
            dynamic in 0usize..6,
            begin in 30000u16..31000,
            width in 0u16..8,
        ) {
            let offer = offer(cpus, mem, vec![PortRange::new(begin, begin + width)]);
            let spec = app(want_cpus, want_mem, vec![PortDefinition::dynamic(); dynamic]);
            if let Some(m) = ResourceMatcher::default()
                .match_offer(&offer, &spec, &[], &any_role())
                .into_match()
            {
                prop_assert!(m.scalar_sum(ResourceName::Cpus) <= cpus + 1e-6);
                prop_assert!(m.scalar_sum(ResourceName::Mem) <= mem + 1e-6);
                let ports = m.assigned_ports();
                let unique: BTreeSet<_> = ports.iter().collect();
                prop_assert_eq!(unique.len(), ports.len());
                prop_assert!(ports.iter().all(|p| (begin..=begin + width).contains(p)));
                prop_assert_eq!(ports.len(), dynamic);
            }
        }
    }
}
