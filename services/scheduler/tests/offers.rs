//! Offers flowing through matching, operation building and local
//! application, down to the calls made on the resource manager.

use std::sync::Arc;

use keel_id::{AgentId, RunSpecId};
use keel_scheduler::driver::MockDriver;
use keel_scheduler::matcher::ResourceSelector;
use keel_scheduler::model::{
    Condition, DiskSource, Offer, PersistentVolume, PortDefinition, PortRange, ReservationState,
    Resource, ResourceName, ResourceRequirements, RunSpec,
};
use keel_scheduler::ops::WireOperation;
use keel_scheduler::processor::ProcessorConfig;
use keel_scheduler::store::{InMemoryTaskRepository, TaskRepository};
use keel_scheduler::tracker::{InMemoryInstanceTracker, InstanceTracker};
use keel_scheduler::{
    FactoryConfig, InstanceOpFactory, LaunchQueue, NoOfferMatchReason, OfferOutcome,
    OfferProcessor, ResourceMatcher, StateOpProcessor,
};

struct Harness {
    tracker: Arc<InMemoryInstanceTracker>,
    repo: Arc<InMemoryTaskRepository>,
    driver: Arc<MockDriver>,
    offers: OfferProcessor,
}

fn harness() -> Harness {
    let tracker = Arc::new(InMemoryInstanceTracker::new());
    let repo = Arc::new(InMemoryTaskRepository::new());
    let driver = Arc::new(MockDriver::new());
    let processor = Arc::new(StateOpProcessor::start(
        ProcessorConfig::default(),
        tracker.clone(),
        repo.clone(),
    ));
    let offers = OfferProcessor::new(
        InstanceOpFactory::new(FactoryConfig::default(), ResourceMatcher::default()),
        tracker.clone(),
        processor,
        driver.clone(),
        Arc::new(LaunchQueue::new()),
    );
    Harness {
        tracker,
        repo,
        driver,
        offers,
    }
}

fn offer(agent: AgentId, cpus: f64) -> Offer {
    Offer::new(
        agent,
        "agent-1.example.com",
        vec![
            Resource::scalar(ResourceName::Cpus, cpus),
            Resource::scalar(ResourceName::Mem, 2048.0),
            Resource::disk(8192.0, DiskSource::Root),
            Resource::ports(vec![PortRange::new(31000, 31000)]),
        ],
    )
}

fn web() -> RunSpec {
    let mut spec = RunSpec::new(RunSpecId::parse("/prod/web").unwrap(), 2);
    spec.resources = ResourceRequirements::new(1.0, 512.0);
    spec.ports = vec![PortDefinition::fixed(31000)];
    spec
}

fn db() -> RunSpec {
    let mut spec = RunSpec::new(RunSpecId::parse("/prod/db").unwrap(), 1);
    spec.resources = ResourceRequirements::new(1.0, 512.0);
    spec.volumes = vec![PersistentVolume::new("data", 1024.0)];
    spec
}

#[test]
fn test_fixed_port_is_assigned() {
    let spec = web();
    let matched = ResourceMatcher::default()
        .match_offer(
            &offer(AgentId::new(), 4.0),
            &spec,
            &[],
            &ResourceSelector::unreserved(spec.roles("*")),
        )
        .into_match()
        .unwrap();
    assert_eq!(matched.assigned_ports(), vec![31000]);
}

#[tokio::test]
async fn test_fixed_port_limits_instances_per_agent() {
    let h = harness();
    let spec = web();
    h.offers.queue().add(spec.clone(), 2).await;

    let agent = AgentId::new();
    let outcome = h.offers.process_offer(offer(agent, 4.0)).await.unwrap();
    let OfferOutcome::Accepted { operations } = outcome else {
        panic!("expected accept, got {outcome:?}");
    };
    assert_eq!(operations.len(), 1);
    let WireOperation::Launch { tasks } = &operations[0] else {
        panic!("expected launch");
    };
    assert_eq!(tasks.len(), 1);

    // The only port on the agent is taken by the task just launched.
    let outcome = h.offers.process_offer(offer(agent, 4.0)).await.unwrap();
    assert_eq!(
        outcome,
        OfferOutcome::Declined {
            reasons: [NoOfferMatchReason::InsufficientPorts].into()
        }
    );

    // Another agent still fits the second instance.
    h.offers.process_offer(offer(AgentId::new(), 4.0)).await.unwrap();
    assert_eq!(h.tracker.known_instances(&spec.id).await.len(), 2);
    assert!(h.offers.queue().list().await.is_empty());
}

#[tokio::test]
async fn test_tiny_offer_is_declined() {
    let h = harness();
    h.offers.queue().add(web(), 1).await;

    let outcome = h.offers.process_offer(offer(AgentId::new(), 0.01)).await.unwrap();
    assert!(matches!(outcome, OfferOutcome::Declined { .. }));
    assert_eq!(h.driver.declined().await.len(), 1);
    assert!(h.repo.is_empty().await);
}

#[tokio::test]
async fn test_resident_reserve_then_launch_on_reservation() {
    let h = harness();
    let spec = db();
    h.offers.queue().add(spec.clone(), 1).await;
    let agent = AgentId::new();

    // First offer: nothing reserved yet, so reserve and create the volume.
    let outcome = h.offers.process_offer(offer(agent, 4.0)).await.unwrap();
    let OfferOutcome::Accepted { operations } = outcome else {
        panic!("expected accept, got {outcome:?}");
    };
    let [WireOperation::Reserve { resources: reserve }, WireOperation::CreateVolumes { volumes }] =
        operations.as_slice()
    else {
        panic!("expected reserve and create, got {operations:?}");
    };
    assert_eq!(volumes.len(), 1);

    let instances = h.tracker.known_instances(&spec.id).await;
    assert_eq!(instances.len(), 1);
    let task = instances[0].tasks.values().next().cloned().unwrap();
    assert_eq!(task.condition(), Condition::Reserved);
    assert!(task.reservation_deadline().is_some());
    assert_eq!(h.repo.get(&task.id).await.unwrap(), Some(task.clone()));
    // A reservation is not a launch.
    assert_eq!(h.offers.queue().remaining(&spec.id).await, 1);
    // The offer was used, so it does not count against the run spec.
    let stats = h.offers.statistics().get(&spec.id).await.unwrap();
    assert_eq!(stats.offers_matched, 1);
    assert!(stats.rejections.is_empty(), "{stats:?}");

    // Second offer carries the reservation and the volume back.
    let mut resources: Vec<Resource> = reserve
        .iter()
        .filter(|r| r.name != ResourceName::Disk)
        .cloned()
        .collect();
    resources.extend(volumes.iter().cloned());
    resources.push(Resource::scalar(ResourceName::Cpus, 2.0));
    let reserved_offer = Offer::new(agent, "agent-1.example.com", resources);

    let outcome = h.offers.process_offer(reserved_offer).await.unwrap();
    let OfferOutcome::Accepted { operations } = outcome else {
        panic!("expected accept, got {outcome:?}");
    };
    let [WireOperation::Launch { tasks }] = operations.as_slice() else {
        panic!("expected a single launch, got {operations:?}");
    };
    assert_eq!(tasks[0].task_id, task.id);
    // The volume is reused, not created again.
    assert!(tasks[0]
        .resources
        .iter()
        .any(|r| r.persistence().is_some()));

    let launched = h.tracker.task(&task.id).await.unwrap();
    assert_eq!(launched.condition(), Condition::Created);
    assert_eq!(
        launched.reservation.map(|r| r.state),
        Some(ReservationState::Launched)
    );
    assert!(h.offers.queue().list().await.is_empty());
}

#[tokio::test]
async fn test_resident_does_not_over_reserve() {
    let h = harness();
    let spec = db();
    h.offers.queue().add(spec.clone(), 1).await;

    h.offers.process_offer(offer(AgentId::new(), 4.0)).await.unwrap();
    // The only instance already holds a reservation on another agent.
    let outcome = h.offers.process_offer(offer(AgentId::new(), 4.0)).await.unwrap();
    assert_eq!(
        outcome,
        OfferOutcome::Declined {
            reasons: [NoOfferMatchReason::NoCorrespondingReservationFound].into()
        }
    );
    assert_eq!(h.tracker.known_instances(&spec.id).await.len(), 1);
}
