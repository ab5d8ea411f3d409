//! Offer processing pipeline.
//!
//! Evaluates an incoming offer against every queued launch request, applies
//! the resulting state ops locally and hands the wire operations to the
//! resource manager, or declines the offer when nothing matched.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use keel_id::RunSpecId;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};

use crate::driver::{DriverError, ResourceManagerDriver};
use crate::factory::{BuildOutcome, InstanceOpFactory};
use crate::matcher::{remaining_offer, NoOfferMatchReason};
use crate::model::{Offer, RunSpec};
use crate::ops::{InstanceOp, WireOperation};
use crate::processor::StateOpSink;
use crate::tracker::InstanceTracker;

/// A run spec waiting for `remaining` more launches.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchRequest {
    pub run_spec: RunSpec,
    pub remaining: u32,
}

/// Launch requests in the order they were first added.
#[derive(Debug, Default)]
pub struct LaunchQueue {
    requests: RwLock<Vec<LaunchRequest>>,
}

impl LaunchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `count` more launches. A newer run spec version replaces the
    /// queued one.
    pub async fn add(&self, run_spec: RunSpec, count: u32) {
        let mut requests = self.requests.write().await;
        match requests.iter_mut().find(|r| r.run_spec.id == run_spec.id) {
            Some(request) => {
                request.remaining = request.remaining.saturating_add(count);
                request.run_spec = run_spec;
            }
            None => requests.push(LaunchRequest {
                run_spec,
                remaining: count,
            }),
        }
    }

    pub async fn remove(&self, run_spec_id: &RunSpecId) -> Option<LaunchRequest> {
        let mut requests = self.requests.write().await;
        let index = requests.iter().position(|r| &r.run_spec.id == run_spec_id)?;
        Some(requests.remove(index))
    }

    pub async fn list(&self) -> Vec<LaunchRequest> {
        self.requests.read().await.clone()
    }

    pub async fn remaining(&self, run_spec_id: &RunSpecId) -> u32 {
        self.requests
            .read()
            .await
            .iter()
            .find(|r| &r.run_spec.id == run_spec_id)
            .map_or(0, |r| r.remaining)
    }

    /// Record one accepted launch. Requests with nothing left are dropped.
    async fn launched(&self, run_spec_id: &RunSpecId) {
        let mut requests = self.requests.write().await;
        if let Some(request) = requests.iter_mut().find(|r| &r.run_spec.id == run_spec_id) {
            request.remaining = request.remaining.saturating_sub(1);
        }
        requests.retain(|r| r.remaining > 0);
    }
}

/// Offer matching counters of one run spec.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSpecOfferStats {
    pub offers_processed: u64,
    pub offers_matched: u64,
    /// Reasons the most recent unmatched offer was not used.
    pub last_no_match: Vec<NoOfferMatchReason>,
    pub rejections: BTreeMap<NoOfferMatchReason, u64>,
}

#[derive(Debug, Default)]
pub struct OfferMatchStatistics {
    by_run_spec: RwLock<HashMap<RunSpecId, RunSpecOfferStats>>,
}

impl OfferMatchStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, run_spec_id: &RunSpecId) -> Option<RunSpecOfferStats> {
        self.by_run_spec.read().await.get(run_spec_id).cloned()
    }

    async fn record_match(&self, run_spec_id: &RunSpecId) {
        let mut stats = self.by_run_spec.write().await;
        let entry = stats.entry(run_spec_id.clone()).or_default();
        entry.offers_processed += 1;
        entry.offers_matched += 1;
    }

    async fn record_no_match(&self, run_spec_id: &RunSpecId, reasons: &[NoOfferMatchReason]) {
        let mut stats = self.by_run_spec.write().await;
        let entry = stats.entry(run_spec_id.clone()).or_default();
        entry.offers_processed += 1;
        entry.last_no_match = reasons.to_vec();
        for reason in reasons {
            *entry.rejections.entry(*reason).or_default() += 1;
        }
    }

    async fn forget(&self, run_spec_id: &RunSpecId) {
        self.by_run_spec.write().await.remove(run_spec_id);
    }
}

/// What happened to an offer.
#[derive(Debug, Clone, PartialEq)]
pub enum OfferOutcome {
    Accepted { operations: Vec<WireOperation> },
    Declined { reasons: BTreeSet<NoOfferMatchReason> },
}

pub struct OfferProcessor {
    factory: InstanceOpFactory,
    tracker: Arc<dyn InstanceTracker>,
    processor: Arc<dyn StateOpSink>,
    driver: Arc<dyn ResourceManagerDriver>,
    queue: Arc<LaunchQueue>,
    statistics: Arc<OfferMatchStatistics>,
    /// Serializes the "count placed instances and decide" step per run spec.
    run_spec_locks: Mutex<HashMap<RunSpecId, Arc<Mutex<()>>>>,
}

impl OfferProcessor {
    pub fn new(
        factory: InstanceOpFactory,
        tracker: Arc<dyn InstanceTracker>,
        processor: Arc<dyn StateOpSink>,
        driver: Arc<dyn ResourceManagerDriver>,
        queue: Arc<LaunchQueue>,
    ) -> Self {
        Self {
            factory,
            tracker,
            processor,
            driver,
            queue,
            statistics: Arc::new(OfferMatchStatistics::new()),
            run_spec_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn queue(&self) -> &Arc<LaunchQueue> {
        &self.queue
    }

    pub fn statistics(&self) -> &Arc<OfferMatchStatistics> {
        &self.statistics
    }

    /// Stop launching `run_spec_id` and drop its statistics.
    pub async fn remove_run_spec(&self, run_spec_id: &RunSpecId) {
        self.queue.remove(run_spec_id).await;
        self.statistics.forget(run_spec_id).await;
        self.run_spec_locks.lock().await.remove(run_spec_id);
    }

    #[instrument(skip_all, fields(offer_id = %offer.id, agent = %offer.hostname))]
    pub async fn process_offer(&self, offer: Offer) -> Result<OfferOutcome, DriverError> {
        let mut remaining = offer.clone();
        let mut operations = Vec::new();
        let mut reasons = BTreeSet::new();

        for request in self.queue.list().await {
            let run_spec = &request.run_spec;
            let lock = self.run_spec_lock(&run_spec.id).await;
            let _guard = lock.lock().await;

            // Each op adds a placed or reserved instance, so the factory
            // stops on its own; the bound only guards against a run spec
            // that consumes nothing.
            for _ in 0..run_spec.instances {
                let additional = self.queue.remaining(&run_spec.id).await;
                let known = self.tracker.snapshot().await;
                let outcome = match self.factory.evaluate(run_spec, &remaining, &known, additional) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(run_spec_id = %run_spec.id, error = %e, "Failed to build instance operation");
                        break;
                    }
                };

                let op = match outcome {
                    BuildOutcome::Op(op) => op,
                    BuildOutcome::FullyPlaced => break,
                    BuildOutcome::NoMatch(no_match) => {
                        self.statistics.record_no_match(&run_spec.id, &no_match).await;
                        reasons.extend(no_match);
                        break;
                    }
                };

                if !self.apply_locally(&op).await {
                    break;
                }
                self.statistics.record_match(&run_spec.id).await;
                if matches!(op, InstanceOp::LaunchTask { .. } | InstanceOp::LaunchTaskGroup { .. }) {
                    self.queue.launched(&run_spec.id).await;
                }
                remaining = remaining_offer(&remaining, &op.consumed_resources());
                operations.extend(op.wire_operations());
                // A reservation is launched on when it comes back in a later offer.
                if matches!(op, InstanceOp::ReserveAndCreateVolumes { .. }) {
                    break;
                }
            }
        }

        if operations.is_empty() {
            info!(
                reasons = ?reasons,
                "Declining offer, no run spec matched"
            );
            self.driver.decline_offer(&offer.id).await?;
            return Ok(OfferOutcome::Declined { reasons });
        }

        info!(operations = operations.len(), "Accepting offer");
        if let Err(e) = self.driver.accept_offer(&offer.id, operations.clone()).await {
            // Tasks already recorded as launched surface as overdue and are killed.
            error!(error = %e, "Failed to accept offer");
            return Err(e);
        }
        Ok(OfferOutcome::Accepted { operations })
    }

    /// Apply every state op of `op`; false if any of them failed.
    async fn apply_locally(&self, op: &InstanceOp) -> bool {
        for state_op in op.state_ops() {
            let change = self.processor.process(state_op.clone()).await;
            if change.is_failure() {
                warn!(
                    task_id = %state_op.task_id(),
                    kind = op.kind(),
                    change = ?change,
                    "Dropping instance operation, local state change failed"
                );
                return false;
            }
            debug!(task_id = %state_op.task_id(), change = change.kind(), "State op applied");
        }
        true
    }

    async fn run_spec_lock(&self, run_spec_id: &RunSpecId) -> Arc<Mutex<()>> {
        self.run_spec_locks
            .lock()
            .await
            .entry(run_spec_id.clone())
            .or_default()
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MockDriver;
    use crate::factory::FactoryConfig;
    use crate::matcher::ResourceMatcher;
    use crate::model::{
        DiskSource, PortDefinition, PortRange, Resource, ResourceName, ResourceRequirements,
    };
    use crate::processor::{ProcessorConfig, StateOpProcessor};
    use crate::store::{InMemoryTaskRepository, WriteFault};
    use crate::tracker::InMemoryInstanceTracker;
    use keel_id::AgentId;

    struct Fixture {
        tracker: Arc<InMemoryInstanceTracker>,
        repo: Arc<InMemoryTaskRepository>,
        driver: Arc<MockDriver>,
        offers: OfferProcessor,
    }

    fn fixture() -> Fixture {
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
        Fixture {
            tracker,
            repo,
            driver,
            offers,
        }
    }

    fn offer(cpus: f64, mem: f64) -> Offer {
        Offer::new(
            AgentId::new(),
            "agent-1",
            vec![
                Resource::scalar(ResourceName::Cpus, cpus),
                Resource::scalar(ResourceName::Mem, mem),
                Resource::disk(4096.0, DiskSource::Root),
                Resource::ports(vec![PortRange::new(31000, 31010)]),
            ],
        )
    }

    fn app(id: &str, instances: u32) -> RunSpec {
        let mut spec = RunSpec::new(RunSpecId::parse(id).unwrap(), instances);
        spec.resources = ResourceRequirements::new(1.0, 256.0);
        spec.ports = vec![PortDefinition::dynamic()];
        spec
    }

    #[tokio::test]
    async fn test_launches_several_instances_from_one_offer() {
        let f = fixture();
        let web = app("/web", 3);
        f.offers.queue().add(web.clone(), 3).await;

        let outcome = f.offers.process_offer(offer(2.5, 2048.0)).await.unwrap();
        let OfferOutcome::Accepted { operations } = outcome else {
            panic!("expected accept, got {outcome:?}");
        };
        // Only two fit into 2.5 cpus.
        assert_eq!(operations.len(), 2);
        assert_eq!(f.tracker.known_instances(&web.id).await.len(), 2);
        assert_eq!(f.repo.len().await, 2);
        assert_eq!(f.offers.queue().remaining(&web.id).await, 1);
        assert_eq!(f.driver.accepted().await.len(), 1);

        let stats = f.offers.statistics().get(&web.id).await.unwrap();
        assert_eq!(stats.offers_matched, 2);
        assert_eq!(stats.last_no_match, vec![NoOfferMatchReason::InsufficientCpus]);
    }

    #[tokio::test]
    async fn test_declines_unusable_offer() {
        let f = fixture();
        f.offers.queue().add(app("/web", 1), 1).await;

        let outcome = f.offers.process_offer(offer(0.01, 2048.0)).await.unwrap();
        assert_eq!(
            outcome,
            OfferOutcome::Declined {
                reasons: BTreeSet::from([NoOfferMatchReason::InsufficientCpus])
            }
        );
        assert_eq!(f.driver.declined().await.len(), 1);
        assert_eq!(f.tracker.instance_count().await, 0);
    }

    #[tokio::test]
    async fn test_finished_requests_leave_the_queue() {
        let f = fixture();
        let web = app("/web", 1);
        f.offers.queue().add(web.clone(), 1).await;

        f.offers.process_offer(offer(4.0, 2048.0)).await.unwrap();
        assert!(f.offers.queue().list().await.is_empty());

        // Nothing queued: the next offer is declined without reasons.
        let outcome = f.offers.process_offer(offer(4.0, 2048.0)).await.unwrap();
        assert_eq!(
            outcome,
            OfferOutcome::Declined {
                reasons: BTreeSet::new()
            }
        );
    }

    #[tokio::test]
    async fn test_failed_local_apply_drops_operation() {
        let f = fixture();
        f.offers.queue().add(app("/web", 1), 1).await;
        f.repo.fail_next_write(WriteFault::Reject).await;

        let outcome = f.offers.process_offer(offer(4.0, 2048.0)).await.unwrap();
        assert!(matches!(outcome, OfferOutcome::Declined { .. }));
        assert_eq!(f.tracker.instance_count().await, 0);
        assert!(f.driver.accepted().await.is_empty());
    }

    #[tokio::test]
    async fn test_queue_merges_requests() {
        let queue = LaunchQueue::new();
        let mut web = app("/web", 2);
        queue.add(web.clone(), 1).await;
        web.instances = 5;
        queue.add(web.clone(), 2).await;

        let list = queue.list().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].remaining, 3);
        assert_eq!(list[0].run_spec.instances, 5);

        assert!(queue.remove(&web.id).await.is_some());
        assert_eq!(queue.remaining(&web.id).await, 0);
    }
}
