//! keel scheduler
//!
//! Wires the scheduling core together: repository, tracker, state op
//! processor, offer pipeline and the overdue monitor. The resource manager
//! connection is the mock driver until a real one is configured.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use keel_scheduler::config::Config;
use keel_scheduler::driver::MockDriver;
use keel_scheduler::kill::DriverKillService;
use keel_scheduler::monitor::OverdueMonitor;
use keel_scheduler::store::InMemoryTaskRepository;
use keel_scheduler::tracker::InMemoryInstanceTracker;
use keel_scheduler::{InstanceOpFactory, LaunchQueue, OfferProcessor, ResourceMatcher, StateOpProcessor};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        framework_id = %config.framework_id,
        reservation_role = %config.reservation_role,
        shards = config.processor_shards,
        "Starting keel scheduler"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let repository = Arc::new(InMemoryTaskRepository::new());
    let tracker = Arc::new(InMemoryInstanceTracker::load(repository.as_ref()).await?);
    let processor = Arc::new(StateOpProcessor::start(
        config.processor(),
        tracker.clone(),
        repository.clone(),
    ));
    let driver = Arc::new(MockDriver::new());

    let factory = InstanceOpFactory::new(config.factory()?, ResourceMatcher::new(config.gpu_scheduling));
    let offers = Arc::new(OfferProcessor::new(
        factory,
        tracker.clone(),
        processor.clone(),
        driver.clone(),
        Arc::new(LaunchQueue::new()),
    ));
    info!(queued = offers.queue().list().await.len(), "Offer pipeline ready");

    let monitor = OverdueMonitor::new(
        config.monitor(),
        tracker.clone(),
        processor.clone(),
        Arc::new(DriverKillService::new(driver)),
    );
    let mut monitor_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { monitor.run(shutdown_rx).await }
    });

    let monitor_done = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            false
        }
        result = &mut monitor_handle => {
            if let Err(e) = result {
                error!(error = %e, "Overdue monitor panicked");
            }
            true
        }
    };

    if let Err(e) = shutdown_tx.send(true) {
        debug!(error = %e, "No workers left to signal");
    }
    if !monitor_done {
        if let Err(e) = monitor_handle.await {
            error!(error = %e, "Overdue monitor panicked");
        }
    }
    processor.shutdown().await;

    info!("Scheduler shutdown complete");
    Ok(())
}
