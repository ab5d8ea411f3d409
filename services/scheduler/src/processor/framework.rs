//! Minimal actor framework.
//!
//! Provides the building blocks the state op processor runs on:
//! - `Actor` trait for defining actor behavior
//! - `ActorHandle` for sending messages to actors
//! - `ShardedPool` for routing keyed messages to a fixed set of actors

use std::collections::hash_map::DefaultHasher;
use std::fmt::Debug;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

// =============================================================================
// Core Traits
// =============================================================================

/// Marker trait for actor messages.
pub trait Message: Send + Debug + 'static {}

impl<T: Send + Debug + 'static> Message for T {}

/// The Actor trait defines behavior for an actor.
///
/// Actors:
/// - Process messages one at a time (no internal concurrency)
/// - Own mutable state not shared with other actors
/// - Communicate only via message passing
#[async_trait]
pub trait Actor: Send + 'static {
    /// The message type this actor handles.
    type Message: Message;

    /// Actor name for logging.
    fn name(&self) -> &str;

    /// Handle a single message. Failures are reported through the message
    /// itself, so handling never stops the actor.
    async fn handle(&mut self, msg: Self::Message);
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum ActorError {
    #[error("actor stopped")]
    ActorStopped,
}

// =============================================================================
// Actor Handle
// =============================================================================

/// Handle for sending messages to an actor.
pub struct ActorHandle<M: Message> {
    tx: mpsc::Sender<M>,
}

impl<M: Message> Clone for ActorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<M: Message> ActorHandle<M> {
    /// Send a message, waiting for mailbox capacity.
    pub async fn send(&self, msg: M) -> Result<(), ActorError> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| ActorError::ActorStopped)
    }
}

/// Running actor task plus its shutdown switch.
struct ActorRef {
    actor_id: String,
    task_handle: tokio::task::JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl ActorRef {
    fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    fn is_running(&self) -> bool {
        !self.task_handle.is_finished()
    }

    fn abort(&self) {
        self.task_handle.abort();
    }
}

// =============================================================================
// Sharded Pool
// =============================================================================

/// Fixed set of actors of one kind; every key maps to the same actor for
/// the lifetime of the pool, so messages for a key are handled in order.
pub struct ShardedPool<M: Message> {
    handles: Vec<ActorHandle<M>>,
    refs: Vec<ActorRef>,
}

impl<M: Message> ShardedPool<M> {
    /// Spawn `shards` actors built by `make`, each with its own mailbox.
    pub fn spawn<A, F>(shards: usize, mailbox_size: usize, mut make: F) -> Self
    where
        A: Actor<Message = M>,
        F: FnMut(usize) -> A,
    {
        let shards = shards.max(1);
        let mut handles = Vec::with_capacity(shards);
        let mut refs = Vec::with_capacity(shards);

        for index in 0..shards {
            let actor = make(index);
            let actor_id = format!("{}_{index}", actor.name());
            let (tx, rx) = mpsc::channel(mailbox_size.max(1));
            let (shutdown_tx, shutdown_rx) = watch::channel(false);

            let loop_id = actor_id.clone();
            let task_handle = tokio::spawn(async move {
                run_actor_loop(actor, rx, shutdown_rx, loop_id).await;
            });

            handles.push(ActorHandle { tx });
            refs.push(ActorRef {
                actor_id,
                task_handle,
                shutdown_tx,
            });
        }

        info!(shards, mailbox_size, "Spawned actor pool");
        Self { handles, refs }
    }

    /// Actor responsible for `key`.
    pub fn route<K: Hash + ?Sized>(&self, key: &K) -> &ActorHandle<M> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let len = self.handles.len() as u64;
        // `handles` is never empty and the index is below its length.
        let index = usize::try_from(hasher.finish() % len).unwrap_or(0);
        &self.handles[index]
    }

    /// Stop every actor, aborting those still busy after `grace`.
    pub async fn stop_all(&self, grace: Duration) {
        info!(count = self.refs.len(), "Stopping actor pool");
        for actor in &self.refs {
            actor.stop();
        }

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if self.refs.iter().all(|r| !r.is_running()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        for actor in &self.refs {
            if actor.is_running() {
                warn!(actor_id = %actor.actor_id, "Force aborting actor");
                actor.abort();
            }
        }
    }
}

// =============================================================================
// Actor Loop
// =============================================================================

async fn run_actor_loop<A: Actor>(
    mut actor: A,
    mut rx: mpsc::Receiver<A::Message>,
    mut shutdown: watch::Receiver<bool>,
    actor_id: String,
) {
    let mut messages_processed: u64 = 0;
    debug!(actor_id = %actor_id, "Actor started");

    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                // A dropped sender means the pool itself is gone.
                if changed.is_err() || *shutdown.borrow() {
                    info!(actor_id = %actor_id, "Actor received shutdown signal");
                    break;
                }
            }

            msg = rx.recv() => {
                let Some(msg) = msg else {
                    debug!(actor_id = %actor_id, "Actor mailbox closed");
                    break;
                };
                messages_processed += 1;
                actor.handle(msg).await;
            }
        }
    }

    info!(
        actor_id = %actor_id,
        messages_processed,
        "Actor stopped"
    );
}

// =============================================================================
// Tests
// =============================================================================
