//! keel scheduler core
//!
//! Turns resource offers into launch and reservation operations, and keeps
//! the in-memory view of tasks in agreement with the task repository.
//!
//! ## Architecture
//!
//! ```text
//! Offer ──► OfferProcessor ──► InstanceOpFactory ──► ResourceMatcher
//!                │                      │
//!                │               InstanceOp (wire ops + state ops)
//!                ▼                      │
//!        ResourceManagerDriver ◄────────┤
//!                                       ▼
//!                              StateOpProcessor ──► resolve ──► InstanceTracker
//!                                       │
//!                                       └──► TaskRepository (with reload on failure)
//!
//! OverdueMonitor ──► KillService / StateOpProcessor
//! ```
//!
//! ## Modules
//!
//! - `matcher`: offer resources vs run spec requirements
//! - `factory`: the operation to run for an offer
//! - `state`: state ops and the pure resolver
//! - `processor`: per-task sequential application of state ops
//! - `monitor`: overdue launches, reservation timeouts, unreachable tasks

pub mod config;
pub mod driver;
pub mod factory;
pub mod kill;
pub mod matcher;
pub mod model;
pub mod monitor;
pub mod offers;
pub mod ops;
pub mod processor;
pub mod state;
pub mod store;
pub mod tracker;

pub use factory::{BuildOutcome, FactoryConfig, InstanceOpFactory};
pub use matcher::{GpuSchedulingBehavior, NoOfferMatchReason, ResourceMatcher};
pub use offers::{LaunchQueue, OfferOutcome, OfferProcessor};
pub use processor::{ProcessorConfig, StateOpProcessor, StateOpSink};
pub use state::{StateChangeError, TaskStateChange, TaskStateOp};
