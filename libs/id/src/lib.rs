//! # keel-id
//!
//! Typed identifiers for the keel scheduling core.
//!
//! ## ID Families
//!
//! - **Generated IDs** (`InstanceId`, `AgentId`, `OfferId`) use the prefixed
//!   ULID format `{prefix}_{ulid}`, e.g. `inst_01HV4Z4NYPLTRS0JTUA8XDME5F`.
//! - **Run spec IDs** are user-declared absolute paths such as `/prod/web`.
//! - **Derived IDs** embed the run spec they belong to so that any task or
//!   volume can be traced back to its workload without a lookup:
//!   - `TaskId`: `prod_web.inst_01HV4Z4NYPLTRS0JTUA8XDME5F[.container]`
//!   - `LocalVolumeId`: `prod_web#data#2f1c...`
//!
//! All IDs have a canonical string form with strict parsing, and
//! serialize as that string.

mod error;
mod macros;
mod run_spec;
mod task;
mod types;

pub use error::IdError;
pub use run_spec::RunSpecId;
pub use task::{LocalVolumeId, TaskId};
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
