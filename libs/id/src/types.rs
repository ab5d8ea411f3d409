//! Generated ID definitions.
//!
//! Each ID type has a unique prefix that identifies the resource type.
//! IDs are ULID-based for sortability and uniqueness.

use crate::define_id;

define_id!(
    /// Placement unit created when an instance operation is accepted.
    InstanceId,
    "inst"
);

define_id!(
    /// Compute agent offering resources.
    AgentId,
    "agent"
);

define_id!(
    /// Single-use resource offer.
    OfferId,
    "offer"
);
