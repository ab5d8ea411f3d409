//! Task lifecycle conditions.
//!
//! ## State Machine
//!
//! ```text
//!            Reserved ──launch──┐
//!                               v
//! (none) ──launch──> Created -> Staging -> Starting -> Running -> Killing
//!                       |          |           |          |          |
//!                       +----------+-----+-----+----------+----------+
//!                                        v
//!        Finished | Failed | Killed | Error | Gone | Dropped | Unknown   (terminal)
//!
//! Unreachable --(monitor, after inactive_after)--> UnreachableInactive
//! ```

use serde::{Deserialize, Serialize};

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Reserved,
    Created,
    Staging,
    Starting,
    Running,
    Killing,
    Killed,
    Finished,
    Failed,
    Error,
    Gone,
    Dropped,
    Unreachable,
    UnreachableInactive,
    Unknown,
}

impl Condition {
    /// Every condition, in declaration order.
    pub const ALL: [Condition; 15] = [
        Condition::Reserved,
        Condition::Created,
        Condition::Staging,
        Condition::Starting,
        Condition::Running,
        Condition::Killing,
        Condition::Killed,
        Condition::Finished,
        Condition::Failed,
        Condition::Error,
        Condition::Gone,
        Condition::Dropped,
        Condition::Unreachable,
        Condition::UnreachableInactive,
        Condition::Unknown,
    ];

    /// No further transition is accepted once a task is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Error
                | Self::Failed
                | Self::Finished
                | Self::Killed
                | Self::Gone
                | Self::Dropped
                | Self::Unknown
        )
    }

    /// The task occupies (or is about to occupy) agent resources.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Created
                | Self::Staging
                | Self::Starting
                | Self::Running
                | Self::Killing
                | Self::Unreachable
        )
    }

    /// Contact with the task has been lost.
    pub fn is_lost(&self) -> bool {
        matches!(
            self,
            Self::Gone | Self::Unreachable | Self::Unknown | Self::Dropped
        )
    }

    /// Ordering used to aggregate task conditions into an instance
    /// condition. Lower ranks win: an instance is only as far along as its
    /// least progressed task, and any failure dominates.
    pub(crate) fn aggregation_rank(&self) -> u8 {
        match self {
            Self::Error => 0,
            Self::Failed => 1,
            Self::Gone => 2,
            Self::Dropped => 3,
            Self::Unknown => 4,
            Self::Killed => 5,
            Self::Killing => 6,
            Self::UnreachableInactive => 7,
            Self::Unreachable => 8,
            Self::Reserved => 9,
            Self::Created => 10,
            Self::Staging => 11,
            Self::Starting => 12,
            Self::Running => 13,
            Self::Finished => 14,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reserved => "reserved",
            Self::Created => "created",
            Self::Staging => "staging",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Killing => "killing",
            Self::Killed => "killed",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Error => "error",
            Self::Gone => "gone",
            Self::Dropped => "dropped",
            Self::Unreachable => "unreachable",
            Self::UnreachableInactive => "unreachable_inactive",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_and_active_are_disjoint() {
        for condition in Condition::ALL {
            assert!(
                !(condition.is_terminal() && condition.is_active()),
                "{condition} is both terminal and active"
            );
        }
    }

    #[test]
    fn test_classification_sets() {
        let terminal: Vec<_> = Condition::ALL.iter().filter(|c| c.is_terminal()).collect();
        let active: Vec<_> = Condition::ALL.iter().filter(|c| c.is_active()).collect();
        let lost: Vec<_> = Condition::ALL.iter().filter(|c| c.is_lost()).collect();
        assert_eq!(terminal.len(), 7);
        assert_eq!(active.len(), 6);
        assert_eq!(lost.len(), 4);
    }

    #[test]
    fn test_reserved_and_inactive_are_unclassified() {
        for condition in [Condition::Reserved, Condition::UnreachableInactive] {
            assert!(!condition.is_terminal());
            assert!(!condition.is_active());
        }
    }

    #[test]
    fn test_aggregation_ranks_unique() {
        let ranks: std::collections::HashSet<_> =
            Condition::ALL.iter().map(|c| c.aggregation_rank()).collect();
        assert_eq!(ranks.len(), Condition::ALL.len());
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&Condition::UnreachableInactive).unwrap();
        assert_eq!(json, "\"unreachable_inactive\"");
    }
}
