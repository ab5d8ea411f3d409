//! Reconciliation primitives.
//!
//! Helpers for keeping an in-memory view and a persisted view of the same
//! entity in agreement when writes can fail. Key concepts:
//!
//! - **Intent**: what the store should contain after a write (a value, or nothing).
//! - **Observation**: what a reload of the store actually returned.
//! - **Convergence**: the observation equals the intent, even though the
//!   write itself reported an error.
//!
//! # Invariants
//!
//! - Convergence checks are pure and deterministic
//! - Every store call made through [`with_timeout`] finishes in bounded time

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

/// Reconciliation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// Timeout waiting for a store call.
    #[error("timeout after {elapsed:?} waiting for {resource}")]
    Timeout {
        resource: String,
        elapsed: Duration,
    },

    /// The wrapped call failed.
    #[error("{resource}: {message}")]
    Failed { resource: String, message: String },
}

impl ReconcileError {
    /// Returns true if the call did not finish in time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Outcome of comparing a reload against the intended state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Store content matches the intent.
    Converged,

    /// Store content contradicts the intent.
    Diverged,

    /// Status is unknown (the reload itself failed).
    Unknown,
}

impl ConvergenceStatus {
    /// Returns true if the store has converged.
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }
}

/// The state a store entry should be in once a write has been applied.
#[derive(Debug, Clone, PartialEq)]
pub enum Intent<T> {
    /// The entry should exist with exactly this value.
    Present(T),

    /// The entry should not exist.
    Absent,
}

impl<T: PartialEq> Intent<T> {
    /// Compare a reloaded entry against the intent.
    pub fn check(&self, observed: Option<&T>) -> ConvergenceStatus {
        match (self, observed) {
            (Intent::Absent, None) => ConvergenceStatus::Converged,
            (Intent::Present(expected), Some(actual)) if expected == actual => {
                ConvergenceStatus::Converged
            }
            _ => ConvergenceStatus::Diverged,
        }
    }

    /// Compare the result of a reload, mapping a failed reload to `Unknown`.
    pub fn check_reload<E>(&self, reloaded: &Result<Option<T>, E>) -> ConvergenceStatus {
        match reloaded {
            Ok(observed) => self.check(observed.as_ref()),
            Err(_) => ConvergenceStatus::Unknown,
        }
    }
}

/// Run a fallible store call with an upper bound on its duration.
///
/// Errors of the call are flattened to [`ReconcileError::Failed`] so that a
/// timeout and a failure can be reported the same way.
pub async fn with_timeout<T, E, F>(
    limit: Duration,
    resource: impl Into<String>,
    call: F,
) -> Result<T, ReconcileError>
where
    F: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let resource = resource.into();
    match tokio::time::timeout(limit, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(ReconcileError::Failed {
            resource,
            message: e.to_string(),
        }),
        Err(_) => Err(ReconcileError::Timeout {
            resource,
            elapsed: limit,
        }),
    }
}

/// Default timeout for a single store call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default deadline for a queued state operation.
pub const DEFAULT_OP_DEADLINE: Duration = Duration::from_secs(10);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_intent() {
        let intent: Intent<u32> = Intent::Absent;
        assert_eq!(intent.check(None), ConvergenceStatus::Converged);
        assert_eq!(intent.check(Some(&1)), ConvergenceStatus::Diverged);
    }

    #[test]
    fn test_present_intent() {
        let intent = Intent::Present("v2".to_string());
        assert!(intent.check(Some(&"v2".to_string())).is_converged());
        assert_eq!(
            intent.check(Some(&"v1".to_string())),
            ConvergenceStatus::Diverged
        );
        assert_eq!(intent.check(None), ConvergenceStatus::Diverged);
    }

    #[test]
    fn test_failed_reload_is_unknown() {
        let intent: Intent<u32> = Intent::Absent;
        let reloaded: Result<Option<u32>, &str> = Err("boom");
        assert_eq!(intent.check_reload(&reloaded), ConvergenceStatus::Unknown);
        assert!(intent.check_reload::<&str>(&Ok(None)).is_converged());
    }

    #[tokio::test]
    async fn test_with_timeout_passes_value() {
        let value = with_timeout(Duration::from_millis(100), "task", async {
            Ok::<_, String>(7)
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_with_timeout_wraps_error() {
        let err = with_timeout(Duration::from_millis(100), "task/a", async {
            Err::<(), _>("disk full")
        })
        .await
        .unwrap_err();
        assert_eq!(
            err,
            ReconcileError::Failed {
                resource: "task/a".to_string(),
                message: "disk full".to_string()
            }
        );
        assert!(!err.is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_expires() {
        let err = with_timeout(Duration::from_millis(50), "task/b", async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, String>(())
        })
        .await
        .unwrap_err();
        assert!(err.is_timeout());
    }
}
