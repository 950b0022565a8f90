//! Decision model: what happens to a TaskRun whose attempt just failed.

use std::time::Duration;

use crate::domain::execution::{TaskFailure, TaskRun};
use crate::domain::task::RetryPolicy;

/// The next action for a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Arm a new attempt after `delay`.
    Retry { delay: Duration, reason: String },

    /// Let the TaskRun terminate as FAILED.
    MarkDead { reason: String },
}

/// Deciders are pure functions: given the policy, the run and the failure,
/// they return the next action without side effects. Applying the decision
/// (state changes, timers) is the executor's job.
pub trait Decider: Send + Sync {
    fn decide(&self, policy: Option<&RetryPolicy>, run: &TaskRun, failure: &TaskFailure)
    -> Decision;
}

/// Attempt-count based retry:
/// - Retry if attempts < max_attempt and the failure kind is retriable
/// - Mark dead otherwise
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultDecider;

impl Decider for DefaultDecider {
    fn decide(
        &self,
        policy: Option<&RetryPolicy>,
        run: &TaskRun,
        failure: &TaskFailure,
    ) -> Decision {
        let Some(policy) = policy else {
            return Decision::MarkDead {
                reason: "no retry policy".to_string(),
            };
        };

        let attempts = run.attempt_number();
        if attempts >= policy.max_attempt {
            return Decision::MarkDead {
                reason: format!("max attempts reached: {attempts}/{}", policy.max_attempt),
            };
        }
        if !policy.retries(failure.kind) {
            return Decision::MarkDead {
                reason: format!("{} failure is not retried", failure.kind),
            };
        }

        let delay = policy.backoff.strategy().next_delay(attempts);
        Decision::Retry {
            delay,
            reason: format!(
                "retry attempt {}/{} after {:?}",
                attempts + 1,
                policy.max_attempt,
                delay
            ),
        }
    }
}
