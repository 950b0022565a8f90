//! Retry controller: backoff strategies and the failed-attempt decider.

pub mod backoff;
pub mod decider;

pub use backoff::{BackoffStrategy, ConstantBackoff, ExponentialBackoff};
pub use decider::{Decider, Decision, DefaultDecider};
