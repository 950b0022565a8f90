//! Backoff strategies: decide the delay before the next attempt.

use std::time::Duration;

use crate::domain::task::Backoff;

/// Pluggable delay policy. The retry controller only ever calls `next_delay`.
pub trait BackoffStrategy: Send + Sync {
    /// Delay before attempt `attempts + 1`.
    ///
    /// # Arguments
    /// * `attempts` - Number of attempts already made (1-indexed).
    fn next_delay(&self, attempts: u32) -> Duration;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConstantBackoff {
    pub interval: Duration,
}

impl BackoffStrategy for ConstantBackoff {
    fn next_delay(&self, _attempts: u32) -> Duration {
        self.interval
    }
}

/// delay = interval * multiplier^(attempts - 1), capped by `max_interval`.
///
/// Example with interval=2s, multiplier=2.0:
/// - attempt 1 (first failure): 2s
/// - attempt 2: 4s
/// - attempt 3: 8s
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialBackoff {
    pub interval: Duration,
    pub multiplier: f64,
    pub max_interval: Option<Duration>,
}

impl BackoffStrategy for ExponentialBackoff {
    fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.interval.as_secs_f64() * self.multiplier.powi(exponent);
        // inf / NaN は上限扱い
        let delay = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);
        match self.max_interval {
            Some(max) => delay.min(max),
            None => delay,
        }
    }
}

impl Backoff {
    pub fn strategy(&self) -> Box<dyn BackoffStrategy> {
        match *self {
            Backoff::Constant { interval_ms } => Box::new(ConstantBackoff {
                interval: Duration::from_millis(interval_ms),
            }),
            Backoff::Exponential {
                interval_ms,
                multiplier,
                max_interval_ms,
            } => Box::new(ExponentialBackoff {
                interval: Duration::from_millis(interval_ms),
                multiplier,
                max_interval: max_interval_ms.map(Duration::from_millis),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn constant_backoff_never_changes() {
        let backoff = ConstantBackoff {
            interval: Duration::from_millis(500),
        };
        assert_eq!(backoff.next_delay(1), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(9), Duration::from_millis(500));
    }

    #[rstest]
    #[case::first(1, Duration::from_secs(2))]
    #[case::second(2, Duration::from_secs(4))]
    #[case::third(3, Duration::from_secs(8))]
    #[case::zero_uses_base(0, Duration::from_secs(2))]
    fn exponential_backoff_doubles(#[case] attempts: u32, #[case] expected: Duration) {
        let backoff = ExponentialBackoff {
            interval: Duration::from_secs(2),
            multiplier: 2.0,
            max_interval: None,
        };
        assert_eq!(backoff.next_delay(attempts), expected);
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let backoff = ExponentialBackoff {
            interval: Duration::from_secs(1),
            multiplier: 10.0,
            max_interval: Some(Duration::from_secs(30)),
        };
        assert_eq!(backoff.next_delay(2), Duration::from_secs(10));
        assert_eq!(backoff.next_delay(3), Duration::from_secs(30));
        assert_eq!(backoff.next_delay(500), Duration::from_secs(30));
    }

    #[test]
    fn declarative_backoff_builds_matching_strategy() {
        let backoff = Backoff::Exponential {
            interval_ms: 100,
            multiplier: 3.0,
            max_interval_ms: None,
        };
        assert_eq!(backoff.strategy().next_delay(3), Duration::from_millis(900));
    }
}
