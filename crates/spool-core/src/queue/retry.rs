//! Retry policy: decides when a failed message becomes due again.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Exponential backoff anchored at `FirstSeen`.
///
/// `NextAttempt = FirstSeen + unit * base^attempt`, capped at `max_delay`.
///
/// Example with base=1.3, unit=1s:
/// - attempt 2: FirstSeen + 1.69s
/// - attempt 5: FirstSeen + 3.71s
/// - attempt 20: FirstSeen + 190s
/// - attempt 40: FirstSeen + 10h
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Growth factor. Values above 1.0 make `NextAttempt` non-decreasing in `attempt`.
    pub base: f64,

    pub unit_ms: u64,

    pub max_delay_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: 1.3,
            unit_ms: 1_000,
            max_delay_secs: 7 * 24 * 60 * 60,
        }
    }
}

impl RetryPolicy {
    pub fn new(base: f64, unit: Duration, max_delay: Duration) -> Self {
        Self {
            base,
            unit_ms: u64::try_from(unit.as_millis()).unwrap_or(u64::MAX),
            max_delay_secs: max_delay.as_secs(),
        }
    }

    pub fn unit(&self) -> Duration {
        Duration::from_millis(self.unit_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }

    /// Offset from `FirstSeen` for the given attempt number.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let secs = self.unit().as_secs_f64() * self.base.powi(exponent);
        let max = self.max_delay();
        if !secs.is_finite() || secs < 0.0 || secs >= max.as_secs_f64() {
            return max;
        }
        Duration::from_secs_f64(secs)
    }

    pub fn next_attempt(&self, first_seen: DateTime<Utc>, attempt: u32) -> DateTime<Utc> {
        TimeDelta::from_std(self.delay_for(attempt))
            .ok()
            .and_then(|delay| first_seen.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
