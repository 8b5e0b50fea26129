//! Bounded exponential backoff schedule.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential delay schedule capped at `max_delay`.
///
/// The schedule itself is deterministic and non-decreasing; callers that
/// want jitter apply it on top.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    /// Delay before the first retry / between the first two polls.
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    /// Cap for exponential growth.
    #[serde(with = "millis")]
    pub max_delay: Duration,
    /// Growth factor per attempt. Values below 1.0 are treated as 1.0.
    pub multiplier: f64,
}

impl Backoff {
    /// Create a schedule.
    pub fn new(initial_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier,
        }
    }

    /// Set initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set growth factor.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Delay for a zero-based attempt number.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = if self.multiplier.is_finite() {
            self.multiplier.max(1.0)
        } else {
            1.0
        };
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let base = self.initial_delay.as_millis() as f64 * multiplier.powi(exponent);
        let cap = self.max_delay.max(self.initial_delay).as_millis() as f64;

        Duration::from_millis(base.min(cap) as u64)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 2.0)
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
