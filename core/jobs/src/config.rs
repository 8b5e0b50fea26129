//! Polling configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use pcemirror_common::{Backoff, TrafficFilter, TrafficQuery, DEFAULT_MAX_RESULTS};

/// Window of the default query, in days.
pub const DEFAULT_WINDOW_DAYS: i64 = 7;

/// How long and how often to poll a remote job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollConfig {
    /// Interval schedule between status checks.
    #[serde(default)]
    pub backoff: Backoff,
    /// Local wait budget before the operation is marked `timed_out`.
    #[serde(with = "secs", default = "default_max_wait")]
    pub max_wait: Duration,
    /// Run a deep rule analysis on completed jobs before storing results.
    #[serde(default)]
    pub deep_rule_analysis: bool,
    /// Include label-based rules in the rule analysis.
    #[serde(default)]
    pub label_based_rules: bool,
}

fn default_max_wait() -> Duration {
    Duration::from_secs(30 * 60)
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            backoff: Backoff::new(Duration::from_secs(2), Duration::from_secs(60), 2.0),
            max_wait: default_max_wait(),
            deep_rule_analysis: false,
            label_based_rules: false,
        }
    }
}

impl PollConfig {
    /// Set the wait budget.
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Set the interval schedule.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Enable deep rule analysis of completed jobs.
    pub fn with_rule_analysis(mut self, label_based: bool) -> Self {
        self.deep_rule_analysis = true;
        self.label_based_rules = label_based;
        self
    }
}

/// The stock traffic query: last seven days, managed workloads on both
/// sides, every policy decision, 10 000 rows.
pub fn default_query(name: impl Into<String>) -> TrafficQuery {
    TrafficQuery::last_days(name, DEFAULT_WINDOW_DAYS, DEFAULT_MAX_RESULTS)
        .with_filter(TrafficFilter::default())
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pcemirror_common::PolicyDecision;

    #[test]
    fn test_default_query() {
        let query = default_query("weekly");

        assert!(query.validate().is_ok());
        assert_eq!(query.window_days(), 7);
        assert_eq!(query.max_results, 10_000);
        let filter = query.filter.unwrap();
        assert_eq!(filter.policy_decisions.len(), 3);
        assert!(filter.policy_decisions.contains(&PolicyDecision::Blocked));
    }

    #[test]
    fn test_poll_config_serde() {
        let config: PollConfig = serde_json::from_str(r#"{"max_wait": 90}"#).unwrap();
        assert_eq!(config.max_wait, Duration::from_secs(90));
        assert_eq!(config.backoff, Backoff::default());
        assert!(!config.deep_rule_analysis);

        let json = serde_json::to_value(PollConfig::default()).unwrap();
        assert_eq!(json["max_wait"], 1800);
    }
}
