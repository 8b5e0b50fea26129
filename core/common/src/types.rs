//! Identifiers and enumerations shared by every mirror component.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Reference entity types mirrored from the PCE.
///
/// Ordering follows declaration order, which is also the order a full pass
/// visits the types in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Workload,
    Label,
    IpList,
    Service,
    LabelGroup,
}

impl EntityKind {
    /// Every entity type, in pass order.
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Workload,
        EntityKind::Label,
        EntityKind::IpList,
        EntityKind::Service,
        EntityKind::LabelGroup,
    ];

    /// Collection name as used by the PCE API and by the local schema.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Workload => "workloads",
            Self::Label => "labels",
            Self::IpList => "ip_lists",
            Self::Service => "services",
            Self::LabelGroup => "label_groups",
        }
    }

    /// Whether the collection lives under a policy version (`sec_policy/draft/...`).
    pub fn is_policy_object(&self) -> bool {
        matches!(self, Self::IpList | Self::Service | Self::LabelGroup)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "workload" | "workloads" => Ok(Self::Workload),
            "label" | "labels" => Ok(Self::Label),
            "ip_list" | "ip_lists" | "iplist" | "iplists" => Ok(Self::IpList),
            "service" | "services" => Ok(Self::Service),
            "label_group" | "label_groups" => Ok(Self::LabelGroup),
            other => Err(Error::NotFound(format!("Unknown entity type: {other}"))),
        }
    }
}

/// Status of a tracked remote job.
///
/// ```text
/// pending ──► running ──► completed | failed | timed_out
///    │           │
///    ├──► failed | timed_out
///    └───────────┴──► cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Submitted, remote job not started yet.
    Pending,
    /// Remote job is executing.
    Running,
    /// Remote job finished; results can be fetched.
    Completed,
    /// Remote job reported an error.
    Failed,
    /// Local wait budget exhausted; the remote job may still be running.
    TimedOut,
    /// Cancelled by the caller.
    Cancelled,
}

impl OperationStatus {
    /// Stable string encoding used in the store and on the CLI.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }

    /// No transition leaves a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }

    /// Whether `next` is reachable from `self` in a single step.
    pub fn can_transition_to(&self, next: OperationStatus) -> bool {
        use OperationStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Pending, TimedOut)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, TimedOut)
                | (Running, Cancelled)
        )
    }

    /// Check a transition, producing the typed error when it is not allowed.
    pub fn check_transition(&self, next: OperationStatus) -> Result<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                from: *self,
                to: next,
            })
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timed_out" => Ok(Self::TimedOut),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(Error::Serialization(format!(
                "Unknown operation status: {other}"
            ))),
        }
    }
}

/// Local identifier of an [`AsyncOperation`](crate::AsyncOperation).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(String);

impl OperationId {
    /// Generate a fresh identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Wrap an existing identifier.
    ///
    /// # Errors
    /// - Returns error if id is empty
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(Error::NotFound("OperationId cannot be empty".to_string()));
        }
        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Remote handle of an asynchronous job: the href the PCE returned on creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle(String);

impl JobHandle {
    /// Wrap a remote href.
    pub fn new(href: impl Into<String>) -> Self {
        Self(href.into())
    }

    /// The href as returned by the PCE.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Trailing identifier of the href.
    pub fn remote_id(&self) -> Option<&str> {
        id_from_href(&self.0)
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Extract the stable identifier from a PCE href (`/orgs/1/labels/42` -> `42`).
pub fn id_from_href(href: &str) -> Option<&str> {
    href.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|id| !id.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_kind_parse() {
        assert_eq!("labels".parse::<EntityKind>().unwrap(), EntityKind::Label);
        assert_eq!("ip-lists".parse::<EntityKind>().unwrap(), EntityKind::IpList);
        assert_eq!(
            "Label_Groups".parse::<EntityKind>().unwrap(),
            EntityKind::LabelGroup
        );
        assert!("rulesets".parse::<EntityKind>().is_err());
    }

    #[test]
    fn test_entity_kind_roundtrip() {
        for kind in EntityKind::ALL {
            assert_eq!(kind.as_str().parse::<EntityKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_terminal_states_are_closed() {
        let all = [
            OperationStatus::Pending,
            OperationStatus::Running,
            OperationStatus::Completed,
            OperationStatus::Failed,
            OperationStatus::TimedOut,
            OperationStatus::Cancelled,
        ];
        for from in all.iter().filter(|s| s.is_terminal()) {
            for to in all {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be rejected");
                assert!(matches!(
                    from.check_transition(to),
                    Err(Error::InvalidTransition { .. })
                ));
            }
        }
    }

    #[test]
    fn test_allowed_transitions() {
        use OperationStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Running.can_transition_to(Pending));
        assert!(!Running.can_transition_to(Running));
    }

    #[test]
    fn test_status_string_roundtrip() {
        for status in [
            OperationStatus::Pending,
            OperationStatus::TimedOut,
            OperationStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<OperationStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_id_from_href() {
        assert_eq!(id_from_href("/orgs/1/labels/42"), Some("42"));
        assert_eq!(
            id_from_href("/orgs/1/traffic_flows/async_queries/abc-def/"),
            Some("abc-def")
        );
        assert_eq!(id_from_href(""), None);
    }

    #[test]
    fn test_operation_id_empty_fails() {
        assert!(OperationId::new("  ").is_err());
        assert_ne!(OperationId::generate(), OperationId::generate());
    }
}
