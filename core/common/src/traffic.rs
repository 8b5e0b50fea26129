//! Traffic-analysis queries, their tracked operations and result rows.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::types::{JobHandle, OperationId, OperationStatus};
use crate::{Error, Result};

/// Largest result cap the PCE accepts for one async traffic query.
pub const MAX_RESULTS_LIMIT: u32 = 200_000;

/// Result cap used when the caller does not pick one.
pub const DEFAULT_MAX_RESULTS: u32 = 10_000;

/// Policy decision reported for a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyDecision {
    Allowed,
    PotentiallyBlocked,
    Blocked,
    Unknown,
}

impl PolicyDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::PotentiallyBlocked => "potentially_blocked",
            Self::Blocked => "blocked",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for PolicyDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyDecision {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "allowed" => Self::Allowed,
            "potentially_blocked" => Self::PotentiallyBlocked,
            "blocked" => Self::Blocked,
            _ => Self::Unknown,
        })
    }
}

/// Reference to a PCE object by href.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Href {
    pub href: String,
}

/// One selector of a source or destination filter, in PCE wire form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    /// Pseudo-actor such as `ams` (all managed systems).
    Actors(String),
    Label(Href),
    LabelGroup(Href),
    Workload(Href),
    IpList(Href),
}

/// Include/exclude selectors for one side of a flow.
///
/// `include` is a list of AND-groups; the groups are OR-ed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointFilter {
    pub include: Vec<Vec<Actor>>,
    pub exclude: Vec<Actor>,
}

impl EndpointFilter {
    /// Every managed workload.
    pub fn all_managed() -> Self {
        Self {
            include: vec![vec![Actor::Actors("ams".to_string())]],
            exclude: Vec::new(),
        }
    }
}

/// Port/protocol selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proto: Option<u16>,
}

/// Service include/exclude selectors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceFilter {
    pub include: Vec<PortFilter>,
    pub exclude: Vec<PortFilter>,
}

/// Structured filter of a traffic query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficFilter {
    pub sources: EndpointFilter,
    pub destinations: EndpointFilter,
    pub services: ServiceFilter,
    pub policy_decisions: Vec<PolicyDecision>,
    pub exclude_workloads_from_ip_list_query: bool,
}

impl Default for TrafficFilter {
    /// All managed workloads on both sides, every service, every decision.
    fn default() -> Self {
        Self {
            sources: EndpointFilter::all_managed(),
            destinations: EndpointFilter::all_managed(),
            services: ServiceFilter::default(),
            policy_decisions: vec![
                PolicyDecision::Allowed,
                PolicyDecision::PotentiallyBlocked,
                PolicyDecision::Blocked,
            ],
            exclude_workloads_from_ip_list_query: true,
        }
    }
}

/// A user-defined traffic analysis request. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficQuery {
    pub id: String,
    pub name: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub max_results: u32,
    pub filter: Option<TrafficFilter>,
    pub created_at: DateTime<Utc>,
}

impl TrafficQuery {
    /// Create a query over `[start_date, end_date]`.
    pub fn new(
        name: impl Into<String>,
        start_date: NaiveDate,
        end_date: NaiveDate,
        max_results: u32,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            start_date,
            end_date,
            max_results,
            filter: None,
            created_at: Utc::now(),
        }
    }

    /// Query over the last `days` days ending today.
    pub fn last_days(name: impl Into<String>, days: i64, max_results: u32) -> Self {
        let end = Utc::now().date_naive();
        Self::new(name, end - Duration::days(days), end, max_results)
    }

    /// Attach a structured filter.
    pub fn with_filter(mut self, filter: TrafficFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Filter to send: the explicit one or the default.
    pub fn effective_filter(&self) -> TrafficFilter {
        self.filter.clone().unwrap_or_default()
    }

    /// Number of whole days covered by the window.
    pub fn window_days(&self) -> i64 {
        (self.end_date - self.start_date).num_days()
    }

    /// Validate the query before anything is sent or stored.
    ///
    /// # Errors
    /// - `InvalidQuery` for an empty name, a window shorter than one day,
    ///   or a result cap outside `1..=MAX_RESULTS_LIMIT`
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidQuery("query name cannot be empty".to_string()));
        }
        if self.window_days() < 1 {
            return Err(Error::InvalidQuery(format!(
                "time window {} .. {} must span at least one day",
                self.start_date, self.end_date
            )));
        }
        if self.max_results == 0 || self.max_results > MAX_RESULTS_LIMIT {
            return Err(Error::InvalidQuery(format!(
                "max_results must be between 1 and {MAX_RESULTS_LIMIT}, got {}",
                self.max_results
            )));
        }
        if let Some(filter) = &self.filter {
            if filter.policy_decisions.is_empty() {
                return Err(Error::InvalidQuery(
                    "at least one policy decision is required".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Local record of one remote traffic-analysis job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncOperation {
    pub id: OperationId,
    pub query_id: String,
    pub job_handle: JobHandle,
    pub status: OperationStatus,
    pub submitted_at: DateTime<Utc>,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub poll_attempts: u32,
    pub error_detail: Option<String>,
    /// When the operation reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
    /// When the result rows were materialized, if they were.
    pub results_fetched_at: Option<DateTime<Utc>>,
}

impl AsyncOperation {
    /// Fresh `pending` operation for a submitted query.
    pub fn new_pending(query_id: impl Into<String>, job_handle: JobHandle) -> Self {
        Self {
            id: OperationId::generate(),
            query_id: query_id.into(),
            job_handle,
            status: OperationStatus::Pending,
            submitted_at: Utc::now(),
            last_polled_at: None,
            poll_attempts: 0,
            error_detail: None,
            finished_at: None,
            results_fetched_at: None,
        }
    }
}

/// One row of a completed traffic analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficFlow {
    pub src_ip: Option<String>,
    pub src_workload_id: Option<String>,
    pub dst_ip: Option<String>,
    pub dst_workload_id: Option<String>,
    pub service_name: Option<String>,
    pub port: Option<i32>,
    pub proto: Option<i32>,
    pub policy_decision: PolicyDecision,
    pub flow_direction: Option<String>,
    pub num_connections: u64,
    pub bytes_in: Option<u64>,
    pub bytes_out: Option<u64>,
    pub first_detected: Option<DateTime<Utc>>,
    pub last_detected: Option<DateTime<Utc>>,
    pub rule_href: Option<String>,
}
