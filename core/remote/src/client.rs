//! Remote resource client trait definition.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use pcemirror_common::{EntityKind, Error, JobHandle, Resource, Result, TrafficFlow, TrafficQuery};

/// One page of a remote collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Opaque cursor for the next page; `None` ends pagination.
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    /// A page with no successor.
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_cursor: None,
        }
    }
}

/// Job state as reported by the PCE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteJobState {
    Queued,
    Working,
    Completed,
    Failed,
    Killed,
}

impl RemoteJobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Working => "working",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Killed => "killed",
        }
    }
}

impl fmt::Display for RemoteJobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RemoteJobState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" | "pending" => Ok(Self::Queued),
            "working" | "running" => Ok(Self::Working),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "killed" | "cancelled" | "cancel_requested" => Ok(Self::Killed),
            other => Err(Error::remote(None, format!("Unknown job state: {other}"))),
        }
    }
}

/// Status snapshot of a remote job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobStatus {
    pub state: RemoteJobState,
    /// Error text for failed jobs.
    pub detail: Option<String>,
    /// Row count of the result set, once known.
    pub result_rows: Option<u64>,
    /// State of the deep rule analysis; `None` until one is requested.
    pub rules: Option<RemoteJobState>,
}

impl JobStatus {
    pub fn new(state: RemoteJobState) -> Self {
        Self {
            state,
            detail: None,
            result_rows: None,
            rules: None,
        }
    }
}

/// Client for the PCE resource collections and async traffic jobs.
///
/// Implementations map remote payloads to typed records at this boundary and
/// report every non-success answer as [`Error::Remote`].
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Get the client name (e.g., "pce", "memory").
    fn name(&self) -> &str;

    /// Fetch one page of a reference entity collection.
    ///
    /// # Preconditions
    /// - `cursor` is `None` for the first page, or a value returned by the
    ///   previous page of the same collection
    ///
    /// # Errors
    /// - `Remote` on transport failure or non-success status
    async fn list_page(&self, kind: EntityKind, cursor: Option<&str>) -> Result<Page<Resource>>;

    /// Create an async traffic-analysis job.
    ///
    /// # Postconditions
    /// - Returns the handle the PCE assigned to the job
    ///
    /// # Errors
    /// - `Remote` if the job could not be created
    async fn submit_job(&self, query: &TrafficQuery) -> Result<JobHandle>;

    /// Current state of a job.
    async fn get_job_status(&self, handle: &JobHandle) -> Result<JobStatus>;

    /// Fetch one page of a completed job's result set.
    async fn list_result_page(
        &self,
        handle: &JobHandle,
        cursor: Option<&str>,
    ) -> Result<Page<TrafficFlow>>;

    /// Start a deep rule analysis of a completed job.
    ///
    /// Progress shows up in [`JobStatus::rules`]; once it completes, result
    /// pages carry the matching rules. With `label_based` the PCE also
    /// matches label-based rules.
    ///
    /// # Errors
    /// - `Remote` if the PCE did not accept the request
    async fn request_rule_analysis(&self, handle: &JobHandle, label_based: bool) -> Result<()>;

    /// Ask the PCE to stop a job.
    async fn cancel_job(&self, handle: &JobHandle) -> Result<()>;

    /// Cheap authenticated request used as a connectivity check.
    async fn ping(&self) -> Result<()>;
}
