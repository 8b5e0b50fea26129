//! In-memory remote client for testing.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use pcemirror_common::{EntityKind, Error, JobHandle, Resource, Result, TrafficFlow, TrafficQuery};

use crate::client::{JobStatus, Page, RemoteClient, RemoteJobState};

/// Behavior of the jobs created by subsequent submissions.
#[derive(Debug, Clone)]
pub struct JobScript {
    /// States reported by successive status checks; the last one repeats.
    pub states: Vec<RemoteJobState>,
    /// Detail reported alongside a `failed` or `killed` state.
    pub detail: Option<String>,
    /// Full result set of the job.
    pub results: Vec<TrafficFlow>,
    /// Rows per result page.
    pub result_page_size: usize,
    /// Number of initial status checks that fail with a transport error.
    pub transient_status_failures: u32,
    /// HTTP statuses of the status checks that follow the transport errors,
    /// one rejected check per entry.
    pub rejected_status_checks: Vec<u16>,
    /// Result pages (zero-based) that fail once with a 502.
    pub failing_result_pages: Vec<usize>,
    /// Rule analysis states reported once an analysis was requested; the
    /// last one repeats.
    pub rule_states: Vec<RemoteJobState>,
    /// Result set served after a completed rule analysis. Defaults to
    /// `results`.
    pub annotated_results: Option<Vec<TrafficFlow>>,
}

impl Default for JobScript {
    fn default() -> Self {
        Self {
            states: vec![RemoteJobState::Completed],
            detail: None,
            results: Vec::new(),
            result_page_size: 1000,
            transient_status_failures: 0,
            rejected_status_checks: Vec::new(),
            failing_result_pages: Vec::new(),
            rule_states: vec![RemoteJobState::Completed],
            annotated_results: None,
        }
    }
}

#[derive(Debug)]
struct MemoryJob {
    query_name: String,
    states: VecDeque<RemoteJobState>,
    detail: Option<String>,
    results: Vec<TrafficFlow>,
    result_page_size: usize,
    transient_failures: u32,
    rejected_checks: VecDeque<u16>,
    failing_result_pages: HashSet<usize>,
    script_rule_states: Vec<RemoteJobState>,
    rule_states: Option<VecDeque<RemoteJobState>>,
    rules_completed: bool,
    annotated_results: Option<Vec<TrafficFlow>>,
    rule_requests: Vec<bool>,
    status_checks: u32,
    result_pages_served: u32,
}

/// Next scripted state; the last one repeats.
fn next_state(states: &mut VecDeque<RemoteJobState>) -> RemoteJobState {
    if states.len() > 1 {
        states.pop_front()
    } else {
        states.front().copied()
    }
    .unwrap_or(RemoteJobState::Queued)
}

#[derive(Debug, Default)]
struct MemoryState {
    entities: HashMap<EntityKind, Vec<Resource>>,
    page_size: usize,
    failing_pages: HashSet<(EntityKind, usize)>,
    pages_served: HashMap<EntityKind, usize>,
    reachable: bool,
    submit_failure: Option<u16>,
    script: JobScript,
    jobs: HashMap<String, MemoryJob>,
    submitted: Vec<JobHandle>,
    cancelled: Vec<JobHandle>,
    next_job: u32,
}

/// Scripted in-memory PCE.
///
/// Entity collections are served in pages of a configurable size; jobs follow
/// the [`JobScript`] active at submission time. Failures can be injected per
/// page, per submission and per status check.
pub struct MemoryRemote {
    state: Mutex<MemoryState>,
}

impl MemoryRemote {
    /// Create an empty remote serving pages of 100 records.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                page_size: 100,
                reachable: true,
                ..Default::default()
            }),
        }
    }

    /// Set the number of records per entity page.
    pub fn with_page_size(self, page_size: usize) -> Self {
        self.state().page_size = page_size.max(1);
        self
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the remote collection of `kind`.
    pub fn set_entities(&self, kind: EntityKind, records: Vec<Resource>) {
        self.state().entities.insert(kind, records);
    }

    /// Make page `page` (zero-based) of `kind` fail with a 503 until cleared.
    pub fn fail_page(&self, kind: EntityKind, page: usize) {
        self.state().failing_pages.insert((kind, page));
    }

    /// Remove every injected page failure.
    pub fn clear_page_failures(&self) {
        self.state().failing_pages.clear();
    }

    /// Make the next submission fail with `status`.
    pub fn fail_next_submit(&self, status: u16) {
        self.state().submit_failure = Some(status);
    }

    /// Set the behavior of jobs submitted from now on.
    pub fn set_job_script(&self, script: JobScript) {
        self.state().script = script;
    }

    /// Toggle connectivity for [`RemoteClient::ping`].
    pub fn set_reachable(&self, reachable: bool) {
        self.state().reachable = reachable;
    }

    /// Handles of every job created so far.
    pub fn submitted_jobs(&self) -> Vec<JobHandle> {
        self.state().submitted.clone()
    }

    /// Handles of every job a cancel was received for.
    pub fn cancelled_jobs(&self) -> Vec<JobHandle> {
        self.state().cancelled.clone()
    }

    /// Number of entity pages served for `kind`, failures included.
    pub fn pages_served(&self, kind: EntityKind) -> usize {
        self.state().pages_served.get(&kind).copied().unwrap_or(0)
    }

    /// Number of status checks received for a job.
    pub fn status_checks(&self, handle: &JobHandle) -> u32 {
        self.state()
            .jobs
            .get(handle.as_str())
            .map_or(0, |job| job.status_checks)
    }

    /// Number of result pages served for a job.
    pub fn result_pages_served(&self, handle: &JobHandle) -> u32 {
        self.state()
            .jobs
            .get(handle.as_str())
            .map_or(0, |job| job.result_pages_served)
    }

    /// `label_based` flag of every rule analysis requested for a job.
    pub fn rule_requests(&self, handle: &JobHandle) -> Vec<bool> {
        self.state()
            .jobs
            .get(handle.as_str())
            .map(|job| job.rule_requests.clone())
            .unwrap_or_default()
    }

    /// Name of the query a job was submitted for.
    pub fn job_query_name(&self, handle: &JobHandle) -> Option<String> {
        self.state()
            .jobs
            .get(handle.as_str())
            .map(|job| job.query_name.clone())
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

fn offset(cursor: Option<&str>) -> Result<usize> {
    cursor.map_or(Ok(0), |c| {
        c.parse()
            .map_err(|_| Error::Serialization(format!("Invalid page cursor: {c}")))
    })
}

fn slice_page<T: Clone>(items: &[T], start: usize, size: usize) -> Page<T> {
    let end = (start + size).min(items.len());
    let page = items.get(start..end).unwrap_or_default().to_vec();
    Page {
        items: page,
        next_cursor: (end < items.len()).then(|| end.to_string()),
    }
}

#[async_trait]
impl RemoteClient for MemoryRemote {
    fn name(&self) -> &str {
        "memory"
    }

    async fn list_page(&self, kind: EntityKind, cursor: Option<&str>) -> Result<Page<Resource>> {
        let start = offset(cursor)?;
        let mut state = self.state();
        let page_index = start / state.page_size;
        *state.pages_served.entry(kind).or_insert(0) += 1;

        if state.failing_pages.contains(&(kind, page_index)) {
            return Err(Error::remote(
                Some(503),
                format!("{kind} page {page_index} unavailable"),
            ));
        }

        let records = state.entities.get(&kind).cloned().unwrap_or_default();
        Ok(slice_page(&records, start, state.page_size))
    }

    async fn submit_job(&self, query: &TrafficQuery) -> Result<JobHandle> {
        let mut state = self.state();
        if let Some(status) = state.submit_failure.take() {
            return Err(Error::remote(Some(status), "job rejected"));
        }

        state.next_job += 1;
        let handle = JobHandle::new(format!(
            "/orgs/1/traffic_flows/async_queries/mem-{}",
            state.next_job
        ));
        let script = state.script.clone();
        state.jobs.insert(
            handle.as_str().to_string(),
            MemoryJob {
                query_name: query.name.clone(),
                states: script.states.into_iter().collect(),
                detail: script.detail,
                results: script.results,
                result_page_size: script.result_page_size.max(1),
                transient_failures: script.transient_status_failures,
                rejected_checks: script.rejected_status_checks.into_iter().collect(),
                failing_result_pages: script.failing_result_pages.into_iter().collect(),
                script_rule_states: script.rule_states,
                rule_states: None,
                rules_completed: false,
                annotated_results: script.annotated_results,
                rule_requests: Vec::new(),
                status_checks: 0,
                result_pages_served: 0,
            },
        );
        state.submitted.push(handle.clone());
        Ok(handle)
    }

    async fn get_job_status(&self, handle: &JobHandle) -> Result<JobStatus> {
        let mut state = self.state();
        let job = state
            .jobs
            .get_mut(handle.as_str())
            .ok_or_else(|| Error::remote(Some(404), format!("Unknown job {handle}")))?;
        job.status_checks += 1;

        if job.transient_failures > 0 {
            job.transient_failures -= 1;
            return Err(Error::remote(None, "connection reset"));
        }
        if let Some(code) = job.rejected_checks.pop_front() {
            return Err(Error::remote(Some(code), "status check rejected"));
        }

        let current = next_state(&mut job.states);
        let mut status = JobStatus::new(current);
        if let Some(rule_states) = job.rule_states.as_mut() {
            let rules = next_state(rule_states);
            job.rules_completed = rules == RemoteJobState::Completed;
            status.rules = Some(rules);
        }
        if matches!(current, RemoteJobState::Failed | RemoteJobState::Killed) {
            status.detail = job.detail.clone();
        }
        if current == RemoteJobState::Completed {
            status.result_rows = Some(job.results.len() as u64);
        }
        Ok(status)
    }

    async fn list_result_page(
        &self,
        handle: &JobHandle,
        cursor: Option<&str>,
    ) -> Result<Page<TrafficFlow>> {
        let start = offset(cursor)?;
        let mut state = self.state();
        let job = state
            .jobs
            .get_mut(handle.as_str())
            .ok_or_else(|| Error::remote(Some(404), format!("Unknown job {handle}")))?;
        job.result_pages_served += 1;

        let page_index = start / job.result_page_size;
        if job.failing_result_pages.remove(&page_index) {
            return Err(Error::remote(
                Some(502),
                format!("result page {page_index} of {handle} unavailable"),
            ));
        }

        let results = match &job.annotated_results {
            Some(annotated) if job.rules_completed => annotated,
            _ => &job.results,
        };
        Ok(slice_page(results, start, job.result_page_size))
    }

    async fn request_rule_analysis(&self, handle: &JobHandle, label_based: bool) -> Result<()> {
        let mut state = self.state();
        let job = state
            .jobs
            .get_mut(handle.as_str())
            .ok_or_else(|| Error::remote(Some(404), format!("Unknown job {handle}")))?;

        job.rule_requests.push(label_based);
        job.rule_states = Some(job.script_rule_states.iter().copied().collect());
        job.rules_completed = false;
        Ok(())
    }

    async fn cancel_job(&self, handle: &JobHandle) -> Result<()> {
        let mut state = self.state();
        if let Some(job) = state.jobs.get_mut(handle.as_str()) {
            job.states = VecDeque::from([RemoteJobState::Killed]);
        }
        state.cancelled.push(handle.clone());
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        if self.state().reachable {
            Ok(())
        } else {
            Err(Error::remote(None, "PCE unreachable"))
        }
    }
}
