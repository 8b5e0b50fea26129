//! Lifecycle of remote traffic-analysis jobs.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pcemirror_common::{
    AsyncOperation, Backoff, Error, OperationId, OperationStatus, Result, TrafficFlow, TrafficQuery,
};
use pcemirror_remote::{JobStatus, RemoteClient, RemoteJobState};
use pcemirror_store::{FlowInsert, Store};

use crate::config::PollConfig;

/// Cancellation token shared by the poll loops of one operation.
struct ActivePoll {
    token: CancellationToken,
    loops: usize,
}

/// Drives traffic queries from submission to materialized results.
///
/// Status changes go through the store, which rejects transitions the state
/// machine does not allow. Running poll loops register a cancellation token
/// per operation so [`JobEngine::cancel`] can wake them without waiting out
/// the current interval.
pub struct JobEngine<R: RemoteClient + ?Sized> {
    remote: Arc<R>,
    store: Arc<Store>,
    poll: PollConfig,
    active: Mutex<HashMap<OperationId, ActivePoll>>,
}

impl<R: RemoteClient + ?Sized> JobEngine<R> {
    /// Create a job engine with the given polling defaults.
    pub fn new(remote: Arc<R>, store: Arc<Store>, poll: PollConfig) -> Self {
        Self {
            remote,
            store,
            poll,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Polling defaults used by [`run`](Self::run) and [`wait`](Self::wait).
    pub fn poll_config(&self) -> &PollConfig {
        &self.poll
    }

    /// Submit a query and record it as a `pending` operation.
    ///
    /// # Errors
    /// - `InvalidQuery` if the query is malformed; nothing is sent
    /// - `Submission` if the remote did not create a job; nothing is stored
    pub async fn submit(&self, query: &TrafficQuery) -> Result<OperationId> {
        query.validate()?;

        let handle = self
            .remote
            .submit_job(query)
            .await
            .map_err(|e| Error::Submission(e.to_string()))?;

        let operation = AsyncOperation::new_pending(&query.id, handle.clone());
        if let Err(e) = self.store.create_operation(query, &operation) {
            warn!("Failed to record job {}, cancelling it: {}", handle, e);
            if let Err(cancel_err) = self.remote.cancel_job(&handle).await {
                warn!("Failed to cancel orphaned job {}: {}", handle, cancel_err);
            }
            return Err(e);
        }

        info!(
            "Submitted query '{}' as operation {} ({})",
            query.name, operation.id, handle
        );
        Ok(operation.id)
    }

    /// Submit a query and wait for it with the configured defaults.
    pub async fn run(&self, query: &TrafficQuery) -> Result<AsyncOperation> {
        let id = self.submit(query).await?;
        self.wait(&id).await
    }

    /// Poll an operation with the configured defaults.
    pub async fn wait(&self, id: &OperationId) -> Result<AsyncOperation> {
        self.poll_until_terminal(id, self.poll.max_wait, &self.poll.backoff)
            .await
    }

    /// Poll the remote job until the operation reaches a terminal state.
    ///
    /// A `completed` job has its results fetched before this returns. When
    /// `max_wait` runs out the operation is marked `timed_out`; the remote
    /// job is left alone. Only a remote `failed` or `killed` state marks the
    /// operation `failed`: a status check rejected outright (expired
    /// credentials, say) ends the call with that error and leaves the
    /// operation open for a later poll.
    pub async fn poll_until_terminal(
        &self,
        id: &OperationId,
        max_wait: Duration,
        backoff: &Backoff,
    ) -> Result<AsyncOperation> {
        let token = self.register(id);
        let result = self.poll_loop(id, max_wait, backoff, &token).await;
        self.unregister(id);
        result
    }

    async fn poll_loop(
        &self,
        id: &OperationId,
        max_wait: Duration,
        backoff: &Backoff,
        token: &CancellationToken,
    ) -> Result<AsyncOperation> {
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            let operation = self.store.get_operation(id)?;
            if operation.status.is_terminal() {
                return self.settle(operation).await;
            }

            let operation = self.store.record_poll(id)?;
            match self.remote.get_job_status(&operation.job_handle).await {
                Ok(status) => {
                    if let Some(done) = self.apply_status(&operation, status).await? {
                        return Ok(done);
                    }
                }
                Err(e) if e.is_transient() => {
                    warn!("Status check {} for {} failed: {}", operation.poll_attempts, id, e);
                }
                Err(e) => {
                    warn!("Status check for {} rejected, leaving it {}: {}", id, operation.status, e);
                    return Err(e);
                }
            }

            let elapsed = started.elapsed();
            if elapsed >= max_wait {
                info!("Operation {} gave up after {:?}", id, elapsed);
                return self.advance(id, OperationStatus::TimedOut, None);
            }

            let delay = backoff
                .delay_for_attempt(attempt)
                .min(max_wait - elapsed);
            attempt = attempt.saturating_add(1);
            debug!("Next status check for {} in {:?}", id, delay);

            tokio::select! {
                _ = token.cancelled() => debug!("Poll loop for {} woken", id),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Map a remote status onto the local record. Returns the operation once
    /// it is terminal.
    async fn apply_status(
        &self,
        operation: &AsyncOperation,
        status: JobStatus,
    ) -> Result<Option<AsyncOperation>> {
        let id = &operation.id;
        debug!("Operation {} remote state {}", id, status.state.as_str());

        match status.state {
            RemoteJobState::Queued => Ok(None),
            RemoteJobState::Working => {
                if operation.status == OperationStatus::Pending {
                    let updated = self.advance(id, OperationStatus::Running, None)?;
                    if updated.status.is_terminal() {
                        return Ok(Some(updated));
                    }
                }
                Ok(None)
            }
            RemoteJobState::Completed => {
                let mut current = operation.clone();
                if current.status == OperationStatus::Pending {
                    current = self.advance(id, OperationStatus::Running, None)?;
                }
                if current.status == OperationStatus::Running {
                    current = self.advance(id, OperationStatus::Completed, None)?;
                    info!("Operation {} completed remotely", id);
                }
                self.settle(current).await.map(Some)
            }
            RemoteJobState::Failed | RemoteJobState::Killed => {
                let detail = status
                    .detail
                    .unwrap_or_else(|| format!("remote job {}", status.state.as_str()));
                let updated = self.advance(id, OperationStatus::Failed, Some(&detail))?;
                Ok(Some(updated))
            }
        }
    }

    /// Fetch results of a completed operation that has none stored yet.
    async fn settle(&self, operation: AsyncOperation) -> Result<AsyncOperation> {
        if operation.status == OperationStatus::Completed && operation.results_fetched_at.is_none() {
            if self.poll.deep_rule_analysis {
                self.analyze_rules(&operation.id).await?;
            } else {
                self.fetch_results(&operation.id).await?;
            }
            return self.store.get_operation(&operation.id);
        }
        Ok(operation)
    }

    /// Apply a transition. Losing a race against another writer that already
    /// made the operation terminal yields that terminal record.
    fn advance(
        &self,
        id: &OperationId,
        status: OperationStatus,
        detail: Option<&str>,
    ) -> Result<AsyncOperation> {
        match self.store.update_operation_status(id, status, detail) {
            Err(Error::InvalidTransition { from, .. }) if from.is_terminal() => {
                debug!("Operation {} already {}", id, from);
                self.store.get_operation(id)
            }
            other => other,
        }
    }

    /// Cancel a pending or running operation.
    ///
    /// Wakes any poll loop on the operation and asks the remote to stop the
    /// job; a failed remote cancel is only logged.
    ///
    /// # Errors
    /// - `InvalidTransition` if the operation is already terminal
    pub async fn cancel(&self, id: &OperationId) -> Result<AsyncOperation> {
        let operation = self
            .store
            .update_operation_status(id, OperationStatus::Cancelled, None)?;

        if let Some(active) = self.tokens().get(id) {
            active.token.cancel();
        }

        if let Err(e) = self.remote.cancel_job(&operation.job_handle).await {
            warn!("Remote cancel of {} failed: {}", operation.job_handle, e);
        }

        info!("Operation {} cancelled", id);
        Ok(operation)
    }

    /// Fetch and store the result set of a completed operation.
    ///
    /// Pages are requested until the remote runs out or the query's row cap
    /// is reached, then written in one batch. Calling this again returns the
    /// stored rows without contacting the remote.
    ///
    /// # Errors
    /// - `InvalidTransition` if the operation is not `completed`
    pub async fn fetch_results(&self, id: &OperationId) -> Result<Vec<TrafficFlow>> {
        let operation = self.store.get_operation(id)?;
        if operation.status != OperationStatus::Completed {
            return Err(Error::InvalidTransition {
                from: operation.status,
                to: OperationStatus::Completed,
            });
        }
        if operation.results_fetched_at.is_some() {
            debug!("Results of {} already stored", id);
            return self.store.list_flows(id);
        }

        let query = self.store.get_query(&operation.query_id)?;
        let cap = query.max_results as usize;
        let mut flows = Vec::new();
        let mut cursor: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let page = self
                .remote
                .list_result_page(&operation.job_handle, cursor.as_deref())
                .await?;
            pages += 1;
            debug!("Result page {} of {}: {} rows", pages, id, page.items.len());
            flows.extend(page.items);

            if flows.len() >= cap {
                flows.truncate(cap);
                break;
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        match self.store.bulk_insert_flows(id, &flows)? {
            FlowInsert::Inserted(rows) => {
                info!("Fetched {} rows in {} pages for {}", rows, pages, id);
                Ok(flows)
            }
            FlowInsert::AlreadyMaterialized(_) => self.store.list_flows(id),
        }
    }

    /// Run a deep rule analysis of a completed job, then store its
    /// rule-annotated result set.
    ///
    /// The analysis is polled with the configured schedule and wait budget.
    /// The operation stays `completed` throughout; if the analysis fails or
    /// does not finish in time nothing is stored and the call can be
    /// repeated, or plain results fetched instead. Results stored earlier
    /// are returned as they are.
    ///
    /// # Errors
    /// - `InvalidTransition` if the operation is not `completed`
    /// - `Remote` if the PCE rejects the analysis, reports it failed, or it
    ///   does not finish within the wait budget
    pub async fn analyze_rules(&self, id: &OperationId) -> Result<Vec<TrafficFlow>> {
        let operation = self.store.get_operation(id)?;
        if operation.status != OperationStatus::Completed {
            return Err(Error::InvalidTransition {
                from: operation.status,
                to: OperationStatus::Completed,
            });
        }
        if operation.results_fetched_at.is_some() {
            debug!("Results of {} already stored, skipping rule analysis", id);
            return self.store.list_flows(id);
        }

        let handle = &operation.job_handle;
        self.remote
            .request_rule_analysis(handle, self.poll.label_based_rules)
            .await?;
        info!("Rule analysis of {} started", id);

        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            match self.remote.get_job_status(handle).await {
                Ok(status) => match status.rules {
                    Some(RemoteJobState::Completed) => break,
                    Some(state @ (RemoteJobState::Failed | RemoteJobState::Killed)) => {
                        let detail = status.detail.unwrap_or_else(|| state.to_string());
                        return Err(Error::remote(
                            None,
                            format!("Rule analysis of {handle} ended: {detail}"),
                        ));
                    }
                    state => debug!("Rule analysis of {} at {:?}", id, state),
                },
                Err(e) if e.is_transient() => {
                    warn!("Rule analysis check for {} failed: {}", id, e);
                }
                Err(e) => return Err(e),
            }

            let elapsed = started.elapsed();
            if elapsed >= self.poll.max_wait {
                return Err(Error::remote(
                    None,
                    format!("Rule analysis of {handle} did not finish within {elapsed:?}"),
                ));
            }
            let delay = self
                .poll
                .backoff
                .delay_for_attempt(attempt)
                .min(self.poll.max_wait - elapsed);
            attempt = attempt.saturating_add(1);
            tokio::time::sleep(delay).await;
        }

        info!("Rule analysis of {} completed", id);
        self.fetch_results(id).await
    }

    fn tokens(&self) -> MutexGuard<'_, HashMap<OperationId, ActivePoll>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register(&self, id: &OperationId) -> CancellationToken {
        let mut tokens = self.tokens();
        let active = tokens.entry(id.clone()).or_insert_with(|| ActivePoll {
            token: CancellationToken::new(),
            loops: 0,
        });
        active.loops += 1;
        active.token.clone()
    }

    /// Drop one loop's registration; the token goes with the last one.
    fn unregister(&self, id: &OperationId) {
        if let Entry::Occupied(mut entry) = self.tokens().entry(id.clone()) {
            entry.get_mut().loops -= 1;
            if entry.get().loops == 0 {
                entry.remove();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pcemirror_common::PolicyDecision;
    use pcemirror_remote::{JobScript, MemoryRemote};

    fn fast() -> Backoff {
        Backoff::new(Duration::from_millis(1), Duration::from_millis(5), 2.0)
    }

    fn flows(n: usize) -> Vec<TrafficFlow> {
        (0..n)
            .map(|i| TrafficFlow {
                src_ip: Some(format!("10.0.{}.{}", i / 256, i % 256)),
                src_workload_id: None,
                dst_ip: Some("10.1.0.1".to_string()),
                dst_workload_id: Some("w1".to_string()),
                service_name: None,
                port: Some(443),
                proto: Some(6),
                policy_decision: PolicyDecision::Allowed,
                flow_direction: None,
                num_connections: 1,
                bytes_in: None,
                bytes_out: None,
                first_detected: None,
                last_detected: None,
                rule_href: None,
            })
            .collect()
    }

    fn fast_poll() -> PollConfig {
        PollConfig::default()
            .with_backoff(fast())
            .with_max_wait(Duration::from_secs(5))
    }

    fn setup_with(poll: PollConfig) -> (Arc<MemoryRemote>, Arc<Store>, Arc<JobEngine<MemoryRemote>>) {
        let remote = Arc::new(MemoryRemote::new());
        let store = Arc::new(Store::in_memory().unwrap());
        let engine = Arc::new(JobEngine::new(remote.clone(), store.clone(), poll));
        (remote, store, engine)
    }

    fn setup() -> (Arc<MemoryRemote>, Arc<Store>, Arc<JobEngine<MemoryRemote>>) {
        setup_with(fast_poll())
    }

    fn with_rule(mut flows: Vec<TrafficFlow>) -> Vec<TrafficFlow> {
        for (i, flow) in flows.iter_mut().enumerate() {
            flow.rule_href = Some(format!("/orgs/1/sec_policy/active/rule_sets/1/sec_rules/{i}"));
        }
        flows
    }

    #[tokio::test]
    async fn test_thirty_day_query_materializes_capped_rows() {
        let (remote, store, engine) = setup();
        remote.set_job_script(JobScript {
            states: vec![
                RemoteJobState::Working,
                RemoteJobState::Working,
                RemoteJobState::Completed,
            ],
            results: flows(10_000),
            result_page_size: 4_000,
            ..Default::default()
        });

        let query = TrafficQuery::last_days("month", 30, 10_000);
        let id = engine.submit(&query).await.unwrap();
        assert_eq!(
            store.get_operation(&id).unwrap().status,
            OperationStatus::Pending
        );

        let operation = engine
            .poll_until_terminal(&id, Duration::from_secs(5), &fast())
            .await
            .unwrap();

        assert_eq!(operation.status, OperationStatus::Completed);
        assert_eq!(operation.poll_attempts, 3);
        assert!(operation.results_fetched_at.is_some());
        assert_eq!(store.flow_count(&id).unwrap(), 10_000);
        assert_eq!(remote.result_pages_served(&operation.job_handle), 3);
    }

    #[tokio::test]
    async fn test_fetch_stops_at_cap() {
        let (remote, store, engine) = setup();
        remote.set_job_script(JobScript {
            results: flows(12_000),
            result_page_size: 4_000,
            ..Default::default()
        });

        let operation = engine
            .run(&TrafficQuery::last_days("capped", 7, 10_000))
            .await
            .unwrap();

        assert_eq!(store.flow_count(&operation.id).unwrap(), 10_000);
        assert_eq!(remote.result_pages_served(&operation.job_handle), 3);
    }

    #[tokio::test]
    async fn test_results_materialize_exactly_once() {
        let (remote, store, engine) = setup();
        remote.set_job_script(JobScript {
            results: flows(25),
            result_page_size: 10,
            ..Default::default()
        });

        let operation = engine
            .run(&TrafficQuery::last_days("once", 7, 100))
            .await
            .unwrap();
        let served = remote.result_pages_served(&operation.job_handle);

        let again = engine.fetch_results(&operation.id).await.unwrap();
        assert_eq!(again.len(), 25);
        assert_eq!(again, flows(25));
        assert_eq!(store.flow_count(&operation.id).unwrap(), 25);
        assert_eq!(remote.result_pages_served(&operation.job_handle), served);
    }

    #[tokio::test]
    async fn test_cancel_wakes_poll_loop() {
        let (remote, store, engine) = setup();
        remote.set_job_script(JobScript {
            states: vec![RemoteJobState::Working],
            ..Default::default()
        });

        let id = engine
            .submit(&TrafficQuery::last_days("slow", 7, 100))
            .await
            .unwrap();

        let slow = Backoff::new(Duration::from_secs(30), Duration::from_secs(30), 1.0);
        let poller = {
            let engine = engine.clone();
            let id = id.clone();
            tokio::spawn(async move {
                engine
                    .poll_until_terminal(&id, Duration::from_secs(120), &slow)
                    .await
            })
        };

        while store.get_operation(&id).unwrap().status != OperationStatus::Running {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let cancelled = engine.cancel(&id).await.unwrap();
        assert_eq!(cancelled.status, OperationStatus::Cancelled);

        let finished = tokio::time::timeout(Duration::from_secs(5), poller)
            .await
            .expect("poll loop should wake on cancel")
            .unwrap()
            .unwrap();
        assert_eq!(finished.status, OperationStatus::Cancelled);
        assert_eq!(remote.cancelled_jobs(), vec![cancelled.job_handle.clone()]);

        let err = engine.fetch_results(&id).await.unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: OperationStatus::Cancelled,
                ..
            }
        ));
        assert_eq!(store.flow_count(&id).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancel_wakes_loop_after_another_finished() {
        let (remote, store, engine) = setup();
        remote.set_job_script(JobScript {
            states: vec![RemoteJobState::Working],
            ..Default::default()
        });
        let id = engine
            .submit(&TrafficQuery::last_days("shared", 7, 100))
            .await
            .unwrap();

        // A second loop on the same operation that ends before the first.
        let _other = engine.register(&id);

        let slow = Backoff::new(Duration::from_secs(30), Duration::from_secs(30), 1.0);
        let poller = {
            let engine = engine.clone();
            let id = id.clone();
            tokio::spawn(async move {
                engine
                    .poll_until_terminal(&id, Duration::from_secs(120), &slow)
                    .await
            })
        };
        while store.get_operation(&id).unwrap().status != OperationStatus::Running {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        engine.unregister(&id);
        engine.cancel(&id).await.unwrap();

        let finished = tokio::time::timeout(Duration::from_secs(5), poller)
            .await
            .expect("remaining poll loop should wake on cancel")
            .unwrap()
            .unwrap();
        assert_eq!(finished.status, OperationStatus::Cancelled);
        assert!(engine.tokens().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_terminal_operation_rejected() {
        let (_remote, _store, engine) = setup();
        let operation = engine
            .run(&TrafficQuery::last_days("done", 7, 100))
            .await
            .unwrap();

        let err = engine.cancel(&operation.id).await.unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: OperationStatus::Completed,
                to: OperationStatus::Cancelled
            }
        ));
    }

    #[tokio::test]
    async fn test_times_out_locally() {
        let (remote, store, engine) = setup();
        remote.set_job_script(JobScript {
            states: vec![RemoteJobState::Queued],
            ..Default::default()
        });

        let id = engine
            .submit(&TrafficQuery::last_days("stuck", 7, 100))
            .await
            .unwrap();
        let operation = engine
            .poll_until_terminal(&id, Duration::from_millis(30), &fast())
            .await
            .unwrap();

        assert_eq!(operation.status, OperationStatus::TimedOut);
        assert!(operation.poll_attempts >= 1);
        assert!(operation.finished_at.is_some());
        assert!(remote.cancelled_jobs().is_empty());
        assert_eq!(store.flow_count(&id).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_transient_status_errors_are_retried() {
        let (remote, _store, engine) = setup();
        remote.set_job_script(JobScript {
            states: vec![RemoteJobState::Working, RemoteJobState::Completed],
            transient_status_failures: 2,
            results: flows(3),
            ..Default::default()
        });

        let operation = engine
            .run(&TrafficQuery::last_days("flaky", 7, 100))
            .await
            .unwrap();

        assert_eq!(operation.status, OperationStatus::Completed);
        assert_eq!(operation.poll_attempts, 4);
        assert_eq!(remote.status_checks(&operation.job_handle), 4);
    }

    #[tokio::test]
    async fn test_rejected_status_check_leaves_operation_open() {
        let (remote, store, engine) = setup();
        remote.set_job_script(JobScript {
            states: vec![RemoteJobState::Working, RemoteJobState::Completed],
            rejected_status_checks: vec![401],
            results: flows(4),
            ..Default::default()
        });
        let id = engine
            .submit(&TrafficQuery::last_days("expired", 7, 100))
            .await
            .unwrap();

        let err = engine.wait(&id).await.unwrap_err();
        assert!(matches!(err, Error::Remote { status: Some(401), .. }));
        let operation = store.get_operation(&id).unwrap();
        assert_eq!(operation.status, OperationStatus::Pending);
        assert_eq!(operation.error_detail, None);
        assert_eq!(operation.finished_at, None);

        let operation = engine.wait(&id).await.unwrap();
        assert_eq!(operation.status, OperationStatus::Completed);
        assert_eq!(store.flow_count(&id).unwrap(), 4);
    }

    #[tokio::test]
    async fn test_failed_result_page_stores_nothing() {
        let (remote, store, engine) = setup();
        remote.set_job_script(JobScript {
            results: flows(25),
            result_page_size: 10,
            failing_result_pages: vec![1],
            ..Default::default()
        });
        let id = engine
            .submit(&TrafficQuery::last_days("partial", 7, 100))
            .await
            .unwrap();

        let err = engine.wait(&id).await.unwrap_err();
        assert!(matches!(err, Error::Remote { status: Some(502), .. }));
        let operation = store.get_operation(&id).unwrap();
        assert_eq!(operation.status, OperationStatus::Completed);
        assert_eq!(operation.results_fetched_at, None);
        assert_eq!(store.flow_count(&id).unwrap(), 0);

        let fetched = engine.fetch_results(&id).await.unwrap();
        assert_eq!(fetched, flows(25));
        assert_eq!(store.flow_count(&id).unwrap(), 25);
        assert_eq!(remote.result_pages_served(&operation.job_handle), 5);
    }

    #[tokio::test]
    async fn test_deep_rule_analysis_stores_annotated_rows() {
        let (remote, store, engine) = setup_with(fast_poll().with_rule_analysis(false));
        remote.set_job_script(JobScript {
            states: vec![RemoteJobState::Working, RemoteJobState::Completed],
            results: flows(6),
            rule_states: vec![
                RemoteJobState::Queued,
                RemoteJobState::Working,
                RemoteJobState::Completed,
            ],
            annotated_results: Some(with_rule(flows(6))),
            ..Default::default()
        });

        let operation = engine
            .run(&TrafficQuery::last_days("rules", 7, 100))
            .await
            .unwrap();

        assert_eq!(operation.status, OperationStatus::Completed);
        assert!(operation.results_fetched_at.is_some());
        assert_eq!(store.list_flows(&operation.id).unwrap(), with_rule(flows(6)));
        assert_eq!(remote.rule_requests(&operation.job_handle), vec![false]);
    }

    #[tokio::test]
    async fn test_failed_rule_analysis_keeps_results_unfetched() {
        let (remote, store, engine) = setup_with(fast_poll().with_rule_analysis(true));
        remote.set_job_script(JobScript {
            results: flows(3),
            rule_states: vec![RemoteJobState::Working, RemoteJobState::Failed],
            annotated_results: Some(with_rule(flows(3))),
            ..Default::default()
        });
        let id = engine
            .submit(&TrafficQuery::last_days("rules", 7, 100))
            .await
            .unwrap();

        let err = engine.wait(&id).await.unwrap_err();
        assert!(matches!(err, Error::Remote { .. }));
        let operation = store.get_operation(&id).unwrap();
        assert_eq!(operation.status, OperationStatus::Completed);
        assert_eq!(operation.results_fetched_at, None);
        assert_eq!(remote.rule_requests(&operation.job_handle), vec![true]);

        assert_eq!(engine.fetch_results(&id).await.unwrap(), flows(3));
        assert_eq!(engine.analyze_rules(&id).await.unwrap(), flows(3));
        assert_eq!(remote.rule_requests(&operation.job_handle).len(), 1);
    }

    #[tokio::test]
    async fn test_rule_analysis_requires_completed() {
        let (remote, _store, engine) = setup();
        remote.set_job_script(JobScript {
            states: vec![RemoteJobState::Working],
            ..Default::default()
        });
        let id = engine
            .submit(&TrafficQuery::last_days("early", 7, 100))
            .await
            .unwrap();

        let err = engine.analyze_rules(&id).await.unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: OperationStatus::Pending,
                ..
            }
        ));
        assert!(remote.rule_requests(&remote.submitted_jobs()[0]).is_empty());
    }

    #[tokio::test]
    async fn test_remote_failure_records_detail() {
        let (remote, store, engine) = setup();
        remote.set_job_script(JobScript {
            states: vec![RemoteJobState::Queued, RemoteJobState::Failed],
            detail: Some("query too large".to_string()),
            ..Default::default()
        });

        let operation = engine
            .run(&TrafficQuery::last_days("broken", 7, 100))
            .await
            .unwrap();

        assert_eq!(operation.status, OperationStatus::Failed);
        assert_eq!(operation.error_detail.as_deref(), Some("query too large"));
        assert_eq!(store.flow_count(&operation.id).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_submission_failure_persists_nothing() {
        let (remote, store, engine) = setup();
        remote.fail_next_submit(500);

        let err = engine
            .submit(&TrafficQuery::last_days("rejected", 7, 100))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Submission(_)));
        assert!(store.list_operations(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_query_is_not_sent() {
        let (remote, store, engine) = setup();

        let err = engine
            .submit(&TrafficQuery::last_days("", 7, 100))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::InvalidQuery(_)));
        assert!(remote.submitted_jobs().is_empty());
        assert!(store.list_operations(None).unwrap().is_empty());
    }
}
