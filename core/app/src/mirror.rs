//! Application facade over the store and both engines.

use chrono::{Duration as ChronoDuration, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use pcemirror_common::{
    AsyncOperation, EntityKind, Error, OperationId, OperationStatus, Result, TrafficFlow,
    TrafficQuery,
};
use pcemirror_jobs::JobEngine;
use pcemirror_remote::{PceClient, RemoteClient};
use pcemirror_store::export::{export_to_file, ExportFormat};
use pcemirror_store::{Store, StoreStats};
use pcemirror_sync::{SyncEngine, SyncMode, SyncReport};

use crate::config::MirrorConfig;

/// Local mirror of one PCE organization.
///
/// # Usage
/// ```ignore
/// let mirror = Mirror::open(&MirrorConfig::load("pcemirror.json")?)?;
/// mirror.synchronize(&[], SyncMode::Full).await?;
/// let id = mirror.submit_query(&default_query("weekly")).await?;
/// let operation = mirror.poll(&id).await?;
/// ```
pub struct Mirror<R: RemoteClient + ?Sized = PceClient> {
    store: Arc<Store>,
    sync: SyncEngine<R>,
    jobs: JobEngine<R>,
    export_dir: PathBuf,
}

impl Mirror<PceClient> {
    /// Open the configured database and connect the HTTP client.
    ///
    /// Nothing is sent to the PCE until an operation needs it.
    pub fn open(config: &MirrorConfig) -> Result<Self> {
        config.validate()?;
        let client = PceClient::new(config.pce.context()?, config.retry.retry_config())?;
        let store = Store::open(&config.database_path)?;
        Ok(Self::with_remote(Arc::new(client), Arc::new(store), config))
    }
}

impl<R: RemoteClient + ?Sized> Mirror<R> {
    /// Assemble a mirror from an existing remote client and store.
    pub fn with_remote(remote: Arc<R>, store: Arc<Store>, config: &MirrorConfig) -> Self {
        Self {
            sync: SyncEngine::new(remote.clone(), store.clone()),
            jobs: JobEngine::new(remote, store.clone(), config.poll.clone()),
            store,
            export_dir: config.export_dir.clone(),
        }
    }

    /// Underlying store.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Verify the PCE accepts our credentials.
    pub async fn check_connection(&self) -> Result<()> {
        self.sync.check_connection().await
    }

    /// Reconcile entity types with the PCE. An empty list means every type.
    pub async fn synchronize(&self, kinds: &[EntityKind], mode: SyncMode) -> Result<SyncReport> {
        if kinds.is_empty() {
            self.sync.synchronize(&EntityKind::ALL, mode).await
        } else {
            self.sync.synchronize(kinds, mode).await
        }
    }

    /// Submit a traffic query; returns the new operation's id.
    pub async fn submit_query(&self, query: &TrafficQuery) -> Result<OperationId> {
        self.jobs.submit(query).await
    }

    /// Current record of an operation.
    pub fn get_operation_status(&self, id: &OperationId) -> Result<AsyncOperation> {
        self.store.get_operation(id)
    }

    /// Operations, newest first, optionally filtered by status.
    pub fn list_operations(&self, status: Option<OperationStatus>) -> Result<Vec<AsyncOperation>> {
        self.store.list_operations(status)
    }

    /// Cancel an operation. Returns `false` if it had already finished.
    pub async fn cancel_operation(&self, id: &OperationId) -> Result<bool> {
        match self.jobs.cancel(id).await {
            Ok(_) => Ok(true),
            Err(Error::InvalidTransition { from, .. }) if from.is_terminal() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Wait for an operation with the configured polling defaults.
    pub async fn poll(&self, id: &OperationId) -> Result<AsyncOperation> {
        self.jobs.wait(id).await
    }

    /// Materialized result rows of a completed operation.
    pub async fn fetch_results(&self, id: &OperationId) -> Result<Vec<TrafficFlow>> {
        self.jobs.fetch_results(id).await
    }

    /// Export the stored rows of an operation.
    ///
    /// Without `output` the file lands in the export directory, named after
    /// the operation. Returns the path written and the row count.
    pub fn export_results(
        &self,
        id: &OperationId,
        format: ExportFormat,
        output: Option<&Path>,
    ) -> Result<(PathBuf, usize)> {
        let operation = self.store.get_operation(id)?;
        if operation.results_fetched_at.is_none() {
            return Err(Error::NotFound(format!("No stored results for operation {id}")));
        }

        let path = match output {
            Some(path) => path.to_path_buf(),
            None => self
                .export_dir
                .join(format!("{}.{}", id, format.extension())),
        };
        let rows = export_to_file(&self.store, id, format, &path)?;
        Ok((path, rows))
    }

    /// Record counts across the store.
    pub fn stats(&self) -> Result<StoreStats> {
        self.store.stats()
    }

    /// Delete finished operations older than `days` days.
    pub fn purge_operations(&self, days: u32) -> Result<usize> {
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(days));
        let purged = self.store.purge_operations(cutoff)?;
        info!("Purged {} operations finished before {}", purged, cutoff);
        Ok(purged)
    }
}
