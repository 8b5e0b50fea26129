//! Reconciliation engine that mirrors remote entity collections locally.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

use pcemirror_common::{EntityKind, Error, Result};
use pcemirror_remote::RemoteClient;
use pcemirror_store::Store;

use crate::report::{SyncMode, SyncReport, TypeFailure, TypeReport};

/// Sync engine coordinating the remote client and the store.
pub struct SyncEngine<R: RemoteClient + ?Sized> {
    /// Remote source of truth.
    remote: Arc<R>,
    /// Local store.
    store: Arc<Store>,
}

impl<R: RemoteClient + ?Sized> SyncEngine<R> {
    /// Create a new sync engine.
    pub fn new(remote: Arc<R>, store: Arc<Store>) -> Self {
        Self { remote, store }
    }

    /// Pre-flight check that the remote answers authenticated requests.
    pub async fn check_connection(&self) -> Result<()> {
        self.remote.ping().await?;
        info!("Connection to {} remote verified", self.remote.name());
        Ok(())
    }

    /// Full pass over every entity type.
    pub async fn synchronize_all(&self) -> Result<SyncReport> {
        self.synchronize(&EntityKind::ALL, SyncMode::Full).await
    }

    /// Reconcile the given entity types.
    ///
    /// Types are processed one after another in a fixed order. A failure
    /// aborts only the type it occurred in: records already upserted stay,
    /// nothing of that type is pruned, and the failure is recorded in the
    /// report before the next type starts.
    pub async fn synchronize(&self, kinds: &[EntityKind], mode: SyncMode) -> Result<SyncReport> {
        let start = Instant::now();
        let kinds: BTreeSet<EntityKind> = kinds.iter().copied().collect();

        info!("Starting {} sync of {} entity types", mode, kinds.len());

        let mut types = Vec::with_capacity(kinds.len());
        for kind in kinds {
            types.push(self.sync_type(kind, mode).await);
        }

        let report = SyncReport {
            mode,
            types,
            duration: start.elapsed(),
        };
        info!(
            "{} sync completed in {:?}: {} changes, {} failed types",
            mode,
            report.duration,
            report.delta(),
            report.failures().count()
        );
        Ok(report)
    }

    async fn sync_type(&self, kind: EntityKind, mode: SyncMode) -> TypeReport {
        let mut report = TypeReport::new(kind);
        match self.fetch_and_store(kind, &mut report).await {
            Ok(seen) => {
                if mode == SyncMode::Full {
                    match self.store.prune_stale(kind, &seen) {
                        Ok(pruned) => report.pruned = Some(pruned),
                        Err(e) => {
                            error!("Failed to prune {}: {}", kind, e);
                            report.error = Some(TypeFailure::from(&e));
                        }
                    }
                }
                debug!(
                    "{}: {} fetched, {} new, {} changed, {} pruned",
                    kind,
                    report.fetched,
                    report.inserted,
                    report.updated,
                    report.pruned.unwrap_or(0)
                );
            }
            Err(e) => {
                error!("Failed to sync {} after {} pages: {}", kind, report.pages, e);
                report.error = Some(TypeFailure::from(&e));
            }
        }
        report
    }

    /// Walk every page of `kind`, one store transaction per page. Returns the
    /// identifiers observed.
    async fn fetch_and_store(
        &self,
        kind: EntityKind,
        report: &mut TypeReport,
    ) -> Result<HashSet<String>> {
        let mut seen = HashSet::new();
        let mut cursor: Option<String> = None;

        loop {
            let page = self.remote.list_page(kind, cursor.as_deref()).await?;
            let records: Vec<_> = page
                .items
                .into_iter()
                .filter(|record| record.kind() == kind)
                .collect();

            let outcome = self.store.upsert_batch(&records)?;
            report.pages += 1;
            report.fetched += records.len();
            report.inserted += outcome.inserted;
            report.updated += outcome.updated;
            report.unchanged += outcome.unchanged;
            seen.extend(records.iter().map(|r| r.id().to_string()));

            match page.next_cursor {
                Some(next) if cursor.as_deref() == Some(next.as_str()) => {
                    return Err(Error::remote(
                        None,
                        format!("{kind} pagination did not advance past cursor {next}"),
                    ));
                }
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        Ok(seen)
    }
}
