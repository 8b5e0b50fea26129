//! SQLite-backed persistence gateway for PCE Mirror.
//!
//! The store is the single writer of all mirrored state: reference entities,
//! traffic queries, async operations and their result flows. Every write runs
//! in its own transaction behind one connection, so readers only ever see
//! committed state.

mod entities;
pub mod export;
mod operations;
mod schema;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::Connection;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::info;

use pcemirror_common::{EntityKind, Error, Result};

pub use entities::{BatchOutcome, StoredEntity, UpsertOutcome};
pub use operations::FlowInsert;

/// Record counts across the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct StoreStats {
    pub entities: BTreeMap<EntityKind, u64>,
    pub operations: u64,
    pub active_operations: u64,
    pub flows: u64,
}

/// Local relational store.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Create or open a store database.
    ///
    /// # Arguments
    /// - `db_path`: Path to the SQLite database file
    ///
    /// # Errors
    /// - Database creation or migration failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path).map_err(db)?;
        schema::initialize(&conn)?;

        info!("Store opened at {}", db_path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db)?;
        schema::initialize(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Per-type record counts plus operation and flow totals.
    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.lock()?;
        let mut stats = StoreStats::default();

        for kind in EntityKind::ALL {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", kind.as_str()), [], |row| {
                    row.get(0)
                })
                .map_err(db)?;
            stats.entities.insert(kind, count as u64);
        }

        let (operations, active): (i64, i64) = conn
            .query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(CASE WHEN status IN ('pending', 'running') THEN 1 ELSE 0 END), 0)
                 FROM async_operations",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(db)?;
        stats.operations = operations as u64;
        stats.active_operations = active as u64;

        let flows: i64 = conn
            .query_row("SELECT COUNT(*) FROM traffic_flows", [], |row| row.get(0))
            .map_err(db)?;
        stats.flows = flows as u64;

        Ok(stats)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Persistence("store connection lock poisoned".to_string()))
    }
}

pub(crate) fn db(err: rusqlite::Error) -> Error {
    Error::Persistence(err.to_string())
}

/// Fixed-width UTC encoding, so stored timestamps also compare lexically.
pub(crate) fn encode_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn decode_time(value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(value, e))
}

pub(crate) fn decode_opt_time(value: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value.as_deref().map(decode_time).transpose()
}

pub(crate) fn decode_date(value: &str) -> rusqlite::Result<NaiveDate> {
    value
        .parse::<NaiveDate>()
        .map_err(|e| conversion_error(value, e))
}

pub(crate) fn conversion_error(
    value: &str,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        value.len(),
        rusqlite::types::Type::Text,
        Box::new(err),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pcemirror_common::{Label, Resource};

    #[test]
    fn test_stats_on_empty_store() {
        let store = Store::in_memory().unwrap();
        let stats = store.stats().unwrap();

        assert_eq!(stats.entities.len(), EntityKind::ALL.len());
        assert!(stats.entities.values().all(|count| *count == 0));
        assert_eq!(stats.operations, 0);
        assert_eq!(stats.flows, 0);
    }

    #[test]
    fn test_reopen_preserves_entities() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("mirror.db");

        {
            let store = Store::open(&path).unwrap();
            store
                .upsert(&Resource::Label(Label {
                    id: "42".to_string(),
                    key: "env".to_string(),
                    value: "prod".to_string(),
                }))
                .unwrap();
        }

        let store = Store::open(&path).unwrap();
        let stored = store.get(EntityKind::Label, "42").unwrap().unwrap();
        assert_eq!(stored.resource.display_name(), Some("prod"));
        assert_eq!(store.stats().unwrap().entities[&EntityKind::Label], 1);
    }
}
