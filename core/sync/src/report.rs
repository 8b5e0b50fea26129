//! Reconciliation modes and pass reports.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use pcemirror_common::{EntityKind, Error};

/// How a reconciliation pass treats records it did not observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Upsert, then prune unobserved records of every processed type.
    Full,
    /// Upsert only; nothing is ever pruned.
    Selective,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => f.write_str("full"),
            Self::Selective => f.write_str("selective"),
        }
    }
}

/// Error that aborted an entity type, kept in a form reports can carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypeFailure {
    /// Error variant, e.g. `remote` or `serialization`.
    pub category: &'static str,
    /// HTTP status when the remote answered.
    pub status: Option<u16>,
    /// Whether a later pass may succeed without intervention.
    pub transient: bool,
    pub message: String,
}

impl From<&Error> for TypeFailure {
    fn from(err: &Error) -> Self {
        Self {
            category: err.category(),
            status: err.status(),
            transient: err.is_transient(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for TypeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Outcome of one entity type within a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypeReport {
    pub kind: EntityKind,
    pub pages: usize,
    pub fetched: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Records pruned; `None` when pruning did not run.
    pub pruned: Option<usize>,
    /// Failure that aborted this type, if any.
    pub error: Option<TypeFailure>,
}

impl TypeReport {
    pub(crate) fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            pages: 0,
            fetched: 0,
            inserted: 0,
            updated: 0,
            unchanged: 0,
            pruned: None,
            error: None,
        }
    }

    /// Whether every page was fetched and stored.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Number of stored records this type changed.
    pub fn delta(&self) -> usize {
        self.inserted + self.updated + self.pruned.unwrap_or(0)
    }
}

/// Result of a reconciliation pass.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub mode: SyncMode,
    pub types: Vec<TypeReport>,
    pub duration: Duration,
}

impl SyncReport {
    /// Whether every processed type succeeded.
    pub fn is_success(&self) -> bool {
        self.types.iter().all(TypeReport::is_success)
    }

    /// Types that failed, with their error.
    pub fn failures(&self) -> impl Iterator<Item = &TypeReport> {
        self.types.iter().filter(|t| !t.is_success())
    }

    /// Report of one type, if it was processed.
    pub fn get(&self, kind: EntityKind) -> Option<&TypeReport> {
        self.types.iter().find(|t| t.kind == kind)
    }

    /// Total number of changed records across types.
    pub fn delta(&self) -> usize {
        self.types.iter().map(TypeReport::delta).sum()
    }
}
