//! PCE Mirror Sync Engine
//!
//! This module reconciles the local store with the PCE, including:
//! - Paginated fetch with one store transaction per page
//! - Full passes that prune records the remote no longer has
//! - Selective passes that refresh a subset of types without pruning
//! - Per-type failure isolation and reporting

pub mod engine;
pub mod report;

// Re-export main types
pub use engine::SyncEngine;
pub use report::{SyncMode, SyncReport, TypeFailure, TypeReport};
