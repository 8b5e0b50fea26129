//! PCE Mirror application layer.
//!
//! Loads configuration and exposes [`Mirror`], the single entry point the
//! CLI drives.

pub mod config;
pub mod mirror;

pub use config::{data_dir, MirrorConfig, PceSettings, RetrySettings};
pub use mirror::Mirror;

pub use pcemirror_jobs::default_query;
pub use pcemirror_store::export::ExportFormat;
pub use pcemirror_sync::{SyncMode, SyncReport, TypeFailure, TypeReport};
