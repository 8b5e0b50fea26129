//! Async job engine for PCE traffic queries.
//!
//! Submits traffic-analysis jobs, tracks each one as an
//! [`AsyncOperation`](pcemirror_common::AsyncOperation) in the store, polls
//! the remote with exponential backoff and materializes the result rows
//! exactly once.

pub mod config;
pub mod engine;

pub use config::{default_query, PollConfig, DEFAULT_WINDOW_DAYS};
pub use engine::JobEngine;
