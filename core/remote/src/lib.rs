//! Remote resource client for PCE Mirror.
//!
//! This crate defines the [`RemoteClient`] contract the engines are written
//! against, an HTTP implementation for the PCE REST API, and a scripted
//! in-memory implementation for tests.
//!
//! # Design Principles
//! - Remote payloads become typed records at this boundary
//! - Every non-success answer surfaces as `Error::Remote`
//! - Only idempotent GETs are retried

pub mod client;
pub mod context;
pub mod memory;
pub mod parse;
pub mod pce;
pub mod retry;

pub use client::{JobStatus, Page, RemoteClient, RemoteJobState};
pub use context::{Credentials, PceContext, DEFAULT_PAGE_SIZE};
pub use memory::{JobScript, MemoryRemote};
pub use pce::PceClient;
pub use retry::{RetryConfig, RetryExecutor};
