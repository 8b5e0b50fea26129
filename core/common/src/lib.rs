//! Common utilities and types shared across PCE Mirror modules.
//!
//! This crate holds the error taxonomy, the entity and job identifiers, the
//! typed records exchanged between the remote client, the engines and the
//! store, and the backoff schedule used by retries and polling.

pub mod backoff;
pub mod error;
pub mod resources;
pub mod traffic;
pub mod types;

pub use backoff::Backoff;
pub use error::{Error, Result};
pub use resources::{IpList, IpRange, Label, LabelGroup, Resource, Service, ServicePort, Workload};
pub use traffic::{
    Actor, AsyncOperation, EndpointFilter, Href, PolicyDecision, PortFilter, ServiceFilter,
    TrafficFilter, TrafficFlow, TrafficQuery, DEFAULT_MAX_RESULTS, MAX_RESULTS_LIMIT,
};
pub use types::{id_from_href, EntityKind, JobHandle, OperationId, OperationStatus};
