//! Common error types for PCE Mirror.

use thiserror::Error;

use crate::types::OperationStatus;

/// Top-level error type for mirror operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The PCE answered with a non-2xx status, or could not be reached at all
    /// (`status` is `None` for transport failures).
    #[error("Remote error{}: {message}", status_suffix(.status))]
    Remote {
        /// HTTP status code, if a response was received.
        status: Option<u16>,
        /// Error detail from the remote side or the transport.
        message: String,
    },

    /// Requested job state change is not allowed from the current state.
    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition {
        /// Current status of the operation.
        from: OperationStatus,
        /// Status that was requested.
        to: OperationStatus,
    },

    /// Malformed traffic query, rejected before anything is persisted.
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// The remote job could not be created.
    #[error("Submission error: {0}")]
    Submission(String),

    /// Local store failure.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration is missing or invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a remote error from a status code and message.
    pub fn remote(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Remote {
            status,
            message: message.into(),
        }
    }

    /// Whether retrying the same request may succeed.
    ///
    /// Transport failures, throttling and server-side errors are transient;
    /// client errors and everything local are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Remote { status: None, .. } => true,
            Self::Remote {
                status: Some(code), ..
            } => *code == 429 || *code >= 500,
            Self::Io(_) => true,
            _ => false,
        }
    }

    /// Stable name of the error variant.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Remote { .. } => "remote",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::InvalidQuery(_) => "invalid_query",
            Self::Submission(_) => "submission",
            Self::Persistence(_) => "persistence",
            Self::NotFound(_) => "not_found",
            Self::Serialization(_) => "serialization",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
        }
    }

    /// HTTP status of a remote error that received a response.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Remote { status, .. } => *status,
            _ => None,
        }
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|code| format!(" ({code})")).unwrap_or_default()
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_display() {
        let err = Error::remote(Some(503), "service unavailable");
        assert_eq!(err.to_string(), "Remote error (503): service unavailable");

        let err = Error::remote(None, "connection refused");
        assert_eq!(err.to_string(), "Remote error: connection refused");
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::remote(None, "timeout").is_transient());
        assert!(Error::remote(Some(500), "boom").is_transient());
        assert!(Error::remote(Some(429), "slow down").is_transient());
        assert!(!Error::remote(Some(401), "unauthorized").is_transient());
        assert!(!Error::InvalidQuery("bad".to_string()).is_transient());
        assert!(!Error::InvalidTransition {
            from: OperationStatus::Completed,
            to: OperationStatus::Running,
        }
        .is_transient());
    }

    #[test]
    fn test_category_and_status() {
        let err = Error::remote(Some(401), "unauthorized");
        assert_eq!(err.category(), "remote");
        assert_eq!(err.status(), Some(401));

        let err = Error::Persistence("disk full".to_string());
        assert_eq!(err.category(), "persistence");
        assert_eq!(err.status(), None);
    }
}
