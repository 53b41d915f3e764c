// rust/switch-core/src/error.rs

use std::path::PathBuf;
use thiserror::Error;

use crate::dataplane::DataplaneError;

#[derive(Error, Debug)]
pub enum ControlError {

    #[error("job of {requested} workers exceeds capacity of {max} workers")]
    CapacityExceeded {
        requested: u32,
        max: u32,
    },

    #[error("rank {rank} is already admitted in this job")]
    DuplicateRank {
        rank: u32,
    },

    #[error("{what} not found")]
    NotFound {
        what: String,
    },

    #[error("invalid request: {message}")]
    InvalidRequest {
        message: String,
    },

    #[error("coordinator is {phase}; {operation} requires {required}")]
    NotReady {
        operation: &'static str,
        phase: &'static str,
        required: &'static str,
    },

    #[error("dataplane unavailable during {operation} on '{table}': {message}")]
    DataplaneUnavailable {
        table: &'static str,
        operation: &'static str,
        message: String,
        #[source]
        source: Option<DataplaneError>,
    },

    #[error("dataplane rejected {operation} on '{table}': {message}")]
    DataplaneRejected {
        table: &'static str,
        operation: &'static str,
        message: String,
    },

    #[error("stale state detected: {message}")]
    StaleStateDetected {
        message: String,
    },

    #[error("schema error: {message}")]
    Schema {
        message: String,
    },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("I/O error at '{path}': {message}")]
    Io {
        path: PathBuf,
        message: String,
        #[source]
        source: std::io::Error,
    },

    #[error("internal error: {message}")]
    Internal {
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, ControlError>;

// Convenience constructors
impl ControlError {

    pub fn capacity_exceeded(requested: u32, max: u32) -> Self {
        Self::CapacityExceeded { requested, max }
    }

    pub fn duplicate_rank(rank: u32) -> Self {
        Self::DuplicateRank { rank }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn stale_state(message: impl Into<String>) -> Self {
        Self::StaleStateDetected {
            message: message.into(),
        }
    }

    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn io(path: impl Into<PathBuf>, message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            message: message.into(),
            source,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Maps a dataplane failure that survived the retry policy.
    pub fn dataplane(table: &'static str, operation: &'static str, error: DataplaneError) -> Self {
        match error {
            DataplaneError::Rejected { message } => Self::DataplaneRejected {
                table,
                operation,
                message,
            },
            other => Self::DataplaneUnavailable {
                table,
                operation,
                message: other.to_string(),
                source: Some(other),
            },
        }
    }

    /// Stable short name printed by the CLI and carried in RPC status messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CapacityExceeded { .. } => "CapacityExceeded",
            Self::DuplicateRank { .. } => "DuplicateRank",
            Self::NotFound { .. } => "NotFound",
            Self::InvalidRequest { .. } => "InvalidRequest",
            Self::NotReady { .. } => "NotReady",
            Self::DataplaneUnavailable { .. } => "DataplaneUnavailable",
            Self::DataplaneRejected { .. } => "DataplaneRejected",
            Self::StaleStateDetected { .. } => "StaleStateDetected",
            Self::Schema { .. } => "Schema",
            Self::Config { .. } => "Config",
            Self::Io { .. } => "Io",
            Self::Internal { .. } => "Internal",
        }
    }

    /// True when repeating the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::DataplaneUnavailable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dataplane_rejection_is_not_retryable() {
        let err = ControlError::dataplane(
            "pipe.Ingress.example",
            "add",
            DataplaneError::Rejected {
                message: "unknown key field".to_string(),
            },
        );
        assert_eq!(err.kind(), "DataplaneRejected");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_dataplane_timeout_is_retryable() {
        let err = ControlError::dataplane("pipe.Ingress.example", "delete", DataplaneError::Timeout);
        assert_eq!(err.kind(), "DataplaneUnavailable");
        assert!(err.is_retryable());
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_messages() {
        assert_eq!(
            ControlError::capacity_exceeded(33, 32).to_string(),
            "job of 33 workers exceeds capacity of 32 workers"
        );
        assert_eq!(
            ControlError::duplicate_rank(4).to_string(),
            "rank 4 is already admitted in this job"
        );
        assert_eq!(ControlError::not_found("rank 7").to_string(), "rank 7 not found");
    }
}
