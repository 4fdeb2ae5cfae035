//! Error types for minipg

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Persistence Errors ===
    #[error("Corrupted data: {0}")]
    Corrupted(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("Serialization error: {0}")]
    Serialization(String),

    // === Routing Errors ===
    #[error("Routing failure: {0}")]
    RoutingFailure(String),

    #[error("Insufficient replicas: need {needed}, have {available}")]
    InsufficientReplicas { needed: usize, available: usize },

    // === Quorum Errors ===
    #[error("Quorum not reached: {received} of {required} replies")]
    QuorumTimeout { received: usize, required: usize },

    #[error("Replica unreachable: {0}")]
    ReplicaUnreachable(String),

    #[error("Unhandled command: {0}")]
    UnhandledCommand(String),

    #[error("Coordinator crashed: {0}")]
    CoordinatorCrashed(String),

    // === Handoff Errors ===
    #[error("Handoff failed: {0}")]
    Handoff(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    ///
    /// Only errors that may clear up once the ring or the network settles
    /// qualify. A caller retrying a join or leave gets a fresh request id,
    /// so duplicate application is absorbed by the set merge.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::QuorumTimeout { .. }
                | Error::ReplicaUnreachable(_)
                | Error::RoutingFailure(_)
                | Error::InsufficientReplicas { .. }
        )
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Error::QuorumTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Error::RoutingFailure(_)
            | Error::InsufficientReplicas { .. }
            | Error::ReplicaUnreachable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}
