//! Error types for leasehold

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Coordination Store Errors ===
    #[error("Coordination store unavailable: {0}")]
    StoreUnavailable(String),

    // === Probe Errors ===
    #[error("Probe timed out for member {0}")]
    ProbeTimeout(String),

    #[error("Probe failed for member {member}: {reason}")]
    ProbeFailed { member: String, reason: String },

    // === Engine Errors ===
    #[error("Engine {op} failed: {reason}")]
    EngineOperation { op: String, reason: String },

    // === Routing Errors ===
    #[error("No eligible backend in {0} pool")]
    NoEligibleBackend(String),

    // === Network Errors ===
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("HTTP error: {0}")]
    Http(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::StoreUnavailable(_)
                | Error::ProbeTimeout(_)
                | Error::ConnectionFailed(_)
                | Error::Timeout(_)
        )
    }

    /// Convert to HTTP status code for the status endpoint
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Error::Timeout(_) | Error::ProbeTimeout(_) => StatusCode::REQUEST_TIMEOUT,
            Error::StoreUnavailable(_) | Error::NoEligibleBackend(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// Implement From for common error types
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

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e.to_string())
    }
}
