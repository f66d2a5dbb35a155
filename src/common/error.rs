//! Error types for tpckv

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Request Errors ===
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Key not found: {0}")]
    NotFound(String),

    // === Network Errors ===
    #[error("Network error: {0}")]
    Network(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Message exceeds {0} bytes")]
    FrameTooLarge(u64),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    // === 2PC Errors ===
    #[error("Transaction aborted: {0}")]
    Aborted(String),

    #[error("Read failed on both replicas: {0}")]
    ReadFailed(String),

    // === Placement Errors ===
    #[error("No replica nodes registered")]
    NoNodes,

    // === Log Errors ===
    #[error("Participant log error: {0}")]
    Wal(String),

    #[error("Corrupted log: {0}")]
    Corrupted(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Encryption error: {0}")]
    Crypto(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::Network(_) | Error::Io(_))
    }

    /// Reason string carried back to clients in a `resp` message.
    ///
    /// `NotFound` always renders as the protocol's not-found marker so that
    /// clients can tell it apart from other failures.
    pub fn wire_message(&self) -> String {
        match self {
            Error::NotFound(_) => crate::common::message::KEY_NOT_FOUND.to_string(),
            Error::Aborted(reason) | Error::ReadFailed(reason) => reason.clone(),
            Error::Validation(reason) => reason.clone(),
            other => other.to_string(),
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

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Error::Timeout(e.to_string())
    }
}
