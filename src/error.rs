//! Error types for cluster bootstrap

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::pki::PkiError;

/// Main error type for acctest operations
///
/// Every variant is terminal for a bootstrap attempt. Retrying is confined to
/// the poll loops in [`crate::poll`]; nothing above them retries.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Key or certificate generation, signing, or parsing failed
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Writing or reading a persisted artifact failed
    #[error("io error at {}: {source}", path.display())]
    Io {
        /// The file or directory being accessed
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// A node process could not be launched or its endpoint could not be determined
    #[error("process start error: {0}")]
    ProcessStart(String),

    /// The admin API answered with something other than what the protocol requires
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A deadline expired before the awaited condition held
    #[error("timed out waiting for {operation}: {last_error}")]
    Timeout {
        /// What was being waited on
        operation: String,
        /// The most recent failure reason observed before the deadline
        last_error: String,
    },

    /// The cluster configuration is invalid
    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    /// Create a crypto error with the given message
    pub fn crypto(msg: impl Into<String>) -> Self {
        Self::Crypto(msg.into())
    }

    /// Create an I/O error for the given path
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Create a process start error with the given message
    pub fn process_start(msg: impl Into<String>) -> Self {
        Self::ProcessStart(msg.into())
    }

    /// Create a protocol error with the given message
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a timeout error for an operation and its last failure reason
    pub fn timeout(operation: impl Into<String>, last_error: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
            last_error: last_error.into(),
        }
    }

    /// Create a config error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether this error came from a deadline expiring
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<PkiError> for Error {
    fn from(err: PkiError) -> Self {
        match err {
            PkiError::Io { path, source } => Self::Io { path, source },
            other => Self::Crypto(other.to_string()),
        }
    }
}
