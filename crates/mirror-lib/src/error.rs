//! Error taxonomy for the mirror
//!
//! Adapter failures are reported as [`SourceError`] and classified into the
//! coarser [`MirrorError`] kinds that decide how far a failure propagates.

use std::path::PathBuf;
use thiserror::Error;

/// Failure talking to one of the external data sources
#[derive(Debug, Error)]
pub enum SourceError {
    /// Transport or authentication failure
    #[error("{source_name} unavailable: {message}")]
    Unavailable {
        source_name: &'static str,
        message: String,
    },

    /// The request exceeded its bounded timeout
    #[error("{source_name} request timed out")]
    Timeout { source_name: &'static str },

    /// The remote end refused the connection
    #[error("{source_name} refused connection: {message}")]
    ConnectionRefused {
        source_name: &'static str,
        message: String,
    },

    /// Non-success HTTP status
    #[error("{source_name} returned HTTP {status}")]
    Status {
        source_name: &'static str,
        status: u16,
    },

    /// Response body had an unexpected shape
    #[error("{source_name} returned malformed data: {message}")]
    Malformed {
        source_name: &'static str,
        message: String,
    },
}

impl SourceError {
    /// Classify a reqwest transport error for the named source
    pub fn from_reqwest(source_name: &'static str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SourceError::Timeout { source_name }
        } else if err.is_connect() {
            SourceError::ConnectionRefused {
                source_name,
                message: err.to_string(),
            }
        } else if err.is_decode() {
            SourceError::Malformed {
                source_name,
                message: err.to_string(),
            }
        } else if let Some(status) = err.status() {
            SourceError::Status {
                source_name,
                status: status.as_u16(),
            }
        } else {
            SourceError::Unavailable {
                source_name,
                message: err.to_string(),
            }
        }
    }

    pub fn malformed(source_name: &'static str, message: impl Into<String>) -> Self {
        SourceError::Malformed {
            source_name,
            message: message.into(),
        }
    }

    /// True when the failure concerns the payload rather than reachability
    pub fn is_malformed(&self) -> bool {
        matches!(self, SourceError::Malformed { .. })
    }
}

/// A resource quantity string that could not be parsed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid quantity {value:?}: {reason}")]
pub struct QuantityError {
    pub value: String,
    pub reason: &'static str,
}

/// Top-level error kinds
#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(SourceError),

    #[error("malformed data: {0}")]
    MalformedData(String),

    #[error("instance lock {path:?} is held by live process {pid}")]
    LockConflict { path: PathBuf, pid: i32 },

    #[error("report {timestamp} build failed: {reason}")]
    ReportBuildFailure { timestamp: i64, reason: String },

    #[error("configuration reload failed: {0}")]
    ConfigReloadFailure(String),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("store error at {path:?}: {message}")]
    Store { path: PathBuf, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<SourceError> for MirrorError {
    fn from(err: SourceError) -> Self {
        if err.is_malformed() {
            MirrorError::MalformedData(err.to_string())
        } else {
            MirrorError::SourceUnavailable(err)
        }
    }
}

impl From<QuantityError> for MirrorError {
    fn from(err: QuantityError) -> Self {
        MirrorError::MalformedData(err.to_string())
    }
}

pub type Result<T, E = MirrorError> = std::result::Result<T, E>;
