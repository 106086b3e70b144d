//! Error types for the CephFS provisioner
//!
//! Every failure the controller can surface is one variant of [`Error`].
//! Call sites match on the variant (never on message text) to decide between
//! idempotent success, a retryable abort, and a hard failure.

use thiserror::Error;

/// Unified error type for the provisioner
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Identifier Errors
    // =========================================================================
    #[error("Invalid volume ID: {0}")]
    InvalidVolumeId(String),

    // =========================================================================
    // Journal / Metadata Errors
    // =========================================================================
    #[error("Pool not found: {pool} in cluster {cluster_id}")]
    PoolNotFound { cluster_id: String, pool: String },

    #[error("Key not found: {object}/{key}")]
    KeyNotFound { object: String, key: String },

    #[error("Object already exists: {object}")]
    ObjectExists { object: String },

    #[error("Object not found: {object}")]
    ObjectNotFound { object: String },

    // =========================================================================
    // Backing Object Errors
    // =========================================================================
    #[error("Volume not found: {volume}")]
    VolumeNotFound { volume: String },

    #[error("Snapshot not found: {snapshot}")]
    SnapNotFound { snapshot: String },

    #[error("Clone is in progress for volume {volume_id}")]
    CloneInProgress { volume_id: String },

    #[error("Command not supported by the storage cluster: {0}")]
    InvalidCommand(String),

    // =========================================================================
    // Request Errors
    // =========================================================================
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("An operation with the given ID {key} already exists")]
    OperationPending { key: String },

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Request cancelled")]
    Cancelled,

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transport-neutral status code reported for an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    /// Retry the same request later
    Aborted,
    FailedPrecondition,
    Cancelled,
    Internal,
}

impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Code::InvalidArgument => write!(f, "invalid_argument"),
            Code::NotFound => write!(f, "not_found"),
            Code::AlreadyExists => write!(f, "already_exists"),
            Code::Aborted => write!(f, "aborted"),
            Code::FailedPrecondition => write!(f, "failed_precondition"),
            Code::Cancelled => write!(f, "cancelled"),
            Code::Internal => write!(f, "internal"),
        }
    }
}

impl Error {
    /// Status code to report to the caller
    pub fn code(&self) -> Code {
        match self {
            Error::InvalidVolumeId(_) | Error::InvalidArgument(_) => Code::InvalidArgument,

            Error::VolumeNotFound { .. } | Error::SnapNotFound { .. } => Code::NotFound,

            Error::AlreadyExists(_) => Code::AlreadyExists,

            // The caller backs off and replays the same request
            Error::CloneInProgress { .. } | Error::OperationPending { .. } => Code::Aborted,

            Error::InvalidCommand(_) => Code::FailedPrecondition,

            Error::Cancelled => Code::Cancelled,

            // Journal level misses and everything else are internal to the controller
            Error::PoolNotFound { .. }
            | Error::KeyNotFound { .. }
            | Error::ObjectExists { .. }
            | Error::ObjectNotFound { .. }
            | Error::Internal(_)
            | Error::Configuration(_)
            | Error::JsonParse(_)
            | Error::Io(_) => Code::Internal,
        }
    }

    /// Check if the caller should replay the request
    pub fn is_retryable(&self) -> bool {
        self.code() == Code::Aborted
    }

    /// Journal lookup misses that mean the entity is already gone
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::PoolNotFound { .. } | Error::KeyNotFound { .. })
    }

    /// Check if this is a clone still being materialized
    pub fn is_clone_in_progress(&self) -> bool {
        matches!(self, Error::CloneInProgress { .. })
    }
}

/// Result type alias for the provisioner
pub type Result<T> = std::result::Result<T, Error>;
