//! Error types for nvmekit

use thiserror::Error;

use crate::codec::status::{Status, StatusType};
use crate::orchestrator::AttemptRecord;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Whether the caller may retry an operation or must reconfigure first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The same call may succeed if retried later
    Recoverable,
    /// Retrying without changing configuration will fail again
    Fatal,
}

/// Errors that can occur while talking to NVMe devices or managing the topology
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Device Access Errors
    // =========================================================================
    /// The device node or fabric endpoint does not exist
    #[error("Device not found: {path}")]
    NotFound { path: String },

    /// Access to the device was refused
    #[error("Permission denied: {path}")]
    PermissionDenied { path: String },

    /// Exclusive access could not be obtained
    #[error("Device already in use: {path}")]
    AlreadyInUse { path: String },

    /// The command did not complete before its deadline
    #[error("Command {opcode:#04x} timed out after {timeout_ms} ms")]
    Timeout { opcode: u8, timeout_ms: u64 },

    /// The device completed the command with a non-success status
    #[error("Device error: {status}")]
    DeviceError { status: Status },

    /// The link or fabric dropped while the channel was in use
    #[error("Transport lost: {reason}")]
    TransportLost { reason: String },

    // =========================================================================
    // Discovery / Connect Errors
    // =========================================================================
    /// A discovery pass failed part way through; nothing was committed
    #[error("Discovery incomplete: {cause}")]
    DiscoveryIncomplete {
        #[source]
        cause: Box<Error>,
    },

    /// Every connect attempt failed; the controller is not registered
    #[error("Connect failed after {} attempt(s): {cause}", attempts.len())]
    ConnectFailed {
        #[source]
        cause: Box<Error>,
        attempts: Vec<AttemptRecord>,
    },

    /// The operation was cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,

    // =========================================================================
    // Topology Errors
    // =========================================================================
    /// An entity with the same identity key already exists in this scope
    #[error("Duplicate identity: {key}")]
    DuplicateIdentity { key: String },

    /// No topology entity has this handle or key
    #[error("Topology entity not found: {key}")]
    EntityNotFound { key: String },

    /// The entity is not in a state that allows this operation
    #[error("Invalid state for {entity}: {reason}")]
    InvalidState { entity: String, reason: String },

    // =========================================================================
    // Input / Environment Errors
    // =========================================================================
    /// A caller-supplied value was rejected
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A device-returned structure could not be parsed
    #[error("Malformed {structure}: {reason}")]
    Malformed {
        structure: &'static str,
        reason: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persisted document could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wrap an error as the cause of an incomplete discovery pass.
    pub fn discovery_incomplete(cause: Error) -> Self {
        match cause {
            Error::DiscoveryIncomplete { .. } | Error::Cancelled => cause,
            other => Error::DiscoveryIncomplete {
                cause: Box::new(other),
            },
        }
    }

    /// Map an OS error from opening `path` into the device taxonomy.
    pub fn from_open_error(err: std::io::Error, path: &str) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::NotFound => Error::NotFound { path: path.into() },
            ErrorKind::PermissionDenied => Error::PermissionDenied { path: path.into() },
            _ => match err.raw_os_error() {
                Some(code) if is_busy_errno(code) => Error::AlreadyInUse { path: path.into() },
                Some(code) if is_missing_device_errno(code) => {
                    Error::NotFound { path: path.into() }
                }
                _ => Error::Io(err),
            },
        }
    }

    /// The innermost cause, looking through discovery/connect wrappers.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::DiscoveryIncomplete { cause } | Error::ConnectFailed { cause, .. } => {
                cause.root_cause()
            }
            other => other,
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Timeout { .. } | Error::TransportLost { .. } | Error::AlreadyInUse { .. } => {
                true
            }
            Error::DeviceError { status } => !status.dnr(),
            Error::DiscoveryIncomplete { cause } | Error::ConnectFailed { cause, .. } => {
                cause.is_retryable()
            }
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Classify for callers: recoverable failures may be retried as-is.
    pub fn severity(&self) -> Severity {
        if self.is_retryable() {
            Severity::Recoverable
        } else {
            Severity::Fatal
        }
    }

    /// Whether this failure means the owning controller is no longer usable.
    ///
    /// Path-related device statuses count; data-integrity and command-specific
    /// statuses do not.
    pub fn faults_controller(&self) -> bool {
        match self {
            Error::Timeout { .. } | Error::TransportLost { .. } => true,
            Error::DeviceError { status } => status.status_type() == StatusType::PathRelated,
            Error::DiscoveryIncomplete { cause } => cause.faults_controller(),
            _ => false,
        }
    }

    /// The device status carried by this error, if any.
    pub fn device_status(&self) -> Option<Status> {
        match self.root_cause() {
            Error::DeviceError { status } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(unix)]
fn is_busy_errno(code: i32) -> bool {
    code == libc::EBUSY || code == libc::EWOULDBLOCK
}

#[cfg(not(unix))]
fn is_busy_errno(_code: i32) -> bool {
    false
}

#[cfg(unix)]
fn is_missing_device_errno(code: i32) -> bool {
    code == libc::ENODEV || code == libc::ENXIO
}

#[cfg(not(unix))]
fn is_missing_device_errno(_code: i32) -> bool {
    false
}
