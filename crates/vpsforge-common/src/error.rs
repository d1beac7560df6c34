//! Unified error types for the vpsforge workspace.
//!
//! Validation and authorization failures are raised before any side
//! effect happens. External call failures raised inside the provisioning
//! pipeline are wrapped in [`ForgeError::Provisioning`] once the record has
//! been persisted as failed.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::types::{ContainerId, ContainerStatus, ProvisionStep};

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum ForgeError {
    /// No free value is left inside the configured bounds.
    #[error("no free {resource} left in range {min}..={max}")]
    AllocationExhausted {
        /// Pool that ran dry (`container id`, `private ip`, `ssh port`).
        resource: &'static str,
        /// Lower bound of the pool.
        min: u64,
        /// Upper bound of the pool.
        max: u64,
    },

    /// The request is malformed or names an unknown plan or template.
    #[error("invalid request: {message}")]
    Validation {
        /// Description of what was rejected.
        message: String,
    },

    /// A hypervisor, shell, or firewall operation reported failure.
    #[error("{operation} failed: {message}")]
    ExternalCallFailed {
        /// Operation that failed.
        operation: String,
        /// Diagnostic returned by the external system.
        message: String,
    },

    /// An external call did not finish within its time budget.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// Operation that timed out.
        operation: String,
        /// Budget that was exceeded.
        after: Duration,
    },

    /// The caller does not own the record or did not confirm the request.
    #[error("unauthorized: {message}")]
    Authorization {
        /// Description of the failed check.
        message: String,
    },

    /// The state store could not read or write records.
    #[error("persistence error: {message}")]
    Persistence {
        /// Description of the store failure.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// The record's status does not allow the requested operation.
    #[error("cannot {operation} container {id} while {status}")]
    InvalidState {
        /// Record the operation targeted.
        id: ContainerId,
        /// Status or power state that blocked the operation.
        status: String,
        /// Operation that was refused.
        operation: &'static str,
    },

    /// A provisioning step failed; the record has been marked `error`.
    #[error("provisioning container {id} failed at {step}: {source}")]
    Provisioning {
        /// Record left in `error`.
        id: ContainerId,
        /// Step that failed.
        step: ProvisionStep,
        /// Underlying failure.
        source: Box<ForgeError>,
    },

    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl ForgeError {
    /// Shorthand for a [`ForgeError::Validation`].
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Shorthand for a [`ForgeError::ExternalCallFailed`].
    pub fn external(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExternalCallFailed {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a [`ForgeError::Authorization`].
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Authorization {
            message: message.into(),
        }
    }

    /// Shorthand for a [`ForgeError::Persistence`].
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
        }
    }

    /// Returns `true` for failures reported by an external system,
    /// including timeouts.
    #[must_use]
    pub fn is_external(&self) -> bool {
        match self {
            Self::ExternalCallFailed { .. } | Self::Timeout { .. } => true,
            Self::Provisioning { source, .. } => source.is_external(),
            _ => false,
        }
    }

    /// Returns `true` when the error was raised before any side effect.
    #[must_use]
    pub const fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. } | Self::Authorization { .. } | Self::NotFound { .. }
        )
    }
}

/// Builds an [`ForgeError::InvalidState`] for a record.
pub fn invalid_state(
    id: ContainerId,
    status: ContainerStatus,
    operation: &'static str,
) -> ForgeError {
    ForgeError::InvalidState {
        id,
        status: status.to_string(),
        operation,
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, ForgeError>;
