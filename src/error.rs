//! Error types for podlease.
//!
//! This module provides the error hierarchy for every stage of a lease:
//! configuration, capacity API access, GPU selection, the instance
//! lifecycle, and tunnel supervision.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::lifecycle::{InstanceState, LifecycleEvent};

/// The main error type for podlease.
#[derive(Debug, Error)]
pub enum PodleaseError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Capacity backend (RunPod API) errors.
    #[error("RunPod API error: {0}")]
    Capacity(#[from] CapacityError),

    /// GPU selection errors.
    #[error("Selection error: {0}")]
    Selection(#[from] SelectionError),

    /// Instance lifecycle errors.
    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    /// Tunnel errors.
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// A configuration value could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Variable or file the value came from.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },

    /// Invalid tunnel port specification.
    #[error("Invalid port specification: {spec}")]
    InvalidPort {
        /// The invalid port specification.
        spec: String,
    },
}

/// Errors returned by the capacity backend.
#[derive(Debug, Error)]
pub enum CapacityError {
    /// The API token was rejected (401/403). Never retried.
    #[error("authentication failed: {message}")]
    Auth {
        /// Description of the auth failure.
        message: String,
    },

    /// Network failure, 5xx or rate limiting. Retried with backoff.
    #[error("transient failure{}: {message}", .status.map(|s| format!(" ({s})")).unwrap_or_default())]
    Transient {
        /// HTTP status code, when a response was received.
        status: Option<u16>,
        /// Description of the failure.
        message: String,
    },

    /// The requested GPU offering has no capacity left.
    #[error("no instances available for {offering}: {message}")]
    CapacityUnavailable {
        /// Offering that was requested.
        offering: String,
        /// Message from the backend.
        message: String,
    },

    /// The instance does not exist (anymore).
    #[error("instance not found: {id}")]
    NotFound {
        /// Instance identifier.
        id: String,
    },

    /// The backend rejected the request for a non-retryable reason.
    #[error("request rejected ({status}): {message}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Message from the backend.
        message: String,
    },

    /// The backend answered with something we could not understand.
    #[error("invalid response: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },
}

/// GPU selection errors.
#[derive(Debug, Error)]
pub enum SelectionError {
    /// No offering satisfies the constraints.
    #[error("no GPU offering matches the constraints: {reason}")]
    NoCandidate {
        /// Why every offering was filtered out.
        reason: String,
    },
}

/// Instance lifecycle errors.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The instance did not become ready before the polling ceiling.
    #[error("pod {id} was not running after {waited_secs}s")]
    ProvisioningTimeout {
        /// Instance identifier.
        id: String,
        /// Seconds spent polling.
        waited_secs: u64,
    },

    /// The instance ended up in a state it cannot recover from.
    #[error("pod {id} failed to start: {reason}")]
    ProvisioningFailed {
        /// Instance identifier.
        id: String,
        /// Description of the failure.
        reason: String,
    },

    /// An event is not allowed in the current state.
    #[error("cannot apply {event} while {from}")]
    InvalidTransition {
        /// State the instance was in.
        from: InstanceState,
        /// Rejected event.
        event: LifecycleEvent,
    },

    /// A live instance is already tracked by this run.
    #[error("pod {id} is already tracked by this run")]
    AlreadyTracking {
        /// Identifier of the tracked instance.
        id: String,
    },

    /// No instance is tracked.
    #[error("no pod is tracked by this run")]
    NoInstance,

    /// Termination could not be confirmed after the retry budget.
    #[error("failed to terminate pod {id}: {message}")]
    TerminationFailed {
        /// Instance identifier.
        id: String,
        /// Underlying cause.
        message: String,
    },
}

/// Tunnel errors.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Neither a private key nor a password is available.
    #[error("no SSH credentials: add a key under ~/.ssh or set SSH_PASSWORD")]
    NoCredentials,

    /// The forwarding process could not be spawned.
    #[error("failed to spawn tunnel '{label}': {message}")]
    Spawn {
        /// Tunnel label.
        label: String,
        /// Underlying cause.
        message: String,
    },

    /// A forwarding session died or never started listening.
    #[error("tunnel '{label}' on local port {local_port} failed: {message}")]
    StartFailed {
        /// Tunnel label.
        label: String,
        /// Local port of the session.
        local_port: u16,
        /// Captured stderr or listen-check failure.
        message: String,
    },

    /// The local port is unavailable on every bind address.
    #[error("local port {port} cannot be bound on any address")]
    BindUnavailable {
        /// The unavailable port.
        port: u16,
    },

    /// Tunnel startup exceeded its ceiling.
    #[error("tunnel startup did not finish within {waited_secs}s")]
    Timeout {
        /// Seconds waited.
        waited_secs: u64,
    },
}

/// A step of the orchestration sequence, used to name failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Loading and validating configuration.
    Configuration,
    /// Fetching offerings and choosing a GPU.
    Selection,
    /// Creating the pod and waiting for it to run.
    Provisioning,
    /// Opening the SSH tunnels.
    TunnelStartup,
    /// Tearing everything down.
    Cleanup,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            Self::Configuration => "configuration",
            Self::Selection => "selection",
            Self::Provisioning => "provisioning",
            Self::TunnelStartup => "tunnel startup",
            Self::Cleanup => "cleanup",
        };
        write!(f, "{stage}")
    }
}

/// An error annotated with the stage it aborted.
#[derive(Debug, Error)]
#[error("{stage} failed: {source}")]
pub struct StageError {
    /// Stage that failed.
    pub stage: Stage,
    /// Underlying cause.
    #[source]
    pub source: PodleaseError,
}

/// Result type alias for podlease operations.
pub type Result<T> = std::result::Result<T, PodleaseError>;

impl PodleaseError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is worth retrying.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Capacity(CapacityError::Transient { .. }))
    }

    /// Returns true if the backend reported the offering as exhausted.
    #[must_use]
    pub const fn is_capacity_unavailable(&self) -> bool {
        matches!(self, Self::Capacity(CapacityError::CapacityUnavailable { .. }))
    }

    /// Returns true if the backend reported the resource as missing.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::Capacity(CapacityError::NotFound { .. }))
    }

    /// Attaches the stage this error aborted.
    #[must_use]
    pub fn at(self, stage: Stage) -> StageError {
        StageError {
            stage,
            source: self,
        }
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a parse error for a specific variable.
    #[must_use]
    pub fn parse(message: impl Into<String>, location: impl Into<String>) -> Self {
        Self::ParseError {
            message: message.into(),
            location: Some(location.into()),
        }
    }
}

impl CapacityError {
    /// Creates a transient error without an HTTP status.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Transient {
            status: None,
            message: message.into(),
        }
    }

    /// Creates an invalid-response error.
    #[must_use]
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidResponse {
            message: message.into(),
        }
    }
}
