//! Unified error types for Mender

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Why a pipeline phase gave up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseFailure {
    /// The phase exceeded its sub-timeout
    DeadlineExceeded,
    /// The root cancellation token fired while the phase was running
    Cancelled,
    /// The collaborator returned an error
    Operation,
}

impl fmt::Display for PhaseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeadlineExceeded => write!(f, "deadline exceeded"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Operation => write!(f, "operation failed"),
        }
    }
}

/// Unified error type for all Mender operations
#[derive(Error, Debug)]
pub enum MenderError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Resilience errors
    #[error("circuit breaker is OPEN for {operation}")]
    CircuitOpen { operation: String },

    #[error("{operation} failed after {attempts} attempts, last error: {source}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<MenderError>,
    },

    #[error("{operation} cancelled")]
    Cancelled { operation: String },

    #[error("phase '{phase}' {failure} after {elapsed:?}: {source}")]
    Phase {
        phase: &'static str,
        failure: PhaseFailure,
        elapsed: Duration,
        #[source]
        source: Box<MenderError>,
    },

    // Collaborator errors
    #[error("Analysis error: {0}")]
    Analysis(String),

    #[error("Remediation error: {0}")]
    Remediation(String),

    #[error("Invalid pull request: {0}")]
    InvalidPullRequest(String),

    // Pool / lifecycle errors
    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Capture error: {0}")]
    Capture(String),

    #[error("Invalid status transition for event {event_id}: {from} -> {to}")]
    InvalidTransition {
        event_id: String,
        from: String,
        to: String,
    },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

impl MenderError {
    /// True when this error (or the error it wraps) came from cancellation
    /// rather than from a downstream failure.
    pub fn is_cancellation(&self) -> bool {
        match self {
            Self::Cancelled { .. } => true,
            Self::Phase {
                failure: PhaseFailure::Cancelled,
                ..
            } => true,
            Self::Phase { source, .. } | Self::RetryExhausted { source, .. } => {
                source.is_cancellation()
            }
            _ => false,
        }
    }

    /// Whether another attempt could plausibly succeed
    ///
    /// An open circuit rejects the whole event, and malformed requests or
    /// configuration fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::CircuitOpen { .. }
            | Self::Config(_)
            | Self::InvalidPullRequest(_)
            | Self::InvalidTransition { .. } => false,
            Self::Phase {
                failure: PhaseFailure::Operation,
                source,
                ..
            } => source.is_retryable(),
            other => !other.is_cancellation(),
        }
    }

    /// True when the error is a deadline on a pipeline phase
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Phase {
                failure: PhaseFailure::DeadlineExceeded,
                ..
            }
        )
    }

    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }
}

/// Result type alias using MenderError
pub type Result<T> = std::result::Result<T, MenderError>;
