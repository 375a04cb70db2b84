use thiserror::Error;

use crate::governance::ApprovalStatus;

/// Main error type for the governance layer
#[derive(Error, Debug)]
pub enum GuardError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),

    // Backend errors
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Backend error: {0}")]
    Backend(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GuardError {
    /// Whether the failure came from the transport layer (connection, timeout)
    /// rather than from the backend rejecting the request.
    pub fn is_transport(&self) -> bool {
        matches!(self, GuardError::Transport(_))
    }
}

/// Result type alias for GuardError
pub type Result<T> = std::result::Result<T, GuardError>;

/// Outcome of a failed approval resolution.
///
/// These are ordinary values: racing callers (a TTL sweep and an operator
/// click) observe them instead of a panic or a silent no-op.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApprovalError {
    #[error("Approval request not found: {id}")]
    NotFound { id: String },

    #[error("Approval request {id} already resolved as {status}")]
    AlreadyResolved { id: String, status: ApprovalStatus },
}

impl ApprovalError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            ApprovalError::NotFound { .. } => "not_found",
            ApprovalError::AlreadyResolved { .. } => "already_resolved",
        }
    }
}
