//! Error types for the Trackgate service.

use thiserror::Error;

/// Main error type for Trackgate operations.
///
/// Rejecting a request is not an error: it is an
/// [`Admission::Rejected`](crate::ratelimit::Admission) outcome.
#[derive(Error, Debug)]
pub enum TrackgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A policy whose parameters can never work
    #[error("Invalid rate limit policy '{name}': {reason}")]
    InvalidPolicy { name: String, reason: String },

    /// A policy name registered twice
    #[error("Rate limit policy '{0}' is already registered")]
    DuplicatePolicy(String),

    /// A dispatch rule pointing at a policy that does not exist
    #[error("Dispatch rule references unknown policy '{0}'")]
    UnknownPolicy(String),

    /// A dispatch rule with an unusable method or path
    #[error("Invalid dispatch rule: {0}")]
    InvalidRule(String),

    /// Background work requested without an async runtime
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Trackgate operations.
pub type Result<T> = std::result::Result<T, TrackgateError>;
