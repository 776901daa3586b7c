//! Error types for MOMENTUM
//!
//! Every fallible operation in the transport returns [`MomentumResult`].
//! Acquire timeouts are not errors: `Stream::next` reports them as `Ok(None)`.

use std::fmt;
use thiserror::Error;

/// Kind of named resource an error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Stream,
    Route,
    Processor,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Stream => write!(f, "stream"),
            ResourceKind::Route => write!(f, "route"),
            ResourceKind::Processor => write!(f, "processor"),
        }
    }
}

/// Main error type for MOMENTUM operations
#[derive(Debug, Error)]
pub enum MomentumError {
    /// A stream was reopened with a shape different from the one recorded in its header
    #[error("Configuration mismatch for stream '{name}': {detail}")]
    ConfigMismatch { name: String, detail: String },

    /// The resource is still in use (attached segment, full consumer table)
    #[error("Resource busy: {0}")]
    ResourceBusy(String),

    #[error("{kind} '{name}' does not exist")]
    ResourceNotFound { kind: ResourceKind, name: String },

    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: ResourceKind, name: String },

    /// The owning context was torn down while the operation was blocked
    #[error("Operation cancelled: context is shutting down")]
    Cancelled,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The backing file exists but does not hold a valid stream segment
    #[error("Invalid segment '{name}': {detail}")]
    InvalidSegment { name: String, detail: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience type alias for Results using MomentumError
pub type MomentumResult<T> = Result<T, MomentumError>;

impl MomentumError {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        MomentumError::Config(msg.into())
    }

    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        MomentumError::InvalidInput(msg.into())
    }

    pub fn busy<S: Into<String>>(msg: S) -> Self {
        MomentumError::ResourceBusy(msg.into())
    }

    pub fn not_found<S: Into<String>>(kind: ResourceKind, name: S) -> Self {
        MomentumError::ResourceNotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn already_exists<S: Into<String>>(kind: ResourceKind, name: S) -> Self {
        MomentumError::AlreadyExists {
            kind,
            name: name.into(),
        }
    }

    pub fn mismatch<S: Into<String>, D: Into<String>>(name: S, detail: D) -> Self {
        MomentumError::ConfigMismatch {
            name: name.into(),
            detail: detail.into(),
        }
    }

    pub fn invalid_segment<S: Into<String>, D: Into<String>>(name: S, detail: D) -> Self {
        MomentumError::InvalidSegment {
            name: name.into(),
            detail: detail.into(),
        }
    }

    /// True for the "nothing to act on" case callers may treat as best-effort success
    pub fn is_not_found(&self) -> bool {
        matches!(self, MomentumError::ResourceNotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_name_the_resource() {
        let err = MomentumError::not_found(ResourceKind::Route, "camera");
        assert_eq!(err.to_string(), "route 'camera' does not exist");
        assert!(err.is_not_found());

        let err = MomentumError::already_exists(ResourceKind::Stream, "frames");
        assert_eq!(err.to_string(), "stream 'frames' already exists");
    }
}
