//! Domain error types for permission operations.

use thiserror::Error;

/// Domain-specific errors for permission operations.
///
/// `CyclicInheritance`, `ConstraintViolation` and `InvalidNode` signal a caller
/// error and are never retried. `TransientIo` is retryable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DomainError {
    /// A group, membership or player could not be found.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The proposed inheritance edges would introduce a cycle.
    #[error("cyclic inheritance: {path}")]
    CyclicInheritance { path: String },

    /// Storage failed in a way that may succeed on retry.
    #[error("transient storage failure: {message}")]
    TransientIo { message: String },

    /// The edit would break a structural constraint.
    #[error("constraint violation: {message}")]
    ConstraintViolation { message: String },

    /// A permission node is malformed.
    #[error("invalid permission node '{node}': {reason}")]
    InvalidNode { node: String, reason: String },

    /// Non-retryable internal failure.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl DomainError {
    /// Shorthand for a missing group.
    pub fn group_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "group",
            id: id.into(),
        }
    }

    /// Returns true if the operation may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientIo { .. })
    }
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_errors_are_retryable() {
        assert!(DomainError::TransientIo {
            message: "timeout".into()
        }
        .is_retryable());
        assert!(!DomainError::CyclicInheritance {
            path: "a -> b -> a".into()
        }
        .is_retryable());
        assert!(!DomainError::group_not_found("vip").is_retryable());
        assert!(!DomainError::InvalidNode {
            node: "a..b".into(),
            reason: "empty segment".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_error_messages_name_the_subject() {
        let err = DomainError::group_not_found("vip");
        assert_eq!(err.to_string(), "group not found: vip");
    }
}
