//! Storage error types.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Storage-specific errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Group not found.
    #[error("group not found: {group_id}")]
    GroupNotFound { group_id: String },

    /// The player does not hold the group.
    #[error("membership not found: {player_id} in {group_id}")]
    MembershipNotFound { player_id: Uuid, group_id: String },

    /// The player has no override for the node.
    #[error("override not found: {player_id} on {node}")]
    OverrideNotFound { player_id: Uuid, node: String },

    /// A write would break a referential or uniqueness constraint.
    #[error("constraint violation: {message}")]
    ConstraintViolation { message: String },

    /// Database connection error.
    #[error("database connection error: {message}")]
    ConnectionError { message: String },

    /// Query exceeded its timeout.
    #[error("query timeout: {operation} exceeded {timeout:?}")]
    QueryTimeout {
        operation: String,
        timeout: Duration,
    },

    /// Database query error.
    #[error("database query error: {message}")]
    QueryError { message: String },

    /// Transaction error.
    #[error("transaction error: {message}")]
    TransactionError { message: String },

    /// Invalid input error.
    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    /// Serialization error.
    #[error("serialization error: {message}")]
    SerializationError { message: String },

    /// Health check failed.
    #[error("health check failed: {message}")]
    HealthCheckFailed { message: String },

    /// Internal error.
    #[error("internal storage error: {message}")]
    InternalError { message: String },
}

impl StorageError {
    /// Returns true for failures that may succeed when retried: lost connections,
    /// timeouts and aborted transactions.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionError { .. }
                | Self::QueryTimeout { .. }
                | Self::TransactionError { .. }
                | Self::HealthCheckFailed { .. }
        )
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Connection pool statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub active_connections: u32,
    pub idle_connections: u32,
    pub max_connections: u32,
}

/// Result of a storage health check.
#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub healthy: bool,
    pub latency: Duration,
    pub pool_stats: Option<PoolStats>,
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(StorageError::ConnectionError {
            message: "refused".into()
        }
        .is_transient());
        assert!(StorageError::QueryTimeout {
            operation: "load_profile".into(),
            timeout: Duration::from_secs(1),
        }
        .is_transient());
        assert!(!StorageError::GroupNotFound {
            group_id: "vip".into()
        }
        .is_transient());
        assert!(!StorageError::ConstraintViolation {
            message: "parent".into()
        }
        .is_transient());
    }

    #[test]
    fn test_timeout_message_names_operation() {
        let err = StorageError::QueryTimeout {
            operation: "grant_group".into(),
            timeout: Duration::from_millis(250),
        };
        assert!(err.to_string().contains("grant_group"));
    }
}
