//! rankguard-storage: Persistence repository
//!
//! This crate provides the storage abstraction for rankguard, including:
//! - PermissionStore trait for groups, memberships, overrides and the audit log
//! - In-memory implementation for testing
//! - PostgreSQL implementation for production
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │             rankguard-storage               │
//! ├─────────────────────────────────────────────┤
//! │  traits.rs   - PermissionStore definition   │
//! │  memory.rs   - In-memory implementation     │
//! │  postgres.rs - PostgreSQL implementation    │
//! └─────────────────────────────────────────────┘
//! ```

pub mod error;
pub mod memory;
pub mod postgres;
pub mod traits;

// Re-export commonly used types
pub use error::{HealthStatus, PoolStats, StorageError, StorageResult};
pub use memory::MemoryPermissionStore;
pub use postgres::{PostgresConfig, PostgresPermissionStore};
pub use traits::{
    AuditAction, AuditEntry, PermissionStore, StoredGroup, StoredMembership, StoredProfile,
};
