//! PermissionStore trait definition.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{HealthStatus, StorageError, StorageResult};

/// Maximum length of a group id column.
pub const MAX_GROUP_ID_LENGTH: usize = 64;

/// Maximum length of a permission node column.
pub const MAX_NODE_LENGTH: usize = 256;

/// A stored group definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredGroup {
    pub id: String,
    pub name: String,
    pub prefix: Option<String>,
    pub is_default: bool,
    pub parents: Vec<String>,
    /// Node pattern -> granted.
    pub permissions: BTreeMap<String, bool>,
}

/// A stored membership row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMembership {
    pub group_id: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub granted_at: DateTime<Utc>,
}

/// Everything stored for one player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredProfile {
    pub player_id: Uuid,
    /// Memberships in grant order.
    pub memberships: Vec<StoredMembership>,
    pub overrides: BTreeMap<String, bool>,
    pub created_at: DateTime<Utc>,
}

impl StoredProfile {
    pub fn new(player_id: Uuid, created_at: DateTime<Utc>) -> Self {
        Self {
            player_id,
            memberships: Vec::new(),
            overrides: BTreeMap::new(),
            created_at,
        }
    }
}

/// Kind of write recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    SaveGroup,
    DeleteGroup,
    GrantGroup,
    RevokeGroup,
    SetOverride,
    ClearOverride,
    PurgeExpired,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SaveGroup => "save_group",
            Self::DeleteGroup => "delete_group",
            Self::GrantGroup => "grant_group",
            Self::RevokeGroup => "revoke_group",
            Self::SetOverride => "set_override",
            Self::ClearOverride => "clear_override",
            Self::PurgeExpired => "purge_expired",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "save_group" => Self::SaveGroup,
            "delete_group" => Self::DeleteGroup,
            "grant_group" => Self::GrantGroup,
            "revoke_group" => Self::RevokeGroup,
            "set_override" => Self::SetOverride,
            "clear_override" => Self::ClearOverride,
            "purge_expired" => Self::PurgeExpired,
            other => {
                return Err(StorageError::SerializationError {
                    message: format!("unknown audit action '{other}'"),
                })
            }
        })
    }
}

/// One row of the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub action: AuditAction,
    pub player_id: Option<Uuid>,
    pub group_id: Option<String>,
    pub detail: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Validates a group id column value.
pub fn validate_group_id(id: &str) -> StorageResult<()> {
    if id.is_empty() {
        return Err(StorageError::InvalidInput {
            message: "group id cannot be empty".to_string(),
        });
    }
    if id.len() > MAX_GROUP_ID_LENGTH {
        return Err(StorageError::InvalidInput {
            message: format!("group id exceeds {MAX_GROUP_ID_LENGTH} characters"),
        });
    }
    Ok(())
}

/// Validates a group definition before it is written.
pub fn validate_group(group: &StoredGroup) -> StorageResult<()> {
    validate_group_id(&group.id)?;
    if group.name.is_empty() {
        return Err(StorageError::InvalidInput {
            message: format!("group '{}' has an empty name", group.id),
        });
    }
    for parent in &group.parents {
        validate_group_id(parent)?;
        if parent == &group.id {
            return Err(StorageError::ConstraintViolation {
                message: format!("group '{}' cannot inherit from itself", group.id),
            });
        }
    }
    for node in group.permissions.keys() {
        validate_node(node)?;
    }
    Ok(())
}

/// Validates a permission node column value.
pub fn validate_node(node: &str) -> StorageResult<()> {
    if node.is_empty() || node.len() > MAX_NODE_LENGTH {
        return Err(StorageError::InvalidInput {
            message: format!("permission node must be 1-{MAX_NODE_LENGTH} characters"),
        });
    }
    Ok(())
}

/// Abstract storage interface for groups, memberships and overrides.
///
/// Implementations must be thread-safe (Send + Sync) and support
/// async operations. Every write commits its data change together with an
/// audit row.
#[async_trait]
pub trait PermissionStore: Send + Sync + 'static {
    // Group operations

    /// Loads every group definition.
    async fn load_all_groups(&self) -> StorageResult<Vec<StoredGroup>>;

    /// Inserts or replaces a group, its parent edges and its permissions.
    ///
    /// When the group is marked default, the flag is cleared on every other group
    /// in the same transaction.
    async fn save_group(&self, group: &StoredGroup) -> StorageResult<()>;

    /// Deletes a group and every membership in it.
    ///
    /// Fails with `ConstraintViolation` while another group inherits from it.
    async fn delete_group(&self, id: &str) -> StorageResult<()>;

    // Player operations

    /// Loads a player's memberships and overrides. `None` if the player is unknown.
    async fn load_profile(&self, player: Uuid) -> StorageResult<Option<StoredProfile>>;

    /// Creates an empty profile if the player is unknown.
    async fn ensure_profile(&self, player: Uuid) -> StorageResult<()>;

    /// Grants a group, replacing the expiry of an existing membership.
    async fn grant_group(
        &self,
        player: Uuid,
        group_id: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> StorageResult<()>;

    /// Revokes a group. Fails with `MembershipNotFound` if the player does not hold it.
    async fn revoke_group(&self, player: Uuid, group_id: &str) -> StorageResult<()>;

    /// Sets an explicit per-player value for a node.
    async fn set_override(&self, player: Uuid, node: &str, value: bool) -> StorageResult<()>;

    /// Removes an explicit per-player value. Fails with `OverrideNotFound` if absent.
    async fn clear_override(&self, player: Uuid, node: &str) -> StorageResult<()>;

    /// Deletes memberships that expired at or before `now`.
    ///
    /// Returns the ids of the purged groups.
    async fn purge_expired_memberships(
        &self,
        player: Uuid,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<String>>;

    // Audit & health

    /// Returns up to `limit` audit entries, newest first.
    async fn read_audit_log(&self, limit: usize) -> StorageResult<Vec<AuditEntry>>;

    /// Checks that the backend is reachable.
    async fn health_check(&self) -> StorageResult<HealthStatus>;
}
