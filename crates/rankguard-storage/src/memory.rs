//! In-memory storage implementation for testing and single-node use.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::json;
use tracing::instrument;
use uuid::Uuid;

use crate::error::{HealthStatus, StorageError, StorageResult};
use crate::traits::{
    validate_group, validate_group_id, validate_node, AuditAction, AuditEntry, PermissionStore,
    StoredGroup, StoredMembership, StoredProfile,
};

/// In-memory implementation of PermissionStore.
///
/// Groups and players live in DashMaps. Writes that span several groups (moving
/// the default flag, deleting a group and its memberships) run under
/// `group_writes` so they are atomic with respect to each other.
#[derive(Debug, Default)]
pub struct MemoryPermissionStore {
    groups: DashMap<String, StoredGroup>,
    players: DashMap<Uuid, StoredProfile>,
    group_writes: Mutex<()>,
    audit: Mutex<Vec<AuditEntry>>,
    next_audit_id: AtomicI64,
}

impl MemoryPermissionStore {
    /// Creates a new in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new in-memory store wrapped in Arc.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn record(
        &self,
        action: AuditAction,
        player_id: Option<Uuid>,
        group_id: Option<&str>,
        detail: serde_json::Value,
    ) {
        let entry = AuditEntry {
            id: self.next_audit_id.fetch_add(1, Ordering::SeqCst) + 1,
            action,
            player_id,
            group_id: group_id.map(str::to_string),
            detail,
            created_at: Utc::now(),
        };
        self.audit
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry);
    }

    fn lock_groups(&self) -> std::sync::MutexGuard<'_, ()> {
        self.group_writes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl PermissionStore for MemoryPermissionStore {
    async fn load_all_groups(&self) -> StorageResult<Vec<StoredGroup>> {
        let mut groups: Vec<StoredGroup> = self.groups.iter().map(|g| g.value().clone()).collect();
        groups.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(groups)
    }

    #[instrument(skip(self, group), fields(group_id = %group.id))]
    async fn save_group(&self, group: &StoredGroup) -> StorageResult<()> {
        validate_group(group)?;
        let _guard = self.lock_groups();

        for parent in &group.parents {
            if !self.groups.contains_key(parent) {
                return Err(StorageError::GroupNotFound {
                    group_id: parent.clone(),
                });
            }
        }

        if group.is_default {
            for mut other in self.groups.iter_mut() {
                if other.id != group.id {
                    other.is_default = false;
                }
            }
        }
        self.groups.insert(group.id.clone(), group.clone());
        self.record(
            AuditAction::SaveGroup,
            None,
            Some(&group.id),
            json!({
                "name": group.name,
                "parents": group.parents,
                "permissions": group.permissions.len(),
                "is_default": group.is_default,
            }),
        );
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_group(&self, id: &str) -> StorageResult<()> {
        validate_group_id(id)?;
        let _guard = self.lock_groups();

        if !self.groups.contains_key(id) {
            return Err(StorageError::GroupNotFound {
                group_id: id.to_string(),
            });
        }
        let children: Vec<String> = self
            .groups
            .iter()
            .filter(|g| g.parents.iter().any(|p| p == id))
            .map(|g| g.id.clone())
            .collect();
        if !children.is_empty() {
            return Err(StorageError::ConstraintViolation {
                message: format!("group '{id}' is still a parent of: {}", children.join(", ")),
            });
        }

        self.groups.remove(id);
        let mut removed_memberships = 0usize;
        for mut player in self.players.iter_mut() {
            let before = player.memberships.len();
            player.memberships.retain(|m| m.group_id != id);
            removed_memberships += before - player.memberships.len();
        }
        self.record(
            AuditAction::DeleteGroup,
            None,
            Some(id),
            json!({ "memberships_removed": removed_memberships }),
        );
        Ok(())
    }

    async fn load_profile(&self, player: Uuid) -> StorageResult<Option<StoredProfile>> {
        Ok(self.players.get(&player).map(|p| p.value().clone()))
    }

    async fn ensure_profile(&self, player: Uuid) -> StorageResult<()> {
        self.players
            .entry(player)
            .or_insert_with(|| StoredProfile::new(player, Utc::now()));
        Ok(())
    }

    #[instrument(skip(self))]
    async fn grant_group(
        &self,
        player: Uuid,
        group_id: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> StorageResult<()> {
        validate_group_id(group_id)?;
        let _guard = self.lock_groups();
        if !self.groups.contains_key(group_id) {
            return Err(StorageError::GroupNotFound {
                group_id: group_id.to_string(),
            });
        }

        let now = Utc::now();
        let mut profile = self
            .players
            .entry(player)
            .or_insert_with(|| StoredProfile::new(player, now));
        match profile.memberships.iter_mut().find(|m| m.group_id == group_id) {
            Some(existing) => existing.expires_at = expires_at,
            None => profile.memberships.push(StoredMembership {
                group_id: group_id.to_string(),
                expires_at,
                granted_at: now,
            }),
        }
        drop(profile);

        self.record(
            AuditAction::GrantGroup,
            Some(player),
            Some(group_id),
            json!({ "expires_at": expires_at }),
        );
        Ok(())
    }

    #[instrument(skip(self))]
    async fn revoke_group(&self, player: Uuid, group_id: &str) -> StorageResult<()> {
        validate_group_id(group_id)?;
        let not_found = || StorageError::MembershipNotFound {
            player_id: player,
            group_id: group_id.to_string(),
        };

        {
            let mut profile = self.players.get_mut(&player).ok_or_else(not_found)?;
            let before = profile.memberships.len();
            profile.memberships.retain(|m| m.group_id != group_id);
            if profile.memberships.len() == before {
                return Err(not_found());
            }
        }

        self.record(AuditAction::RevokeGroup, Some(player), Some(group_id), json!({}));
        Ok(())
    }

    #[instrument(skip(self))]
    async fn set_override(&self, player: Uuid, node: &str, value: bool) -> StorageResult<()> {
        validate_node(node)?;
        self.players
            .entry(player)
            .or_insert_with(|| StoredProfile::new(player, Utc::now()))
            .overrides
            .insert(node.to_string(), value);
        self.record(
            AuditAction::SetOverride,
            Some(player),
            None,
            json!({ "node": node, "value": value }),
        );
        Ok(())
    }

    #[instrument(skip(self))]
    async fn clear_override(&self, player: Uuid, node: &str) -> StorageResult<()> {
        validate_node(node)?;
        let removed = self
            .players
            .get_mut(&player)
            .and_then(|mut profile| profile.overrides.remove(node));
        if removed.is_none() {
            return Err(StorageError::OverrideNotFound {
                player_id: player,
                node: node.to_string(),
            });
        }
        self.record(
            AuditAction::ClearOverride,
            Some(player),
            None,
            json!({ "node": node }),
        );
        Ok(())
    }

    async fn purge_expired_memberships(
        &self,
        player: Uuid,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<String>> {
        let purged: Vec<String> = match self.players.get_mut(&player) {
            Some(mut profile) => {
                let (expired, active): (Vec<StoredMembership>, Vec<StoredMembership>) = profile
                    .memberships
                    .drain(..)
                    .partition(|m| m.expires_at.is_some_and(|at| at <= now));
                profile.memberships = active;
                expired.into_iter().map(|m| m.group_id).collect()
            }
            None => Vec::new(),
        };

        if !purged.is_empty() {
            self.record(
                AuditAction::PurgeExpired,
                Some(player),
                None,
                json!({ "groups": purged }),
            );
        }
        Ok(purged)
    }

    async fn read_audit_log(&self, limit: usize) -> StorageResult<Vec<AuditEntry>> {
        let audit = self.audit.lock().unwrap_or_else(|e| e.into_inner());
        Ok(audit.iter().rev().take(limit).cloned().collect())
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        // In-memory storage is always healthy - no external dependencies
        Ok(HealthStatus {
            healthy: true,
            latency: std::time::Duration::ZERO,
            pool_stats: None,
            message: Some("in-memory storage".to_string()),
        })
    }
}
