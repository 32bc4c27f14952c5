//! Adapters that bridge the storage layer to the domain layer.
//!
//! The domain layer defines [`ProfileReader`] for loading player profiles and works
//! with validated [`Group`]/[`PlayerProfile`] values. The storage layer persists
//! plain rows. This module converts between the two and maps [`StorageError`]
//! onto [`DomainError`].

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use rankguard_domain::model::validate_group_id;
use rankguard_domain::resolver::ProfileReader;
use rankguard_domain::{
    Clock, DomainError, DomainResult, Group, Membership, PermissionNode, PlayerProfile,
};
use rankguard_storage::{PermissionStore, StorageError, StoredGroup, StoredProfile};
use tracing::{debug, warn};
use uuid::Uuid;

/// Maps a storage failure onto the domain taxonomy.
pub fn map_storage_error(error: StorageError) -> DomainError {
    if error.is_transient() {
        return DomainError::TransientIo {
            message: error.to_string(),
        };
    }
    match error {
        StorageError::GroupNotFound { group_id } => DomainError::group_not_found(group_id),
        StorageError::MembershipNotFound {
            player_id,
            group_id,
        } => DomainError::NotFound {
            kind: "membership",
            id: format!("{player_id}/{group_id}"),
        },
        StorageError::OverrideNotFound { player_id, node } => DomainError::NotFound {
            kind: "override",
            id: format!("{player_id}/{node}"),
        },
        StorageError::ConstraintViolation { message } | StorageError::InvalidInput { message } => {
            DomainError::ConstraintViolation { message }
        }
        other => DomainError::Internal {
            message: other.to_string(),
        },
    }
}

/// Converts a domain group into its stored row form.
pub fn group_to_stored(group: &Group) -> StoredGroup {
    StoredGroup {
        id: group.id.clone(),
        name: group.name.clone(),
        prefix: group.prefix.clone(),
        is_default: group.is_default,
        parents: group.parents.iter().cloned().collect(),
        permissions: group
            .permissions
            .iter()
            .map(|(node, value)| (node.as_str().to_string(), *value))
            .collect(),
    }
}

/// Converts a stored group into a domain group, validating every node.
pub fn stored_to_group(stored: StoredGroup) -> DomainResult<Group> {
    validate_group_id(&stored.id)?;
    let mut group = Group::new(stored.id, stored.name);
    group.prefix = stored.prefix;
    group.is_default = stored.is_default;
    group.parents = stored.parents.into_iter().collect();
    for (node, value) in &stored.permissions {
        group.set_permission(node, *value)?;
    }
    Ok(group)
}

/// Converts a stored profile into a domain profile.
///
/// Overrides whose node no longer parses are skipped with a warning so that one
/// bad row cannot lock a player out of resolution.
pub fn stored_to_profile(stored: StoredProfile) -> PlayerProfile {
    let mut profile = PlayerProfile::new(stored.player_id);
    profile.memberships = stored
        .memberships
        .into_iter()
        .map(|m| Membership {
            group_id: m.group_id,
            expires_at: m.expires_at,
        })
        .collect();
    for (node, value) in stored.overrides {
        match PermissionNode::parse(&node) {
            Ok(parsed) => {
                profile.overrides.insert(parsed, value);
            }
            Err(e) => {
                warn!(player = %stored.player_id, node = %node, error = %e, "Skipping unparseable override");
            }
        }
    }
    profile
}

/// Adapter that implements [`ProfileReader`] using a [`PermissionStore`].
///
/// Unknown players load as an empty profile. Memberships found expired while
/// loading are purged from storage on a best-effort basis, and the purged group
/// ids are kept until [`take_purged`](Self::take_purged) collects them.
pub struct StoreProfileReader<S: PermissionStore + ?Sized> {
    storage: Arc<S>,
    clock: Arc<dyn Clock>,
    purged: DashMap<Uuid, Vec<String>>,
}

impl<S: PermissionStore + ?Sized> StoreProfileReader<S> {
    /// Creates a new adapter wrapping the given storage.
    pub fn new(storage: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            clock,
            purged: DashMap::new(),
        }
    }

    /// Removes and returns the groups purged for `player` by earlier loads.
    pub fn take_purged(&self, player: Uuid) -> Vec<String> {
        self.purged
            .remove(&player)
            .map(|(_, groups)| groups)
            .unwrap_or_default()
    }
}

#[async_trait]
impl<S: PermissionStore + ?Sized> ProfileReader for StoreProfileReader<S> {
    async fn load_profile(&self, player: Uuid) -> DomainResult<PlayerProfile> {
        let Some(stored) = self
            .storage
            .load_profile(player)
            .await
            .map_err(map_storage_error)?
        else {
            return Ok(PlayerProfile::new(player));
        };

        let profile = stored_to_profile(stored);
        let now = self.clock.now();
        if !profile.expired_group_ids(now).is_empty() {
            match self.storage.purge_expired_memberships(player, now).await {
                Ok(purged) if purged.is_empty() => {}
                Ok(purged) => {
                    debug!(player = %player, purged = ?purged, "Purged expired memberships");
                    self.purged.entry(player).or_default().extend(purged);
                }
                Err(e) => {
                    warn!(player = %player, error = %e, "Failed to purge expired memberships")
                }
            }
        }
        Ok(profile)
    }
}
