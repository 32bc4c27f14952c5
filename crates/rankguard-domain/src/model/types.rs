//! Core type definitions for groups and player profiles.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DomainError, DomainResult};

use super::node::PermissionNode;

/// Maximum length of a group id.
pub const MAX_GROUP_ID_LENGTH: usize = 64;

/// Validates a group id: 1-64 characters of `[a-z0-9_-]`.
pub fn validate_group_id(id: &str) -> DomainResult<()> {
    if id.is_empty() || id.len() > MAX_GROUP_ID_LENGTH {
        return Err(DomainError::ConstraintViolation {
            message: format!("group id must be 1-{MAX_GROUP_ID_LENGTH} characters, got '{id}'"),
        });
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '-'))
    {
        return Err(DomainError::ConstraintViolation {
            message: format!("group id may only contain [a-z0-9_-], got '{id}'"),
        });
    }
    Ok(())
}

/// A named bundle of permission grants and denials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Stable identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Optional chat/tab prefix shown by the host.
    pub prefix: Option<String>,
    /// Whether players without any active membership fall back to this group.
    pub is_default: bool,
    /// Ids of the groups this group inherits from.
    pub parents: BTreeSet<String>,
    /// Node pattern to grant (`true`) or deny (`false`).
    pub permissions: BTreeMap<PermissionNode, bool>,
}

impl Group {
    /// Creates an empty group.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            prefix: None,
            is_default: false,
            parents: BTreeSet::new(),
            permissions: BTreeMap::new(),
        }
    }

    /// Adds an inheritance edge to `parent`.
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parents.insert(parent.into());
        self
    }

    /// Sets the display prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Marks the group as the default group.
    pub fn as_default(mut self) -> Self {
        self.is_default = true;
        self
    }

    /// Grants a node. Fails on a malformed node.
    pub fn allow(mut self, node: &str) -> DomainResult<Self> {
        self.set_permission(node, true)?;
        Ok(self)
    }

    /// Denies a node. Fails on a malformed node.
    pub fn deny(mut self, node: &str) -> DomainResult<Self> {
        self.set_permission(node, false)?;
        Ok(self)
    }

    /// Sets a node to the given value, replacing any previous value.
    pub fn set_permission(&mut self, node: &str, value: bool) -> DomainResult<()> {
        self.permissions.insert(PermissionNode::parse(node)?, value);
        Ok(())
    }

    /// Validates the id and rejects self-inheritance.
    pub fn validate(&self) -> DomainResult<()> {
        validate_group_id(&self.id)?;
        for parent in &self.parents {
            validate_group_id(parent)?;
        }
        if self.parents.contains(&self.id) {
            return Err(DomainError::CyclicInheritance {
                path: format!("{} -> {}", self.id, self.id),
            });
        }
        Ok(())
    }
}

/// A player's membership in a group, optionally time-limited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub group_id: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Membership {
    /// Creates a permanent membership.
    pub fn permanent(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            expires_at: None,
        }
    }

    /// Creates a membership that ends at `expires_at`.
    pub fn until(group_id: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            group_id: group_id.into(),
            expires_at: Some(expires_at),
        }
    }

    /// A membership is active strictly before its expiry.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |expiry| now < expiry)
    }
}

/// Everything stored about one player: memberships and explicit overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerProfile {
    pub player_id: Uuid,
    /// Memberships in grant order.
    pub memberships: Vec<Membership>,
    /// Explicit per-player values, which outrank every group-derived value.
    pub overrides: BTreeMap<PermissionNode, bool>,
}

impl PlayerProfile {
    /// Creates an empty profile.
    pub fn new(player_id: Uuid) -> Self {
        Self {
            player_id,
            memberships: Vec::new(),
            overrides: BTreeMap::new(),
        }
    }

    /// Adds a membership, replacing an existing one for the same group.
    pub fn with_membership(mut self, membership: Membership) -> Self {
        self.memberships
            .retain(|m| m.group_id != membership.group_id);
        self.memberships.push(membership);
        self
    }

    /// Adds an explicit override. Fails on a malformed node.
    pub fn with_override(mut self, node: &str, value: bool) -> DomainResult<Self> {
        self.overrides.insert(PermissionNode::parse(node)?, value);
        Ok(self)
    }

    /// Memberships that have not expired at `now`.
    pub fn active_memberships(&self, now: DateTime<Utc>) -> impl Iterator<Item = &Membership> {
        self.memberships.iter().filter(move |m| m.is_active(now))
    }

    /// Ids of groups whose membership expired at or before `now`.
    pub fn expired_group_ids(&self, now: DateTime<Utc>) -> Vec<String> {
        self.memberships
            .iter()
            .filter(|m| !m.is_active(now))
            .map(|m| m.group_id.clone())
            .collect()
    }

    /// Earliest expiry among active memberships.
    pub fn next_expiry(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.active_memberships(now)
            .filter_map(|m| m.expires_at)
            .min()
    }
}
