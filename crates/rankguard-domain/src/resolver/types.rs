//! Types for the permission resolver.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::PermissionNode;

/// Answer for a node that matches nothing in the resolved set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultPolicy {
    #[default]
    Deny,
    Allow,
}

impl DefaultPolicy {
    pub fn as_bool(self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Tie-break between groups that are not ancestor-related but disagree on a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    #[default]
    DenyWins,
    AllowWins,
}

impl ConflictPolicy {
    /// Picks the winning value among conflicting ones.
    pub fn settle(self, values: impl IntoIterator<Item = bool>) -> Option<bool> {
        let mut seen_true = false;
        let mut seen_false = false;
        for value in values {
            if value {
                seen_true = true;
            } else {
                seen_false = true;
            }
        }
        match (seen_true, seen_false) {
            (false, false) => None,
            (true, false) => Some(true),
            (false, true) => Some(false),
            (true, true) => Some(matches!(self, Self::AllowWins)),
        }
    }
}

/// Immutable, generation-tagged snapshot of a player's effective permissions.
///
/// Holds two layers: values derived from groups and the player's explicit
/// overrides. Lookups consult the override layer first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPermissionSet {
    pub(crate) player_id: Uuid,
    pub(crate) inherited: HashMap<String, bool>,
    pub(crate) overrides: HashMap<String, bool>,
    pub(crate) groups: Vec<String>,
    pub(crate) prefix: Option<String>,
    pub(crate) generation: u64,
    pub(crate) computed_at: DateTime<Utc>,
    pub(crate) valid_until: Option<DateTime<Utc>>,
}

impl ResolvedPermissionSet {
    pub fn player_id(&self) -> Uuid {
        self.player_id
    }

    /// Invalidation epoch this snapshot was built against.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn computed_at(&self) -> DateTime<Utc> {
        self.computed_at
    }

    /// The earliest membership expiry this snapshot depends on.
    pub fn valid_until(&self) -> Option<DateTime<Utc>> {
        self.valid_until
    }

    /// Whether a membership used to build this snapshot has since expired.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.valid_until.is_some_and(|until| now >= until)
    }

    /// Effective directly-held group ids, in membership order.
    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    /// Display prefix of the first effective group that defines one.
    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    /// Looks up a node: override layer, then group layer, each exact match first
    /// and then from the most to the least specific wildcard.
    pub fn lookup(&self, node: &PermissionNode) -> Option<bool> {
        let chain = node.lookup_chain();
        find_in(&self.overrides, &chain).or_else(|| find_in(&self.inherited, &chain))
    }

    /// Resolves a node to a decision, falling back to `default` on no match.
    pub fn allows(&self, node: &PermissionNode, default: DefaultPolicy) -> bool {
        self.lookup(node).unwrap_or(default.as_bool())
    }

    /// Flattened view of both layers; overrides replace group values on the same key.
    pub fn entries(&self) -> BTreeMap<String, bool> {
        let mut entries: BTreeMap<String, bool> = self
            .inherited
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        entries.extend(self.overrides.iter().map(|(k, v)| (k.clone(), *v)));
        entries
    }

    /// The player's explicit overrides.
    pub fn overrides(&self) -> &HashMap<String, bool> {
        &self.overrides
    }
}

fn find_in(layer: &HashMap<String, bool>, chain: &[String]) -> Option<bool> {
    chain.iter().find_map(|pattern| layer.get(pattern).copied())
}
