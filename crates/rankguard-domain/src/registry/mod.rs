//! Group registry: group definitions, the inheritance graph and the reverse index.
//!
//! # Architecture
//!
//! - **Snapshots**: the graph lives behind an `Arc<GroupGraph>` that is swapped on
//!   every commit. Readers clone the `Arc` and never wait for a writer.
//! - **Single writer**: mutations take an async write guard ([`RegistryWriter`]) that
//!   spans validation, cycle detection, the caller's repository write and the
//!   in-memory commit. Edits are rare, so serializing them is cheap.
//! - **Reverse index**: `group id -> direct holders` is maintained from loaded
//!   profiles and membership changes. Transitive holders are found by walking the
//!   descendants of a group at query time.

mod graph;

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

use crate::error::{DomainError, DomainResult};
use crate::model::Group;

pub use graph::GroupGraph;

/// Which cache entries a committed group edit invalidates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupChange {
    pub group_id: String,
    /// Players that hold the group directly or through a descendant group.
    pub affected_players: HashSet<Uuid>,
    /// The edit touched the default group's lineage, so players without
    /// memberships (not tracked in the reverse index) are affected too.
    pub invalidate_everything: bool,
}

/// Holds all groups and the reverse index used for invalidation fan-out.
#[derive(Debug, Default)]
pub struct GroupRegistry {
    graph: RwLock<Arc<GroupGraph>>,
    writer: Mutex<()>,
    /// group id -> players holding it directly.
    holders: DashMap<String, HashSet<Uuid>>,
    /// player id -> group ids held directly.
    player_groups: DashMap<Uuid, BTreeSet<String>>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole graph, e.g. with the groups loaded at startup.
    pub async fn load(&self, groups: Vec<Group>) -> DomainResult<()> {
        let _guard = self.writer.lock().await;
        let graph = GroupGraph::from_groups(groups)?;
        debug!(groups = graph.len(), "Loaded group graph");
        self.publish(graph);
        Ok(())
    }

    /// Returns the current graph snapshot.
    pub fn snapshot(&self) -> Arc<GroupGraph> {
        let graph = self.graph.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&*graph)
    }

    /// Returns a group by id.
    pub fn get_group(&self, id: &str) -> DomainResult<Arc<Group>> {
        self.snapshot()
            .get(id)
            .cloned()
            .ok_or_else(|| DomainError::group_not_found(id))
    }

    /// Enters the single writer section.
    pub async fn write(&self) -> RegistryWriter<'_> {
        RegistryWriter {
            registry: self,
            _guard: self.writer.lock().await,
        }
    }

    /// Validates and commits an upsert without any repository write.
    pub async fn upsert_group(&self, group: Group) -> DomainResult<GroupChange> {
        let writer = self.write().await;
        writer.check_upsert(&group)?;
        Ok(writer.commit_upsert(group))
    }

    /// Validates and commits a delete without any repository write.
    pub async fn delete_group(&self, id: &str) -> DomainResult<GroupChange> {
        let writer = self.write().await;
        writer.check_delete(id)?;
        Ok(writer.commit_delete(id))
    }

    // Reverse index

    /// Records the full set of groups a player holds directly.
    pub fn track_player(&self, player: Uuid, groups: impl IntoIterator<Item = String>) {
        let groups: BTreeSet<String> = groups.into_iter().collect();
        if let Some(previous) = self.player_groups.insert(player, groups.clone()) {
            for group in previous.difference(&groups) {
                self.remove_holder_entry(group, player);
            }
        }
        for group in groups {
            self.holders.entry(group).or_default().insert(player);
        }
    }

    /// Adds the player to the index without touching its groups.
    pub fn ensure_tracked(&self, player: Uuid) {
        self.player_groups.entry(player).or_default();
    }

    /// Records that a player now holds `group_id` directly.
    pub fn add_holder(&self, player: Uuid, group_id: &str) {
        self.player_groups
            .entry(player)
            .or_default()
            .insert(group_id.to_string());
        self.holders
            .entry(group_id.to_string())
            .or_default()
            .insert(player);
    }

    /// Records that a player no longer holds `group_id` directly.
    pub fn remove_holder(&self, player: Uuid, group_id: &str) {
        if let Some(mut groups) = self.player_groups.get_mut(&player) {
            groups.remove(group_id);
        }
        self.remove_holder_entry(group_id, player);
    }

    /// Drops a player from the reverse index, e.g. on disconnect.
    pub fn forget_player(&self, player: Uuid) {
        if let Some((_, groups)) = self.player_groups.remove(&player) {
            for group in groups {
                self.remove_holder_entry(&group, player);
            }
        }
    }

    /// Whether the player is present in the reverse index.
    pub fn is_tracked(&self, player: Uuid) -> bool {
        self.player_groups.contains_key(&player)
    }

    /// Group ids the player holds directly, as last recorded.
    pub fn direct_groups(&self, player: Uuid) -> Vec<String> {
        self.player_groups
            .get(&player)
            .map(|groups| groups.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Players holding `group_id` directly or through any descendant group.
    pub fn players_holding(&self, group_id: &str) -> HashSet<Uuid> {
        let graph = self.snapshot();
        let mut groups = graph.descendants(group_id);
        groups.insert(group_id.to_string());

        let mut players = HashSet::new();
        for group in groups {
            if let Some(holders) = self.holders.get(&group) {
                players.extend(holders.iter().copied());
            }
        }
        players
    }

    /// All players currently in the reverse index.
    pub fn tracked_players(&self) -> Vec<Uuid> {
        self.player_groups.iter().map(|e| *e.key()).collect()
    }

    fn remove_holder_entry(&self, group_id: &str, player: Uuid) {
        let now_empty = match self.holders.get_mut(group_id) {
            Some(mut holders) => {
                holders.remove(&player);
                holders.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.holders.remove_if(group_id, |_, holders| holders.is_empty());
        }
    }

    fn publish(&self, graph: GroupGraph) {
        *self.graph.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(graph);
    }
}

/// Guard for the registry's single writer section.
///
/// Hold it across `check_*`, the repository write and `commit_*` so that no other
/// edit can slip in between the cycle check and the commit.
pub struct RegistryWriter<'a> {
    registry: &'a GroupRegistry,
    _guard: MutexGuard<'a, ()>,
}

impl RegistryWriter<'_> {
    /// The graph as seen by this writer.
    pub fn graph(&self) -> Arc<GroupGraph> {
        self.registry.snapshot()
    }

    /// Validates an upsert: id format, parent existence and acyclicity.
    pub fn check_upsert(&self, group: &Group) -> DomainResult<()> {
        group.validate()?;
        let graph = self.graph();
        for parent in &group.parents {
            if !graph.contains(parent) {
                return Err(DomainError::NotFound {
                    kind: "parent group",
                    id: parent.clone(),
                });
            }
        }
        if let Some(cycle) = graph.find_cycle(group) {
            return Err(DomainError::CyclicInheritance {
                path: cycle.join(" -> "),
            });
        }
        Ok(())
    }

    /// Publishes an upsert that passed [`check_upsert`](Self::check_upsert).
    pub fn commit_upsert(&self, group: Group) -> GroupChange {
        let before = self.graph();
        let group_id = group.id.clone();
        let after = before.with_upsert(group);
        let invalidate_everything =
            before.is_in_default_lineage(&group_id) || after.is_in_default_lineage(&group_id);
        self.registry.publish(after);

        let affected_players = self.registry.players_holding(&group_id);
        debug!(
            group_id = %group_id,
            affected = affected_players.len(),
            invalidate_everything,
            "Committed group upsert"
        );
        GroupChange {
            group_id,
            affected_players,
            invalidate_everything,
        }
    }

    /// Validates a delete: the group exists and no group inherits from it.
    pub fn check_delete(&self, id: &str) -> DomainResult<()> {
        let graph = self.graph();
        if !graph.contains(id) {
            return Err(DomainError::group_not_found(id));
        }
        let children: Vec<&String> = graph.children_of(id).collect();
        if !children.is_empty() {
            return Err(DomainError::ConstraintViolation {
                message: format!(
                    "group '{id}' is still a parent of: {}",
                    children
                        .iter()
                        .map(|c| c.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            });
        }
        Ok(())
    }

    /// Publishes a delete that passed [`check_delete`](Self::check_delete).
    pub fn commit_delete(&self, id: &str) -> GroupChange {
        let before = self.graph();
        let invalidate_everything = before.is_in_default_lineage(id);
        let affected_players = self.registry.players_holding(id);
        self.registry.publish(before.with_delete(id));

        for player in &affected_players {
            self.registry.remove_holder(*player, id);
        }
        self.registry.holders.remove(id);

        debug!(group_id = %id, affected = affected_players.len(), "Committed group delete");
        GroupChange {
            group_id: id.to_string(),
            affected_players,
            invalidate_everything,
        }
    }
}
