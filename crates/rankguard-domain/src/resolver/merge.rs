//! Flattening of group inheritance into a single node -> value layer.
//!
//! Groups in the closure of a player's direct memberships are walked in
//! topological order, parents before children. For each node, a group's value
//! replaces the values of any of its ancestors; values left standing from
//! groups that are not ancestor-related are settled by the [`ConflictPolicy`].

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::model::PlayerProfile;
use crate::registry::GroupGraph;

use super::types::ConflictPolicy;

/// Group-derived part of a resolved set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Flattened {
    pub inherited: HashMap<String, bool>,
    /// Effective direct groups, in membership order.
    pub groups: Vec<String>,
    pub prefix: Option<String>,
    pub valid_until: Option<DateTime<Utc>>,
}

/// Computes the group layer for `profile` at `now`.
pub(crate) fn flatten(
    graph: &GroupGraph,
    profile: &PlayerProfile,
    now: DateTime<Utc>,
    policy: ConflictPolicy,
) -> Flattened {
    let mut direct: Vec<String> = Vec::new();
    for membership in profile.active_memberships(now) {
        if !graph.contains(&membership.group_id) {
            debug!(
                player = %profile.player_id,
                group_id = %membership.group_id,
                "Skipping membership in unknown group"
            );
            continue;
        }
        if !direct.contains(&membership.group_id) {
            direct.push(membership.group_id.clone());
        }
    }
    if direct.is_empty() {
        if let Some(default) = graph.default_group() {
            direct.push(default.id.clone());
        }
    }

    // Closure with each member's ancestor set.
    let mut ancestors: HashMap<String, HashSet<String>> = HashMap::new();
    for id in &direct {
        if ancestors.contains_key(id) {
            continue;
        }
        let lineage = graph.ancestors(id);
        for ancestor in &lineage {
            if !ancestors.contains_key(ancestor) {
                ancestors.insert(ancestor.clone(), graph.ancestors(ancestor));
            }
        }
        ancestors.insert(id.clone(), lineage);
    }

    // Winners per node. An entry from group `g` evicts entries from ancestors of `g`;
    // the topological order guarantees ancestors are always seen first.
    let mut winners: BTreeMap<&str, Vec<(&str, bool)>> = BTreeMap::new();
    for id in topological_order(&ancestors) {
        let Some(group) = graph.get(id) else {
            continue;
        };
        let lineage = &ancestors[id];
        for (node, value) in &group.permissions {
            let slot = winners.entry(node.as_str()).or_default();
            slot.retain(|(holder, _)| !lineage.contains(*holder));
            slot.push((id, *value));
        }
    }

    let inherited = winners
        .into_iter()
        .filter_map(|(node, slot)| {
            policy
                .settle(slot.iter().map(|(_, value)| *value))
                .map(|value| (node.to_string(), value))
        })
        .collect();

    let prefix = direct
        .iter()
        .filter_map(|id| graph.get(id))
        .find_map(|group| group.prefix.clone());

    Flattened {
        inherited,
        groups: direct,
        prefix,
        valid_until: profile.next_expiry(now),
    }
}

/// Orders the closure so that every group comes after all of its ancestors.
///
/// Ties are broken by id so the walk is deterministic.
fn topological_order(ancestors: &HashMap<String, HashSet<String>>) -> Vec<&str> {
    let mut remaining: BTreeSet<&str> = ancestors.keys().map(String::as_str).collect();
    let mut placed: HashSet<&str> = HashSet::new();
    let mut order = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        let ready: Vec<&str> = remaining
            .iter()
            .copied()
            .filter(|id| {
                ancestors[*id]
                    .iter()
                    .all(|ancestor| placed.contains(ancestor.as_str()))
            })
            .collect();
        if ready.is_empty() {
            // The graph is acyclic, so this only guards against a corrupted snapshot.
            order.extend(remaining.iter().copied());
            break;
        }
        for id in ready {
            remaining.remove(id);
            placed.insert(id);
            order.push(id);
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Group, Membership};
    use uuid::Uuid;

    #[test]
    fn test_topological_order_places_parents_first() {
        let ancestors: HashMap<String, HashSet<String>> = HashMap::from([
            ("c".to_string(), HashSet::from(["a".to_string(), "b".to_string()])),
            ("b".to_string(), HashSet::from(["a".to_string()])),
            ("a".to_string(), HashSet::new()),
            ("z".to_string(), HashSet::new()),
        ]);
        let order = topological_order(&ancestors);
        let pos = |id: &str| order.iter().position(|x| *x == id).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("c"));
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn test_diamond_nearer_value_wins_over_shared_ancestor() {
        // base denies, both branches inherit it; only one branch re-grants.
        let graph = GroupGraph::from_groups(vec![
            Group::new("base", "Base").deny("fly").unwrap(),
            Group::new("left", "Left").with_parent("base").allow("fly").unwrap(),
            Group::new("right", "Right").with_parent("base"),
        ])
        .unwrap();
        let profile = PlayerProfile::new(Uuid::new_v4())
            .with_membership(Membership::permanent("left"))
            .with_membership(Membership::permanent("right"));

        let flat = flatten(&graph, &profile, Utc::now(), ConflictPolicy::DenyWins);

        assert_eq!(flat.inherited.get("fly"), Some(&true));
    }

    #[test]
    fn test_unknown_membership_group_is_skipped() {
        let graph = GroupGraph::from_groups(vec![Group::new("vip", "VIP")]).unwrap();
        let profile = PlayerProfile::new(Uuid::new_v4())
            .with_membership(Membership::permanent("ghost"))
            .with_membership(Membership::permanent("vip"));

        let flat = flatten(&graph, &profile, Utc::now(), ConflictPolicy::DenyWins);

        assert_eq!(flat.groups, vec!["vip".to_string()]);
    }
}
