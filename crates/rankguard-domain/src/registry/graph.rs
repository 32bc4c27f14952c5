//! Immutable snapshot of the group inheritance graph.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::error::{DomainError, DomainResult};
use crate::model::Group;

/// Group definitions plus parent and child adjacency, indexed by group id.
///
/// A `GroupGraph` is never mutated once published; edits build a new graph and
/// swap it in, so readers holding an `Arc<GroupGraph>` always see a consistent,
/// acyclic state.
#[derive(Debug, Clone, Default)]
pub struct GroupGraph {
    groups: HashMap<String, Arc<Group>>,
    /// Reverse edges: parent id -> ids of groups that list it as a parent.
    children: HashMap<String, BTreeSet<String>>,
}

impl GroupGraph {
    /// Builds a graph from a full set of groups, rejecting unknown parents and cycles.
    pub fn from_groups(groups: impl IntoIterator<Item = Group>) -> DomainResult<Self> {
        let mut graph = Self::default();
        for group in groups {
            group.validate()?;
            graph.insert(group);
        }

        for group in graph.groups.values() {
            for parent in &group.parents {
                if !graph.groups.contains_key(parent) {
                    return Err(DomainError::NotFound {
                        kind: "parent group",
                        id: parent.clone(),
                    });
                }
            }
        }

        let adjacency = graph.parent_adjacency(None);
        let mut visited = HashSet::new();
        let mut ids: Vec<&String> = graph.groups.keys().collect();
        ids.sort();
        for id in ids {
            let mut rec_stack = HashSet::new();
            let mut path = Vec::new();
            if dfs_cycle_detect(id, &adjacency, &mut visited, &mut rec_stack, &mut path) {
                return Err(DomainError::CyclicInheritance {
                    path: path.join(" -> "),
                });
            }
        }

        Ok(graph)
    }

    /// Returns the group with the given id.
    pub fn get(&self, id: &str) -> Option<&Arc<Group>> {
        self.groups.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.groups.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Iterates over all groups in unspecified order.
    pub fn groups(&self) -> impl Iterator<Item = &Arc<Group>> {
        self.groups.values()
    }

    /// The group flagged as default, if any.
    pub fn default_group(&self) -> Option<&Arc<Group>> {
        let mut defaults: Vec<&Arc<Group>> =
            self.groups.values().filter(|g| g.is_default).collect();
        defaults.sort_by(|a, b| a.id.cmp(&b.id));
        defaults.into_iter().next()
    }

    /// Ids of groups that directly inherit from `id`.
    pub fn children_of(&self, id: &str) -> impl Iterator<Item = &String> {
        self.children.get(id).into_iter().flatten()
    }

    /// All strict ancestors of `id`.
    pub fn ancestors(&self, id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack: Vec<&str> = self
            .groups
            .get(id)
            .map(|g| g.parents.iter().map(String::as_str).collect())
            .unwrap_or_default();
        while let Some(current) = stack.pop() {
            if !seen.insert(current.to_string()) {
                continue;
            }
            if let Some(group) = self.groups.get(current) {
                stack.extend(group.parents.iter().map(String::as_str));
            }
        }
        seen
    }

    /// All strict descendants of `id`.
    pub fn descendants(&self, id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack: Vec<&str> = self.children_of(id).map(String::as_str).collect();
        while let Some(current) = stack.pop() {
            if !seen.insert(current.to_string()) {
                continue;
            }
            stack.extend(self.children_of(current).map(String::as_str));
        }
        seen
    }

    /// True if editing `id` can change what the default group resolves to.
    pub fn is_in_default_lineage(&self, id: &str) -> bool {
        match self.default_group() {
            Some(default) => default.id == id || self.ancestors(&default.id).contains(id),
            None => false,
        }
    }

    /// Searches for a cycle that `proposed` would introduce.
    ///
    /// Returns the offending path, starting and ending at the proposed group.
    pub fn find_cycle(&self, proposed: &Group) -> Option<Vec<String>> {
        let adjacency = self.parent_adjacency(Some(proposed));
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut path = Vec::new();
        if dfs_cycle_detect(
            &proposed.id,
            &adjacency,
            &mut visited,
            &mut rec_stack,
            &mut path,
        ) {
            // Trim the path to the cycle itself.
            if let Some(last) = path.last().cloned() {
                if let Some(start) = path.iter().position(|id| *id == last) {
                    return Some(path[start..].to_vec());
                }
            }
            return Some(path);
        }
        None
    }

    /// Returns a copy of this graph with `group` inserted or replaced.
    ///
    /// When `group` is the new default, the flag is cleared on any previous default.
    pub(crate) fn with_upsert(&self, group: Group) -> Self {
        let mut next = self.clone();
        if group.is_default {
            let previous: Vec<String> = next
                .groups
                .values()
                .filter(|g| g.is_default && g.id != group.id)
                .map(|g| g.id.clone())
                .collect();
            for id in previous {
                if let Some(existing) = next.groups.get(&id) {
                    let mut cleared = (**existing).clone();
                    cleared.is_default = false;
                    next.groups.insert(id, Arc::new(cleared));
                }
            }
        }
        next.remove(&group.id);
        next.insert(group);
        next
    }

    /// Returns a copy of this graph without `id`.
    pub(crate) fn with_delete(&self, id: &str) -> Self {
        let mut next = self.clone();
        next.remove(id);
        next
    }

    fn insert(&mut self, group: Group) {
        for parent in &group.parents {
            self.children
                .entry(parent.clone())
                .or_default()
                .insert(group.id.clone());
        }
        self.groups.insert(group.id.clone(), Arc::new(group));
    }

    fn remove(&mut self, id: &str) {
        if let Some(old) = self.groups.remove(id) {
            for parent in &old.parents {
                if let Some(children) = self.children.get_mut(parent) {
                    children.remove(id);
                    if children.is_empty() {
                        self.children.remove(parent);
                    }
                }
            }
        }
    }

    /// Builds id -> parent ids, with `proposed` replacing any stored version.
    fn parent_adjacency(&self, proposed: Option<&Group>) -> HashMap<String, HashSet<String>> {
        let mut adjacency: HashMap<String, HashSet<String>> = self
            .groups
            .iter()
            .map(|(id, g)| (id.clone(), g.parents.iter().cloned().collect()))
            .collect();
        if let Some(group) = proposed {
            adjacency.insert(group.id.clone(), group.parents.iter().cloned().collect());
        }
        adjacency
    }
}

/// DFS-based cycle detection over parent edges.
fn dfs_cycle_detect(
    node: &str,
    graph: &HashMap<String, HashSet<String>>,
    visited: &mut HashSet<String>,
    rec_stack: &mut HashSet<String>,
    path: &mut Vec<String>,
) -> bool {
    if rec_stack.contains(node) {
        // Found a cycle
        path.push(node.to_string());
        return true;
    }
    if visited.contains(node) {
        return false;
    }

    visited.insert(node.to_string());
    rec_stack.insert(node.to_string());
    path.push(node.to_string());

    if let Some(neighbors) = graph.get(node) {
        let mut neighbors: Vec<&String> = neighbors.iter().collect();
        neighbors.sort();
        for neighbor in neighbors {
            if graph.contains_key(neighbor.as_str())
                && dfs_cycle_detect(neighbor, graph, visited, rec_stack, path)
            {
                return true;
            }
        }
    }

    rec_stack.remove(node);
    path.pop();
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> GroupGraph {
        GroupGraph::from_groups(vec![
            Group::new("default", "Default").as_default(),
            Group::new("vip", "VIP").with_parent("default"),
            Group::new("mod", "Moderator").with_parent("vip"),
            Group::new("builder", "Builder"),
        ])
        .unwrap()
    }

    #[test]
    fn test_ancestors_and_descendants() {
        let graph = chain();
        let ancestors = graph.ancestors("mod");
        assert!(ancestors.contains("vip"));
        assert!(ancestors.contains("default"));
        assert!(!ancestors.contains("mod"));

        let descendants = graph.descendants("default");
        assert_eq!(descendants.len(), 2);
        assert!(descendants.contains("mod"));
        assert!(graph.descendants("builder").is_empty());
    }

    #[test]
    fn test_find_cycle_reports_path() {
        let graph = chain();
        let proposed = Group::new("default", "Default").with_parent("mod");
        let cycle = graph.find_cycle(&proposed).unwrap();
        assert_eq!(cycle.first(), cycle.last());
        assert!(cycle.contains(&"mod".to_string()));
        assert!(cycle.contains(&"vip".to_string()));
    }

    #[test]
    fn test_find_cycle_accepts_diamond() {
        let graph = chain();
        let proposed = Group::new("admin", "Admin")
            .with_parent("mod")
            .with_parent("builder");
        assert!(graph.find_cycle(&proposed).is_none());
    }

    #[test]
    fn test_from_groups_rejects_stored_cycle() {
        let result = GroupGraph::from_groups(vec![
            Group::new("a", "A").with_parent("b"),
            Group::new("b", "B").with_parent("a"),
        ]);
        assert!(matches!(
            result,
            Err(DomainError::CyclicInheritance { .. })
        ));
    }

    #[test]
    fn test_from_groups_rejects_unknown_parent() {
        let result = GroupGraph::from_groups(vec![Group::new("a", "A").with_parent("ghost")]);
        assert!(matches!(result, Err(DomainError::NotFound { .. })));
    }

    #[test]
    fn test_with_upsert_moves_default_flag() {
        let graph = chain();
        let next = graph.with_upsert(Group::new("builder", "Builder").as_default());
        assert_eq!(next.default_group().unwrap().id, "builder");
        assert!(!next.get("default").unwrap().is_default);
        // The original snapshot is untouched.
        assert_eq!(graph.default_group().unwrap().id, "default");
    }

    #[test]
    fn test_with_upsert_rewires_children_index() {
        let graph = chain();
        let next = graph.with_upsert(Group::new("mod", "Moderator").with_parent("builder"));
        assert!(next.children_of("vip").next().is_none());
        assert_eq!(
            next.children_of("builder").collect::<Vec<_>>(),
            vec![&"mod".to_string()]
        );
    }

    #[test]
    fn test_default_lineage() {
        let graph = GroupGraph::from_groups(vec![
            Group::new("base", "Base"),
            Group::new("default", "Default").with_parent("base").as_default(),
            Group::new("vip", "VIP").with_parent("default"),
        ])
        .unwrap();
        assert!(graph.is_in_default_lineage("default"));
        assert!(graph.is_in_default_lineage("base"));
        assert!(!graph.is_in_default_lineage("vip"));
    }
}
