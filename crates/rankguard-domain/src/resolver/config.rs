//! Configuration for the permission resolver.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::PermissionCache;

use super::types::{ConflictPolicy, DefaultPolicy};

/// Configuration for the permission resolver.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Answer for nodes that match nothing.
    pub default_policy: DefaultPolicy,
    /// Tie-break between unrelated groups that disagree on a node.
    pub conflict_policy: ConflictPolicy,
    /// Timeout for loading one player's profile from storage.
    pub load_timeout: Duration,
    /// Optional snapshot cache.
    ///
    /// When set, the resolver will:
    /// 1. Serve `resolve` from the cache when the entry is current
    /// 2. Store freshly built snapshots, tagged with the generation observed
    ///    before the load started
    pub cache: Option<Arc<PermissionCache>>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            default_policy: DefaultPolicy::Deny,
            conflict_policy: ConflictPolicy::DenyWins,
            load_timeout: Duration::from_secs(5),
            cache: None,
        }
    }
}

impl ResolverConfig {
    /// Creates a new configuration with caching enabled.
    pub fn with_cache(mut self, cache: Arc<PermissionCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_default_policy(mut self, policy: DefaultPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// Creates a new configuration with the specified profile load timeout.
    pub fn with_load_timeout(mut self, timeout: Duration) -> Self {
        self.load_timeout = timeout;
        self
    }
}
