use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::PermissionCache;
use crate::clock::{Clock, SystemClock};
use crate::error::{DomainError, DomainResult};
use crate::model::{PermissionNode, PlayerProfile};
use crate::registry::GroupRegistry;

use super::config::ResolverConfig;
use super::merge::flatten;
use super::traits::ProfileReader;
use super::types::ResolvedPermissionSet;

/// Metrics for cache performance monitoring.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    /// Number of cache hits (snapshot served without a load).
    pub hits: AtomicU64,
    /// Number of cache misses (profile loaded from storage).
    pub misses: AtomicU64,
    /// Number of built snapshots not stored because an invalidation raced the load.
    pub discarded: AtomicU64,
}

impl CacheMetrics {
    /// Returns a snapshot of the current metrics.
    pub fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }

    /// Returns the cache hit ratio (hits / (hits + misses)).
    /// Returns 0.0 if no hits or misses have occurred.
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// A point-in-time snapshot of cache metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub discarded: u64,
}

/// Computes a player's effective permissions.
///
/// # Caching
///
/// When a cache is configured, the resolver will:
/// 1. Serve current snapshots straight from the cache
/// 2. Read the player's generation before loading the profile, so a snapshot
///    built from pre-invalidation data is never stored
/// 3. Record the player's direct groups in the registry's reverse index
pub struct PermissionResolver<P> {
    registry: Arc<GroupRegistry>,
    profiles: Arc<P>,
    clock: Arc<dyn Clock>,
    config: ResolverConfig,
    cache_metrics: CacheMetrics,
}

impl<P> PermissionResolver<P>
where
    P: ProfileReader + 'static,
{
    /// Creates a new resolver with the default configuration and wall-clock time.
    pub fn new(registry: Arc<GroupRegistry>, profiles: Arc<P>) -> Self {
        Self::with_config(registry, profiles, Arc::new(SystemClock), ResolverConfig::default())
    }

    /// Creates a new resolver with custom configuration.
    pub fn with_config(
        registry: Arc<GroupRegistry>,
        profiles: Arc<P>,
        clock: Arc<dyn Clock>,
        config: ResolverConfig,
    ) -> Self {
        Self {
            registry,
            profiles,
            clock,
            config,
            cache_metrics: CacheMetrics::default(),
        }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<GroupRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> Option<&Arc<PermissionCache>> {
        self.config.cache.as_ref()
    }

    /// Returns the cache metrics for monitoring.
    pub fn cache_metrics(&self) -> &CacheMetrics {
        &self.cache_metrics
    }

    /// Returns the current cached snapshot, if any. Never touches storage.
    pub fn cached(&self, player: Uuid) -> Option<Arc<ResolvedPermissionSet>> {
        let hit = self.config.cache.as_ref()?.get(player);
        if hit.is_some() {
            self.cache_metrics.hits.fetch_add(1, Ordering::Relaxed);
        }
        hit
    }

    /// Resolves a player's effective permission set.
    ///
    /// Serves a current cached snapshot when there is one, otherwise loads.
    pub async fn resolve(&self, player: Uuid) -> DomainResult<Arc<ResolvedPermissionSet>> {
        if let Some(hit) = self.cached(player) {
            return Ok(hit);
        }
        self.load(player).await
    }

    /// Loads the profile, builds a fresh snapshot and stores it in the cache.
    pub async fn load(&self, player: Uuid) -> DomainResult<Arc<ResolvedPermissionSet>> {
        self.cache_metrics.misses.fetch_add(1, Ordering::Relaxed);

        // Observe the epoch before reading storage.
        let generation = self
            .config
            .cache
            .as_ref()
            .map_or(0, |cache| cache.generation(player));

        let profile = match timeout(self.config.load_timeout, self.profiles.load_profile(player))
            .await
        {
            Ok(result) => result?,
            Err(_) => {
                warn!(player = %player, timeout = ?self.config.load_timeout, "Profile load timed out");
                return Err(DomainError::TransientIo {
                    message: format!(
                        "profile load for {player} timed out after {}ms",
                        self.config.load_timeout.as_millis()
                    ),
                });
            }
        };

        // Loads only add holders; removals come from revocation, expiry and
        // disconnect. A late load may over-track a player, never under-track.
        let now = self.clock.now();
        for membership in profile.active_memberships(now) {
            self.registry.add_holder(player, &membership.group_id);
        }
        self.registry.ensure_tracked(player);

        let set = Arc::new(self.build(&profile, generation));
        if let Some(cache) = &self.config.cache {
            if !cache.put(player, Arc::clone(&set)) {
                self.cache_metrics.discarded.fetch_add(1, Ordering::Relaxed);
            }
        }
        debug!(
            player = %player,
            generation,
            groups = ?set.groups(),
            "Resolved permission set"
        );
        Ok(set)
    }

    /// Builds a snapshot from a profile against the current registry graph.
    pub fn build(&self, profile: &PlayerProfile, generation: u64) -> ResolvedPermissionSet {
        let now = self.clock.now();
        let graph = self.registry.snapshot();
        let flat = flatten(&graph, profile, now, self.config.conflict_policy);

        ResolvedPermissionSet {
            player_id: profile.player_id,
            inherited: flat.inherited,
            overrides: profile
                .overrides
                .iter()
                .map(|(node, value)| (node.as_str().to_string(), *value))
                .collect(),
            groups: flat.groups,
            prefix: flat.prefix,
            generation,
            computed_at: now,
            valid_until: flat.valid_until,
        }
    }

    /// Resolves and evaluates a single node.
    pub async fn check(&self, player: Uuid, node: &PermissionNode) -> DomainResult<bool> {
        let set = self.resolve(player).await?;
        Ok(set.allows(node, self.config.default_policy))
    }
}
