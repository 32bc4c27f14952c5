//! Resolved permission set caching with TTL, LRU eviction and epoch guards.
//!
//! # Architecture
//!
//! The cache uses Moka's sync Cache which provides:
//! - Lock-free concurrent reads, callable from the host's tick thread
//! - Automatic TTL-based eviction as a safety net against missed invalidations
//! - Memory-bounded storage with least-recently-used eviction
//!
//! # Generations
//!
//! Every player has an invalidation epoch. A loader reads the epoch with
//! [`PermissionCache::generation`] *before* touching storage and tags the snapshot
//! with it. Invalidation bumps the epoch, so a snapshot computed from pre-mutation
//! state can never be served after the invalidation, even if its `put` lands late.
//!
//! [`PermissionCache::invalidate_everything`] raises a global floor instead of
//! touching every player.
//!
//! Epochs are only needed while a load that read an older one might still
//! `put`. They live in a second Moka cache with a time-to-idle of
//! `epoch_retention`, which must exceed the longest load. An epoch that idles
//! out falls back to the floor, so any snapshot still cached against it reads as
//! a miss and is reloaded.
//!
//! # Example
//!
//! ```rust,ignore
//! use rankguard_domain::cache::{PermissionCache, PermissionCacheConfig};
//!
//! let cache = PermissionCache::new(PermissionCacheConfig::default(), registry, clock);
//! let generation = cache.generation(player);
//! let set = resolver.build(&profile, generation);
//! cache.put(player, Arc::new(set));
//! assert!(cache.get(player).is_some());
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use tracing::debug;
use uuid::Uuid;

use crate::clock::Clock;
use crate::registry::GroupRegistry;
use crate::resolver::ResolvedPermissionSet;

/// Configuration for the permission cache.
#[derive(Debug, Clone)]
pub struct PermissionCacheConfig {
    /// Whether caching is enabled. With caching off every check reloads.
    pub enabled: bool,
    /// Maximum number of cached players.
    pub max_capacity: u64,
    /// Time-to-live for cached snapshots.
    pub ttl: Duration,
    /// How long an untouched invalidation epoch is kept.
    pub epoch_retention: Duration,
}

impl Default for PermissionCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_capacity: 10_000,
            ttl: Duration::from_secs(300),
            epoch_retention: Duration::from_secs(600),
        }
    }
}

impl PermissionCacheConfig {
    /// Enables or disables caching.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets the maximum capacity.
    pub fn with_max_capacity(mut self, max_capacity: u64) -> Self {
        self.max_capacity = max_capacity;
        self
    }

    /// Sets the TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sets the idle time after which a player's epoch is forgotten.
    pub fn with_epoch_retention(mut self, retention: Duration) -> Self {
        self.epoch_retention = retention;
        self
    }
}

/// Per-player cache of resolved permission sets.
///
/// # Thread Safety
///
/// Fully thread-safe. `get` never blocks on a writer.
pub struct PermissionCache {
    cache: Cache<Uuid, Arc<ResolvedPermissionSet>>,
    config: PermissionCacheConfig,
    registry: Arc<GroupRegistry>,
    clock: Arc<dyn Clock>,
    /// Source of strictly increasing epoch values.
    epoch_counter: AtomicU64,
    /// player id -> epoch of the last invalidation.
    epochs: Cache<Uuid, u64>,
    /// Epoch every player is at least at, raised by `invalidate_everything`.
    floor: AtomicU64,
}

impl std::fmt::Debug for PermissionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionCache")
            .field("config", &self.config)
            .field("entry_count", &self.cache.entry_count())
            .field("epochs", &self.epochs.entry_count())
            .field("floor", &self.floor.load(Ordering::Acquire))
            .finish()
    }
}

impl PermissionCache {
    /// Creates a new cache. `registry` supplies the reverse index for
    /// [`invalidate_all`](Self::invalidate_all).
    pub fn new(
        config: PermissionCacheConfig,
        registry: Arc<GroupRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_capacity)
            .time_to_live(config.ttl)
            .eviction_policy(EvictionPolicy::lru())
            .build();
        let epochs = Cache::builder()
            .time_to_idle(config.epoch_retention)
            .build();

        Self {
            cache,
            config,
            registry,
            clock,
            epoch_counter: AtomicU64::new(0),
            epochs,
            floor: AtomicU64::new(0),
        }
    }

    /// Returns the configuration for this cache.
    pub fn config(&self) -> &PermissionCacheConfig {
        &self.config
    }

    /// Returns whether caching is enabled.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// The player's current invalidation epoch. Reading it keeps the epoch
    /// from idling out.
    pub fn generation(&self, player: Uuid) -> u64 {
        let floor = self.floor.load(Ordering::Acquire);
        self.epochs
            .get(&player)
            .map_or(floor, |epoch| epoch.max(floor))
    }

    /// Retrieves the cached snapshot for a player.
    ///
    /// Entries built against an older epoch, or depending on a membership that has
    /// since expired, are treated as a miss and dropped.
    ///
    /// # Metrics
    ///
    /// - `rankguard_cache_hits_total`
    /// - `rankguard_cache_misses_total`
    pub fn get(&self, player: Uuid) -> Option<Arc<ResolvedPermissionSet>> {
        if !self.config.enabled {
            return None;
        }

        let result = self.cache.get(&player).filter(|set| {
            let fresh = set.generation() == self.generation(player)
                && !set.is_expired_at(self.clock.now());
            if !fresh {
                debug!(player = %player, generation = set.generation(), "Dropping stale snapshot");
                self.cache.invalidate(&player);
            }
            fresh
        });

        if result.is_some() {
            metrics::counter!("rankguard_cache_hits_total").increment(1);
        } else {
            metrics::counter!("rankguard_cache_misses_total").increment(1);
        }
        result
    }

    /// Stores a snapshot unless an invalidation happened since it was loaded.
    ///
    /// Returns whether the snapshot was stored.
    pub fn put(&self, player: Uuid, set: Arc<ResolvedPermissionSet>) -> bool {
        if !self.config.enabled {
            return false;
        }
        let current = self.generation(player);
        if set.generation() != current {
            debug!(
                player = %player,
                generation = set.generation(),
                current,
                "Discarding snapshot loaded before an invalidation"
            );
            return false;
        }
        self.cache.insert(player, set);
        true
    }

    /// Invalidates one player: bumps the epoch, then drops the entry.
    pub fn invalidate(&self, player: Uuid) {
        let next = self.next_epoch();
        self.epochs
            .entry(player)
            .and_upsert_with(|current| current.map_or(next, |e| e.into_value().max(next)));
        self.cache.invalidate(&player);
    }

    /// Invalidates every player holding `group_id` directly or transitively.
    ///
    /// Returns the invalidated players.
    pub fn invalidate_all(&self, group_id: &str) -> Vec<Uuid> {
        let players: Vec<Uuid> = self.registry.players_holding(group_id).into_iter().collect();
        for player in &players {
            self.invalidate(*player);
        }
        debug!(group_id = %group_id, players = players.len(), "Invalidated group holders");
        players
    }

    /// Invalidates every entry, including players not in the reverse index.
    pub fn invalidate_everything(&self) {
        let next = self.next_epoch();
        self.floor.fetch_max(next, Ordering::AcqRel);
        self.cache.invalidate_all();
        debug!(floor = next, "Invalidated all cached snapshots");
    }

    /// Players whose cached snapshot depends on a membership expired at `now`.
    pub fn expired_players(&self) -> Vec<Uuid> {
        let now = self.clock.now();
        self.cache
            .iter()
            .filter(|(_, set)| set.is_expired_at(now))
            .map(|(player, _)| *player)
            .collect()
    }

    /// Players with a cached snapshot.
    pub fn cached_players(&self) -> Vec<Uuid> {
        self.cache.iter().map(|(player, _)| *player).collect()
    }

    /// Whether a snapshot is stored for the player, fresh or not.
    pub fn contains(&self, player: Uuid) -> bool {
        self.cache.contains_key(&player)
    }

    /// Returns the approximate number of entries in the cache.
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Returns the approximate number of retained invalidation epochs.
    pub fn epoch_count(&self) -> u64 {
        self.epochs.entry_count()
    }

    /// Runs pending maintenance tasks.
    ///
    /// This triggers any pending evictions. Useful for testing TTL behavior.
    pub fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks();
        self.epochs.run_pending_tasks();
    }

    fn next_epoch(&self) -> u64 {
        self.epoch_counter.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// Registers permission cache metrics descriptions.
///
/// Optional; call once at startup to describe metrics to the installed recorder.
pub fn register_permission_cache_metrics() {
    metrics::describe_counter!(
        "rankguard_cache_hits_total",
        "Total number of permission cache hits"
    );
    metrics::describe_counter!(
        "rankguard_cache_misses_total",
        "Total number of permission cache misses"
    );
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::Utc;

    use super::*;
    use crate::clock::ManualClock;
    use crate::model::Group;

    fn new_cache(config: PermissionCacheConfig) -> (PermissionCache, Arc<GroupRegistry>, ManualClock) {
        let registry = Arc::new(GroupRegistry::new());
        let clock = ManualClock::default();
        let cache = PermissionCache::new(config, Arc::clone(&registry), Arc::new(clock.clone()));
        (cache, registry, clock)
    }

    fn snapshot(player: Uuid, generation: u64) -> Arc<ResolvedPermissionSet> {
        Arc::new(ResolvedPermissionSet {
            player_id: player,
            inherited: HashMap::from([("chat.send".to_string(), true)]),
            overrides: HashMap::new(),
            groups: vec!["default".to_string()],
            prefix: None,
            generation,
            computed_at: Utc::now(),
            valid_until: None,
        })
    }

    // ============================================================
    // Section 1: Cache Structure
    // ============================================================

    #[test]
    fn test_cache_creation_and_initial_state() {
        // Arrange
        let (cache, _, _) = new_cache(PermissionCacheConfig::default());

        // Act
        let result = cache.get(Uuid::new_v4());

        // Assert
        assert!(result.is_none());
        assert_eq!(cache.entry_count(), 0);
    }

    #[test]
    fn test_put_then_get_returns_same_snapshot() {
        // Arrange
        let (cache, _, _) = new_cache(PermissionCacheConfig::default());
        let player = Uuid::new_v4();
        let set = snapshot(player, cache.generation(player));

        // Act
        assert!(cache.put(player, Arc::clone(&set)));
        let result = cache.get(player);

        // Assert
        assert!(Arc::ptr_eq(&result.unwrap(), &set));
    }

    #[test]
    fn test_disabled_cache_never_stores() {
        let (cache, _, _) = new_cache(PermissionCacheConfig::default().with_enabled(false));
        let player = Uuid::new_v4();

        assert!(!cache.put(player, snapshot(player, 0)));
        assert!(cache.get(player).is_none());
    }

    #[test]
    fn test_config_builders() {
        let config = PermissionCacheConfig::default()
            .with_max_capacity(5)
            .with_ttl(Duration::from_secs(1))
            .with_epoch_retention(Duration::from_secs(3));
        assert!(config.enabled);
        assert_eq!(config.max_capacity, 5);
        assert_eq!(config.ttl, Duration::from_secs(1));
        assert_eq!(config.epoch_retention, Duration::from_secs(3));
    }

    // ============================================================
    // Section 2: TTL and capacity
    // ============================================================

    #[test]
    fn test_cached_entry_expires_after_ttl() {
        // Arrange
        let config = PermissionCacheConfig::default().with_ttl(Duration::from_millis(50));
        let (cache, _, _) = new_cache(config);
        let player = Uuid::new_v4();
        cache.put(player, snapshot(player, 0));
        assert!(cache.get(player).is_some());

        // Act
        std::thread::sleep(Duration::from_millis(100));
        cache.run_pending_tasks();

        // Assert
        assert!(cache.get(player).is_none());
    }

    #[test]
    fn test_capacity_is_bounded() {
        let (cache, _, _) = new_cache(PermissionCacheConfig::default().with_max_capacity(10));
        for _ in 0..100 {
            let player = Uuid::new_v4();
            cache.put(player, snapshot(player, 0));
        }
        cache.run_pending_tasks();
        assert!(cache.entry_count() <= 10);
    }

    // ============================================================
    // Section 3: Invalidation and generations
    // ============================================================

    #[test]
    fn test_invalidate_removes_entry_and_bumps_generation() {
        // Arrange
        let (cache, _, _) = new_cache(PermissionCacheConfig::default());
        let player = Uuid::new_v4();
        let before = cache.generation(player);
        cache.put(player, snapshot(player, before));

        // Act
        cache.invalidate(player);

        // Assert
        assert!(cache.get(player).is_none());
        assert!(cache.generation(player) > before);
    }

    #[test]
    fn test_late_put_from_pre_invalidation_load_is_discarded() {
        // Arrange: a load observes the generation, then an invalidation lands.
        let (cache, _, _) = new_cache(PermissionCacheConfig::default());
        let player = Uuid::new_v4();
        let observed = cache.generation(player);
        cache.invalidate(player);

        // Act
        let stored = cache.put(player, snapshot(player, observed));

        // Assert
        assert!(!stored);
        assert!(cache.get(player).is_none());
    }

    #[test]
    fn test_invalidate_everything_raises_floor_for_unknown_players() {
        let (cache, _, _) = new_cache(PermissionCacheConfig::default());
        let player = Uuid::new_v4();
        cache.put(player, snapshot(player, 0));

        cache.invalidate_everything();

        assert!(cache.get(player).is_none());
        let never_seen = Uuid::new_v4();
        assert!(cache.generation(never_seen) > 0);
        assert!(!cache.put(never_seen, snapshot(never_seen, 0)));
    }

    #[test]
    fn test_generation_never_decreases() {
        let (cache, _, _) = new_cache(PermissionCacheConfig::default());
        let player = Uuid::new_v4();
        let mut last = cache.generation(player);
        for i in 0..20 {
            if i % 3 == 0 {
                cache.invalidate_everything();
            } else {
                cache.invalidate(player);
            }
            let now = cache.generation(player);
            assert!(now > last);
            last = now;
        }
    }

    #[test]
    fn test_idle_epochs_are_forgotten() {
        // Arrange
        let config = PermissionCacheConfig::default().with_epoch_retention(Duration::from_millis(50));
        let (cache, _, _) = new_cache(config);
        let players: Vec<Uuid> = (0..100).map(|_| Uuid::new_v4()).collect();
        for player in &players {
            cache.invalidate(*player);
        }
        cache.run_pending_tasks();
        assert_eq!(cache.epoch_count(), 100);

        // Act
        std::thread::sleep(Duration::from_millis(100));
        cache.run_pending_tasks();

        // Assert: forgotten epochs fall back to the floor
        assert_eq!(cache.epoch_count(), 0);
        assert_eq!(cache.generation(players[0]), 0);
    }

    #[test]
    fn test_snapshot_outliving_its_epoch_is_a_miss() {
        let config = PermissionCacheConfig::default().with_epoch_retention(Duration::from_millis(50));
        let (cache, _, _) = new_cache(config);
        let player = Uuid::new_v4();
        cache.invalidate(player);
        assert!(cache.put(player, snapshot(player, cache.generation(player))));

        std::thread::sleep(Duration::from_millis(100));
        cache.run_pending_tasks();

        assert!(cache.contains(player));
        assert!(cache.get(player).is_none());
        assert!(!cache.contains(player));
    }

    #[tokio::test]
    async fn test_invalidate_all_uses_reverse_index() {
        // Arrange
        let (cache, registry, _) = new_cache(PermissionCacheConfig::default());
        registry
            .load(vec![
                Group::new("default", "Default"),
                Group::new("vip", "VIP").with_parent("default"),
                Group::new("builder", "Builder"),
            ])
            .await
            .unwrap();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        registry.track_player(alice, vec!["vip".to_string()]);
        registry.track_player(bob, vec!["builder".to_string()]);
        cache.put(alice, snapshot(alice, 0));
        cache.put(bob, snapshot(bob, 0));

        // Act
        let invalidated = cache.invalidate_all("default");

        // Assert
        assert_eq!(invalidated, vec![alice]);
        assert!(cache.get(alice).is_none());
        assert!(cache.get(bob).is_some());
    }

    #[test]
    fn test_snapshot_past_expiry_bound_is_a_miss() {
        // Arrange
        let (cache, _, clock) = new_cache(PermissionCacheConfig::default());
        let player = Uuid::new_v4();
        let mut set = (*snapshot(player, 0)).clone();
        set.valid_until = Some(clock.now() + chrono::Duration::seconds(10));
        cache.put(player, Arc::new(set));
        assert!(cache.get(player).is_some());
        assert!(cache.expired_players().is_empty());

        // Act
        clock.advance(chrono::Duration::seconds(10));

        // Assert
        assert_eq!(cache.expired_players(), vec![player]);
        assert!(cache.get(player).is_none());
    }

    // ============================================================
    // Section 4: Concurrency
    // ============================================================

    #[tokio::test]
    async fn test_concurrent_reads_dont_block_each_other() {
        // Arrange
        let (cache, _, _) = new_cache(PermissionCacheConfig::default());
        let cache = Arc::new(cache);
        let player = Uuid::new_v4();
        cache.put(player, snapshot(player, 0));

        // Act
        let mut handles = Vec::new();
        for _ in 0..100 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move { cache.get(player).is_some() }));
        }

        // Assert
        for handle in handles {
            assert!(handle.await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_no_deadlocks_under_high_contention() {
        let (cache, _, _) = new_cache(PermissionCacheConfig::default());
        let cache = Arc::new(cache);
        let players: Vec<Uuid> = (0..8).map(|_| Uuid::new_v4()).collect();

        let mut handles = Vec::new();
        for i in 0..200 {
            let cache = Arc::clone(&cache);
            let player = players[i % players.len()];
            handles.push(tokio::spawn(async move {
                match i % 4 {
                    0 => cache.invalidate(player),
                    1 => {
                        let generation = cache.generation(player);
                        cache.put(player, snapshot(player, generation));
                    }
                    2 => cache.invalidate_everything(),
                    _ => {
                        let _ = cache.get(player);
                    }
                }
            }));
        }

        let result = tokio::time::timeout(Duration::from_secs(5), async {
            for handle in handles {
                handle.await.unwrap();
            }
        })
        .await;
        assert!(result.is_ok(), "cache operations deadlocked");
    }
}
