//! The permission service facade exposed to the host.
//!
//! # Architecture
//!
//! ```text
//!  host tick / workers            admin commands
//!        │ has_permission               │ grant, revoke, edit group ...
//!        ▼                              ▼
//!  ┌────────────┐  miss   ┌────────────────────────┐
//!  │   cache    │────────▶│ background load        │  singleflight per player
//!  └────────────┘         │ io pool + retry        │
//!        ▲                └────────────────────────┘
//!        │ invalidate                   │
//!  ┌─────────────────────┐   commit  ┌──────────────────┐
//!  │ consistency manager │◀──────────│ registry writer  │
//!  └─────────────────────┘           │ + repository     │
//!                                    └──────────────────┘
//! ```
//!
//! `has_permission` never waits on storage unless strict consistency is enabled
//! (or the cache is disabled), and then only up to `strict_timeout_ms`. Every
//! other path falls back to the default policy.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::sync_channel;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rankguard_domain::model::parse_duration_input;
use rankguard_domain::registry::RegistryWriter;
use rankguard_domain::resolver::CacheMetricsSnapshot;
use rankguard_domain::{
    Clock, DomainError, DomainResult, Group, GroupRegistry, PermissionCache, PermissionNode,
    PermissionResolver, ResolvedPermissionSet, ResolverConfig, SystemClock,
};
use rankguard_storage::{
    AuditEntry, HealthStatus, MemoryPermissionStore, PermissionStore, PostgresConfig,
    PostgresPermissionStore, StorageResult,
};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{group_to_stored, map_storage_error, stored_to_group, StoreProfileReader};
use crate::config::{ServiceConfig, StorageSettings};
use crate::consistency::{ChangeListener, ChangeReason, ConsistencyManager, PermissionChange};
use crate::io_pool::IoPool;
use crate::retry::{with_retry, DegradedState, RetryPolicy};
use crate::singleflight::{Singleflight, SingleflightGuard, SingleflightSlot};

type LoadResult = DomainResult<Arc<ResolvedPermissionSet>>;

/// Opens the repository named by the storage settings.
///
/// PostgreSQL stores are migrated before they are returned.
pub async fn connect_store(settings: &StorageSettings) -> DomainResult<Arc<dyn PermissionStore>> {
    match settings.backend.as_str() {
        "memory" => {
            let store: Arc<dyn PermissionStore> = Arc::new(MemoryPermissionStore::new());
            Ok(store)
        }
        "postgres" => {
            let config = PostgresConfig {
                database_url: settings.database_url.clone().unwrap_or_default(),
                max_connections: settings.pool_size,
                connect_timeout_secs: settings.connection_timeout_secs,
                query_timeout_secs: settings.query_timeout_secs,
                ..Default::default()
            };
            let store = PostgresPermissionStore::from_config(&config)
                .await
                .map_err(map_storage_error)?;
            store.run_migrations().await.map_err(map_storage_error)?;
            let store: Arc<dyn PermissionStore> = Arc::new(store);
            Ok(store)
        }
        other => Err(DomainError::ConstraintViolation {
            message: format!("unknown storage backend '{other}'"),
        }),
    }
}

pub(crate) struct Inner<S: PermissionStore + ?Sized> {
    pub(crate) config: ServiceConfig,
    pub(crate) store: Arc<S>,
    pub(crate) registry: Arc<GroupRegistry>,
    pub(crate) cache: Arc<PermissionCache>,
    pub(crate) resolver: PermissionResolver<StoreProfileReader<S>>,
    profiles: Arc<StoreProfileReader<S>>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) consistency: ConsistencyManager,
    pub(crate) io: IoPool,
    pub(crate) retry: RetryPolicy,
    pub(crate) degraded: DegradedState,
    pub(crate) loads: Singleflight<Uuid, LoadResult>,
    runtime: Handle,
    shutdown: watch::Sender<bool>,
    background: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl<S: PermissionStore + ?Sized> Inner<S> {
    /// Runs a repository call on the I/O pool with retry, mapping its error.
    pub(crate) async fn storage_call<T, F, Fut>(
        &self,
        operation: &str,
        mut call: F,
    ) -> DomainResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        self.io
            .run(with_retry(&self.retry, &self.degraded, operation, || {
                let pending = call();
                async move { pending.await.map_err(map_storage_error) }
            }))
            .await
    }

    /// Loads and caches a player's set on the I/O pool with retry.
    ///
    /// Memberships the load purged as expired are dropped from the reverse
    /// index and reported to listeners.
    pub(crate) async fn load_with_retry(&self, player: Uuid) -> LoadResult {
        let result = self
            .io
            .run(with_retry(&self.retry, &self.degraded, "load_profile", || {
                self.resolver.load(player)
            }))
            .await;

        let purged = self.profiles.take_purged(player);
        if !purged.is_empty() {
            for group_id in &purged {
                self.registry.remove_holder(player, group_id);
            }
            debug!(player = %player, purged = ?purged, "Membership expired");
            self.consistency.membership_expired(player, purged);
        }
        result
    }

    fn default_answer(&self) -> bool {
        self.config.resolver.default_policy.as_bool()
    }
}

/// Permission checks, resolution and administration over one repository.
///
/// Cheap to clone; clones share all state.
pub struct PermissionService<S: PermissionStore + ?Sized = dyn PermissionStore> {
    inner: Arc<Inner<S>>,
}

impl<S: PermissionStore + ?Sized> Clone for PermissionService<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl PermissionService<dyn PermissionStore> {
    /// Opens the configured repository and builds a service over it.
    ///
    /// Call [`start`](Self::start) afterwards to load groups and start the
    /// background tasks.
    pub async fn from_config(config: ServiceConfig) -> DomainResult<Self> {
        let store = connect_store(&config.storage).await?;
        Self::with_clock(config, store, Arc::new(SystemClock))
    }
}

impl<S: PermissionStore + ?Sized> PermissionService<S> {
    /// Builds a service using wall-clock time. Must be called inside a tokio runtime.
    pub fn new(config: ServiceConfig, store: Arc<S>) -> DomainResult<Self> {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    /// Builds a service with an explicit clock. Must be called inside a tokio runtime.
    pub fn with_clock(
        config: ServiceConfig,
        store: Arc<S>,
        clock: Arc<dyn Clock>,
    ) -> DomainResult<Self> {
        config
            .validate()
            .map_err(|e| DomainError::ConstraintViolation {
                message: e.to_string(),
            })?;
        let runtime = Handle::try_current().map_err(|e| DomainError::Internal {
            message: format!("permission service requires a tokio runtime: {e}"),
        })?;

        let registry = Arc::new(GroupRegistry::new());
        // Epochs must outlive any load that could still put against them
        let epoch_retention = Duration::from_secs(config.cache.ttl_secs)
            .max(config.resolver.load_timeout())
            * 2;
        let cache = Arc::new(PermissionCache::new(
            config
                .cache
                .to_cache_config()
                .with_epoch_retention(epoch_retention),
            Arc::clone(&registry),
            Arc::clone(&clock),
        ));
        let resolver_config = ResolverConfig::default()
            .with_cache(Arc::clone(&cache))
            .with_default_policy(config.resolver.default_policy)
            .with_conflict_policy(config.resolver.conflict_policy)
            .with_load_timeout(config.resolver.load_timeout());
        let profiles = Arc::new(StoreProfileReader::new(Arc::clone(&store), Arc::clone(&clock)));
        let resolver = PermissionResolver::with_config(
            Arc::clone(&registry),
            Arc::clone(&profiles),
            Arc::clone(&clock),
            resolver_config,
        );
        let io = IoPool::new(config.storage.io_workers, config.resolver.load_timeout());
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(Inner {
                consistency: ConsistencyManager::new(Arc::clone(&cache), Arc::clone(&registry)),
                retry: config.retry.to_policy(),
                config,
                store,
                registry,
                cache,
                resolver,
                profiles,
                clock,
                io,
                degraded: DegradedState::new(),
                loads: Singleflight::new(),
                runtime,
                shutdown,
                background: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<GroupRegistry> {
        &self.inner.registry
    }

    pub fn cache(&self) -> &Arc<PermissionCache> {
        &self.inner.cache
    }

    pub fn store(&self) -> &Arc<S> {
        &self.inner.store
    }

    // Lifecycle

    /// Loads every group from the repository and starts the expiry sweeper and
    /// the degraded-mode recovery probe. Calling it again is a no-op.
    #[instrument(skip(self))]
    pub async fn start(&self) -> DomainResult<()> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        crate::observability::register_metrics();
        if let Err(e) = self.load_groups().await {
            self.inner.started.store(false, Ordering::Release);
            return Err(e);
        }

        let sweeper = crate::expiry::spawn_sweeper(
            Arc::clone(&self.inner),
            self.inner.config.expiry.sweep_interval(),
            self.inner.shutdown.subscribe(),
        );
        let recovery = self.spawn_recovery_probe();
        self.inner
            .background
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend([sweeper, recovery]);

        info!(
            groups = self.inner.registry.snapshot().len(),
            strict = self.inner.config.resolver.strict_consistency,
            "Permission service started"
        );
        Ok(())
    }

    /// Stops background tasks, cancels pending loads and drops cached state.
    pub async fn shutdown(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.inner.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self
                .inner
                .background
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        );
        for task in tasks {
            let _ = task.await;
        }
        self.inner.loads.cancel_all();
        self.inner.io.close();
        self.inner.cache.invalidate_everything();
        info!("Permission service stopped");
    }

    /// Reloads the group graph from the repository.
    pub async fn load_groups(&self) -> DomainResult<()> {
        let inner = &self.inner;
        let stored = inner
            .storage_call("load_all_groups", || inner.store.load_all_groups())
            .await?;
        let groups = stored
            .into_iter()
            .map(stored_to_group)
            .collect::<DomainResult<Vec<_>>>()?;
        inner.registry.load(groups).await?;
        inner.cache.invalidate_everything();
        Ok(())
    }

    fn spawn_recovery_probe(&self) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let mut shutdown = inner.shutdown.subscribe();
        let period = inner.retry.max_delay.max(Duration::from_millis(10));
        inner.runtime.clone().spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        if !inner.degraded.is_degraded() {
                            continue;
                        }
                        match inner.store.health_check().await {
                            Ok(_) => inner.degraded.clear(),
                            Err(e) => debug!(error = %e, "Storage still unavailable"),
                        }
                    }
                }
            }
        })
    }

    // Hot path

    /// Checks one node for a player. Never fails and never blocks on storage
    /// outside strict mode.
    ///
    /// On a cache miss a deduplicated background load is scheduled and the
    /// default policy is returned. In strict mode (or with the cache disabled) the
    /// caller waits up to `strict_timeout_ms` for that load; callers on a
    /// single-threaded runtime should not enable it.
    pub fn has_permission(&self, player: Uuid, node: &str) -> bool {
        let inner = &self.inner;
        let node = match PermissionNode::parse(node) {
            Ok(node) => node,
            Err(e) => {
                warn!(player = %player, error = %e, "Rejected malformed permission node");
                return inner.default_answer();
            }
        };
        let default = inner.config.resolver.default_policy;

        if let Some(set) = inner.resolver.cached(player) {
            return set.allows(&node, default);
        }
        if inner.stopped.load(Ordering::Acquire) {
            return default.as_bool();
        }

        let wait = inner.config.resolver.strict_consistency || !inner.cache.is_enabled();
        if !wait {
            self.schedule_load(player, None);
            metrics::counter!("rankguard_default_fallbacks_total").increment(1);
            debug!(player = %player, node = %node.as_str(), "Cache miss, answering default");
            return default.as_bool();
        }

        let (tx, rx) = sync_channel(1);
        self.schedule_load(player, Some(tx));
        match rx.recv_timeout(inner.config.resolver.strict_timeout()) {
            Ok(Ok(set)) => set.allows(&node, default),
            Ok(Err(e)) => {
                warn!(player = %player, error = %e, "Permission load failed, answering default");
                metrics::counter!("rankguard_default_fallbacks_total").increment(1);
                default.as_bool()
            }
            Err(_) => {
                debug!(player = %player, "Strict wait timed out, answering default");
                metrics::counter!("rankguard_default_fallbacks_total").increment(1);
                default.as_bool()
            }
        }
    }

    /// Starts a background load for `player` unless one started at the
    /// player's current generation is already running.
    fn schedule_load(&self, player: Uuid, waiter: Option<std::sync::mpsc::SyncSender<LoadResult>>) {
        let generation = self.inner.cache.generation(player);
        let SingleflightSlot::Leader(id) = self.inner.loads.acquire_at(player, generation, waiter)
        else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        let task = self.inner.runtime.spawn(async move {
            let guard = SingleflightGuard::new(&inner.loads, player, id);
            let result = inner.load_with_retry(player).await;
            if let Err(e) = &result {
                warn!(player = %player, error = %e, "Background permission load failed");
            }
            guard.complete(result);
        });
        self.inner.loads.attach(&player, id, task.abort_handle());
    }

    /// Resolves a player's full effective set, loading it if needed.
    pub async fn resolve(&self, player: Uuid) -> DomainResult<Arc<ResolvedPermissionSet>> {
        if let Some(set) = self.inner.resolver.cached(player) {
            return Ok(set);
        }
        self.inner.load_with_retry(player).await
    }

    /// Whether a background load for the player is in flight.
    pub fn is_loading(&self, player: Uuid) -> bool {
        self.inner.loads.is_in_flight(&player)
    }

    pub fn cache_metrics(&self) -> CacheMetricsSnapshot {
        self.inner.resolver.cache_metrics().snapshot()
    }

    // Player lifecycle

    /// Preloads a player's set and makes sure the repository knows the player.
    pub fn player_joined(&self, player: Uuid) {
        if self.inner.stopped.load(Ordering::Acquire) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        self.inner.runtime.spawn(async move {
            if let Err(e) = inner
                .storage_call("ensure_profile", || inner.store.ensure_profile(player))
                .await
            {
                warn!(player = %player, error = %e, "Failed to register player");
            }
        });
        self.schedule_load(player, None);
    }

    /// Cancels the player's pending load and evicts their cached state.
    pub fn player_left(&self, player: Uuid) {
        let cancelled = self.inner.loads.cancel(&player);
        self.inner.consistency.evict(player);
        debug!(player = %player, cancelled, "Player left");
    }

    // Change notification & health

    /// Registers a listener invoked once per player whose effective set changed.
    pub fn on_change(&self, listener: impl Fn(&PermissionChange) + Send + Sync + 'static) {
        let listener: ChangeListener = Arc::new(listener);
        self.inner.consistency.add_listener(listener);
    }

    /// Whether storage retries were exhausted and have not succeeded since.
    pub fn is_degraded(&self) -> bool {
        self.inner.degraded.is_degraded()
    }

    pub fn degraded_reason(&self) -> Option<String> {
        self.inner.degraded.last_error()
    }

    pub async fn health_check(&self) -> DomainResult<HealthStatus> {
        self.inner
            .store
            .health_check()
            .await
            .map_err(map_storage_error)
    }

    /// Sweeps cached sets whose timed memberships ran out. Returns the number of
    /// players swept. The background sweeper calls this on its interval.
    pub async fn sweep_expired(&self) -> usize {
        self.inner.sweep_expired().await
    }

    /// Drops players with neither a cached set nor a pending load from the
    /// reverse index. Returns the number dropped. The background sweeper calls
    /// this on its interval.
    pub async fn prune_idle_players(&self) -> usize {
        self.inner.prune_idle_players().await
    }

    pub async fn read_audit_log(&self, limit: usize) -> DomainResult<Vec<AuditEntry>> {
        let inner = &self.inner;
        inner
            .storage_call("read_audit_log", || inner.store.read_audit_log(limit))
            .await
    }

    // Group administration

    pub fn group(&self, id: &str) -> DomainResult<Arc<Group>> {
        self.inner.registry.get_group(id)
    }

    pub fn groups(&self) -> Vec<Arc<Group>> {
        let graph = self.inner.registry.snapshot();
        let mut groups: Vec<Arc<Group>> = graph.groups().cloned().collect();
        groups.sort_by(|a, b| a.id.cmp(&b.id));
        groups
    }

    /// Creates or replaces a group.
    ///
    /// Fails with `CyclicInheritance` if the parents would form a cycle and with
    /// `NotFound` if a parent is unknown; nothing is written in either case.
    #[instrument(skip(self, group), fields(group_id = %group.id))]
    pub async fn upsert_group(&self, group: Group) -> DomainResult<()> {
        let writer = self.inner.registry.write().await;
        self.commit_group(writer, group).await
    }

    /// Edits a group in place inside the writer section.
    async fn edit_group(&self, id: &str, edit: impl FnOnce(&mut Group)) -> DomainResult<()> {
        let writer = self.inner.registry.write().await;
        let mut group = writer
            .graph()
            .get(id)
            .map(|g| (**g).clone())
            .ok_or_else(|| DomainError::group_not_found(id))?;
        edit(&mut group);
        self.commit_group(writer, group).await
    }

    async fn commit_group(&self, writer: RegistryWriter<'_>, group: Group) -> DomainResult<()> {
        writer.check_upsert(&group)?;
        let stored = group_to_stored(&group);
        let inner = &self.inner;
        inner
            .storage_call("save_group", || inner.store.save_group(&stored))
            .await?;
        let change = writer.commit_upsert(group);
        drop(writer);

        info!(
            group_id = %change.group_id,
            affected = change.affected_players.len(),
            everyone = change.invalidate_everything,
            "Group saved"
        );
        let reason = ChangeReason::GroupUpdated {
            group_id: change.group_id.clone(),
        };
        inner.consistency.group_changed(&change, reason);
        Ok(())
    }

    /// Deletes a group. Fails with `ConstraintViolation` while another group
    /// inherits from it.
    #[instrument(skip(self))]
    pub async fn delete_group(&self, id: &str) -> DomainResult<()> {
        let inner = &self.inner;
        let writer = inner.registry.write().await;
        writer.check_delete(id)?;
        inner
            .storage_call("delete_group", || inner.store.delete_group(id))
            .await?;
        let change = writer.commit_delete(id);
        drop(writer);

        info!(group_id = %id, affected = change.affected_players.len(), "Group deleted");
        let reason = ChangeReason::GroupDeleted {
            group_id: id.to_string(),
        };
        inner.consistency.group_changed(&change, reason);
        Ok(())
    }

    /// Adds an inheritance edge `child -> parent`.
    pub async fn add_parent(&self, child: &str, parent: &str) -> DomainResult<()> {
        self.edit_group(child, |g| {
            g.parents.insert(parent.to_string());
        })
        .await
    }

    pub async fn remove_parent(&self, child: &str, parent: &str) -> DomainResult<()> {
        self.edit_group(child, |g| {
            g.parents.remove(parent);
        })
        .await
    }

    /// Sets (`Some`) or removes (`None`) a node on a group.
    pub async fn set_group_permission(
        &self,
        group_id: &str,
        node: &str,
        value: Option<bool>,
    ) -> DomainResult<()> {
        let node = PermissionNode::parse(node)?;
        self.edit_group(group_id, |g| match value {
            Some(value) => {
                g.permissions.insert(node, value);
            }
            None => {
                g.permissions.remove(&node);
            }
        })
        .await
    }

    /// Makes `group_id` the default group, clearing the previous default.
    pub async fn set_default_group(&self, group_id: &str) -> DomainResult<()> {
        self.edit_group(group_id, |g| g.is_default = true).await
    }

    pub async fn set_group_prefix(&self, group_id: &str, prefix: Option<String>) -> DomainResult<()> {
        self.edit_group(group_id, |g| g.prefix = prefix).await
    }

    // Memberships & overrides

    /// Grants a group, optionally until `expires_at`. Granting a held group
    /// replaces its expiry.
    #[instrument(skip(self))]
    pub async fn grant_group(
        &self,
        player: Uuid,
        group_id: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> DomainResult<()> {
        let inner = &self.inner;
        inner.registry.get_group(group_id)?;
        if let Some(expiry) = expires_at {
            if expiry <= inner.clock.now() {
                return Err(DomainError::ConstraintViolation {
                    message: format!("membership expiry {expiry} is not in the future"),
                });
            }
        }

        inner
            .storage_call("grant_group", || {
                inner.store.grant_group(player, group_id, expires_at)
            })
            .await?;
        inner.registry.add_holder(player, group_id);

        info!(player = %player, group_id = %group_id, expires_at = ?expires_at, "Group granted");
        inner.consistency.player_changed(
            player,
            ChangeReason::GroupGranted {
                group_id: group_id.to_string(),
            },
        );
        Ok(())
    }

    /// Grants a group for a duration given as administrator input, e.g. `30d 12h`.
    pub async fn grant_group_for(&self, player: Uuid, group_id: &str, input: &str) -> DomainResult<()> {
        let duration = parse_duration_input(input);
        if duration.is_zero() {
            return Err(DomainError::ConstraintViolation {
                message: format!("'{input}' does not describe a duration"),
            });
        }
        let duration =
            chrono::Duration::from_std(duration).map_err(|e| DomainError::ConstraintViolation {
                message: format!("duration '{input}' is out of range: {e}"),
            })?;
        let expires_at = self.inner.clock.now() + duration;
        self.grant_group(player, group_id, Some(expires_at)).await
    }

    /// Revokes a group. Fails with `NotFound` if the player does not hold it.
    #[instrument(skip(self))]
    pub async fn revoke_group(&self, player: Uuid, group_id: &str) -> DomainResult<()> {
        let inner = &self.inner;
        inner
            .storage_call("revoke_group", || inner.store.revoke_group(player, group_id))
            .await?;
        inner.registry.remove_holder(player, group_id);

        info!(player = %player, group_id = %group_id, "Group revoked");
        inner.consistency.player_changed(
            player,
            ChangeReason::GroupRevoked {
                group_id: group_id.to_string(),
            },
        );
        Ok(())
    }

    /// Sets an explicit value for a node, outranking every group.
    #[instrument(skip(self))]
    pub async fn set_override(&self, player: Uuid, node: &str, value: bool) -> DomainResult<()> {
        let inner = &self.inner;
        let node = PermissionNode::parse(node)?;
        inner
            .storage_call("set_override", || {
                inner.store.set_override(player, node.as_str(), value)
            })
            .await?;

        info!(player = %player, node = %node.as_str(), value, "Override set");
        inner.consistency.player_changed(
            player,
            ChangeReason::OverrideChanged {
                node: node.as_str().to_string(),
            },
        );
        Ok(())
    }

    /// Removes an explicit value. Fails with `NotFound` if there is none.
    #[instrument(skip(self))]
    pub async fn clear_override(&self, player: Uuid, node: &str) -> DomainResult<()> {
        let inner = &self.inner;
        let node = PermissionNode::parse(node)?;
        inner
            .storage_call("clear_override", || {
                inner.store.clear_override(player, node.as_str())
            })
            .await?;

        info!(player = %player, node = %node.as_str(), "Override cleared");
        inner.consistency.player_changed(
            player,
            ChangeReason::OverrideChanged {
                node: node.as_str().to_string(),
            },
        );
        Ok(())
    }
}

impl<S: PermissionStore + ?Sized> std::fmt::Debug for PermissionService<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionService")
            .field("config", &self.inner.config)
            .field("cache", &self.inner.cache)
            .field("consistency", &self.inner.consistency)
            .field("pending_loads", &self.inner.loads.len())
            .field("degraded", &self.inner.degraded.is_degraded())
            .finish()
    }
}
