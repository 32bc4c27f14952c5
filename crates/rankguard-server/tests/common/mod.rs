//! Shared fixtures for service integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rankguard_domain::{Group, ManualClock};
use rankguard_server::adapters::group_to_stored;
use rankguard_server::{PermissionChange, PermissionService, ServiceConfig};
use rankguard_storage::{
    AuditEntry, HealthStatus, MemoryPermissionStore, PermissionStore, StorageError,
    StorageResult, StoredGroup, StoredProfile,
};
use uuid::Uuid;

/// In-memory store that can inject transient failures and latency into
/// profile loads. A delayed load returns the profile as it was when the
/// load started.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryPermissionStore,
    failing_loads: AtomicU32,
    failing_health: AtomicBool,
    load_delay: Mutex<Option<Duration>>,
    load_calls: AtomicU32,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next `count` profile loads fail with a connection error.
    pub fn fail_next_loads(&self, count: u32) {
        self.failing_loads.store(count, Ordering::SeqCst);
    }

    pub fn fail_health(&self, failing: bool) {
        self.failing_health.store(failing, Ordering::SeqCst);
    }

    pub fn set_load_delay(&self, delay: Option<Duration>) {
        *self.load_delay.lock().unwrap() = delay;
    }

    pub fn load_calls(&self) -> u32 {
        self.load_calls.load(Ordering::SeqCst)
    }

    fn connection_refused() -> StorageError {
        StorageError::ConnectionError {
            message: "connection refused".to_string(),
        }
    }
}

#[async_trait]
impl PermissionStore for FlakyStore {
    async fn load_all_groups(&self) -> StorageResult<Vec<StoredGroup>> {
        self.inner.load_all_groups().await
    }

    async fn save_group(&self, group: &StoredGroup) -> StorageResult<()> {
        self.inner.save_group(group).await
    }

    async fn delete_group(&self, id: &str) -> StorageResult<()> {
        self.inner.delete_group(id).await
    }

    async fn load_profile(&self, player: Uuid) -> StorageResult<Option<StoredProfile>> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        // Snapshot first so the delay models a slow response to an earlier read
        let profile = self.inner.load_profile(player).await;
        let delay = *self.load_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failing = self
            .failing_loads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Self::connection_refused());
        }
        profile
    }

    async fn ensure_profile(&self, player: Uuid) -> StorageResult<()> {
        self.inner.ensure_profile(player).await
    }

    async fn grant_group(
        &self,
        player: Uuid,
        group_id: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> StorageResult<()> {
        self.inner.grant_group(player, group_id, expires_at).await
    }

    async fn revoke_group(&self, player: Uuid, group_id: &str) -> StorageResult<()> {
        self.inner.revoke_group(player, group_id).await
    }

    async fn set_override(&self, player: Uuid, node: &str, value: bool) -> StorageResult<()> {
        self.inner.set_override(player, node, value).await
    }

    async fn clear_override(&self, player: Uuid, node: &str) -> StorageResult<()> {
        self.inner.clear_override(player, node).await
    }

    async fn purge_expired_memberships(
        &self,
        player: Uuid,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<String>> {
        self.inner.purge_expired_memberships(player, now).await
    }

    async fn read_audit_log(&self, limit: usize) -> StorageResult<Vec<AuditEntry>> {
        self.inner.read_audit_log(limit).await
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        if self.failing_health.load(Ordering::SeqCst) {
            return Err(Self::connection_refused());
        }
        self.inner.health_check().await
    }
}

/// Config with fast retries suitable for tests.
pub fn test_config() -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.retry.max_attempts = 3;
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 10;
    config.resolver.strict_timeout_ms = 2_000;
    config
}

pub struct Harness {
    pub service: PermissionService<FlakyStore>,
    pub store: Arc<FlakyStore>,
    pub clock: ManualClock,
    pub changes: Arc<Mutex<Vec<PermissionChange>>>,
}

impl Harness {
    pub fn changes_for(&self, player: Uuid) -> Vec<PermissionChange> {
        self.changes
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.player_id == player)
            .cloned()
            .collect()
    }
}

/// Seeds the store with `groups`, then builds and starts a service over it.
pub async fn start_service(config: ServiceConfig, groups: Vec<Group>) -> Harness {
    let store = FlakyStore::new();
    for group in &groups {
        store.save_group(&group_to_stored(group)).await.unwrap();
    }
    let clock = ManualClock::default();
    let service =
        PermissionService::with_clock(config, Arc::clone(&store), Arc::new(clock.clone()))
            .unwrap();
    service.start().await.unwrap();

    let changes = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&changes);
    service.on_change(move |change| sink.lock().unwrap().push(change.clone()));

    Harness {
        service,
        store,
        clock,
        changes,
    }
}

/// Polls `condition` for up to two seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

pub fn group(id: &str) -> Group {
    Group::new(id, id.to_uppercase())
}
