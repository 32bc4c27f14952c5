//! Mock implementations for resolver testing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::clock::ManualClock;
use crate::error::{DomainError, DomainResult};
use crate::model::{Group, PlayerProfile};
use crate::registry::GroupRegistry;
use crate::resolver::{PermissionResolver, ProfileReader, ResolverConfig};

/// Mock profile reader for testing.
pub struct MockProfileReader {
    profiles: RwLock<HashMap<Uuid, PlayerProfile>>,
    loads: AtomicUsize,
    delay: Option<Duration>,
    fail_with: RwLock<Option<DomainError>>,
}

impl MockProfileReader {
    pub fn new() -> Self {
        Self {
            profiles: RwLock::new(HashMap::new()),
            loads: AtomicUsize::new(0),
            delay: None,
            fail_with: RwLock::new(None),
        }
    }

    /// A reader whose every load takes `delay`.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::new()
        }
    }

    pub async fn put(&self, profile: PlayerProfile) {
        self.profiles
            .write()
            .await
            .insert(profile.player_id, profile);
    }

    pub async fn fail_with(&self, error: Option<DomainError>) {
        *self.fail_with.write().await = error;
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProfileReader for MockProfileReader {
    async fn load_profile(&self, player: Uuid) -> DomainResult<PlayerProfile> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.fail_with.read().await.clone() {
            return Err(error);
        }
        Ok(self
            .profiles
            .read()
            .await
            .get(&player)
            .cloned()
            .unwrap_or_else(|| PlayerProfile::new(player)))
    }
}

/// Helper to create a new resolver with mocks over the given groups.
pub async fn create_resolver(
    groups: Vec<Group>,
    config: ResolverConfig,
) -> (
    Arc<MockProfileReader>,
    Arc<GroupRegistry>,
    ManualClock,
    PermissionResolver<MockProfileReader>,
) {
    let profiles = Arc::new(MockProfileReader::new());
    let registry = Arc::new(GroupRegistry::new());
    registry.load(groups).await.unwrap();
    let clock = ManualClock::default();
    let resolver = PermissionResolver::with_config(
        Arc::clone(&registry),
        Arc::clone(&profiles),
        Arc::new(clock.clone()),
        config,
    );
    (profiles, registry, clock, resolver)
}
