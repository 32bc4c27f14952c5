//! Consistency manager: turns committed mutations into cache invalidations and
//! change notifications.
//!
//! # Ordering
//!
//! Callers invoke the manager after the repository write has committed and before
//! they acknowledge the mutation. The invalidation bumps each affected player's
//! epoch synchronously, so a load that started before the write can no longer
//! populate the cache (see `PermissionCache::put`). That is the read-your-writes
//! guarantee; nothing here orders unrelated mutations against each other.
//!
//! # Collapsing
//!
//! Notifications go through a [`Singleflight`] keyed by player. While one
//! notification for a player is being dispatched, concurrent invalidations of the
//! same player are folded into it. The flight is closed before listeners run, so
//! an invalidation that lands after a listener started always produces another
//! notification.

use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use rankguard_domain::{GroupChange, GroupRegistry, PermissionCache};
use tracing::{debug, error};
use uuid::Uuid;

use crate::singleflight::{FlightId, Singleflight, SingleflightSlot};

/// Why a player's effective permissions changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeReason {
    GroupUpdated { group_id: String },
    GroupDeleted { group_id: String },
    GroupGranted { group_id: String },
    GroupRevoked { group_id: String },
    OverrideChanged { node: String },
    MembershipExpired { group_ids: Vec<String> },
}

/// Delivered to listeners once per affected player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionChange {
    pub player_id: Uuid,
    pub reason: ChangeReason,
}

/// Callback registered with `PermissionService::on_change`.
pub type ChangeListener = Arc<dyn Fn(&PermissionChange) + Send + Sync>;

pub struct ConsistencyManager {
    cache: Arc<PermissionCache>,
    registry: Arc<GroupRegistry>,
    listeners: RwLock<Vec<ChangeListener>>,
    notifications: Singleflight<Uuid, ()>,
}

impl ConsistencyManager {
    pub fn new(cache: Arc<PermissionCache>, registry: Arc<GroupRegistry>) -> Self {
        Self {
            cache,
            registry,
            listeners: RwLock::new(Vec::new()),
            notifications: Singleflight::new(),
        }
    }

    pub fn add_listener(&self, listener: ChangeListener) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Invalidates one player and notifies listeners.
    pub fn player_changed(&self, player: Uuid, reason: ChangeReason) {
        self.players_changed([player], reason);
    }

    /// Invalidates players and notifies listeners once per distinct player.
    pub fn players_changed(&self, players: impl IntoIterator<Item = Uuid>, reason: ChangeReason) {
        let mut seen = HashSet::new();
        let mut leading = Vec::new();
        for player in players {
            if !seen.insert(player) {
                continue;
            }
            self.cache.invalidate(player);
            metrics::counter!("rankguard_invalidations_total").increment(1);
            leading.extend(self.join_notification(player));
        }
        self.dispatch(leading, &reason);
    }

    /// Notifies listeners that a load found and purged expired memberships.
    ///
    /// Nothing is invalidated: the set that load built already excludes them.
    pub fn membership_expired(&self, player: Uuid, group_ids: Vec<String>) {
        let leading = self.join_notification(player);
        self.dispatch(leading, &ChangeReason::MembershipExpired { group_ids });
    }

    fn join_notification(&self, player: Uuid) -> Option<(Uuid, FlightId)> {
        match self.notifications.acquire(player, None) {
            SingleflightSlot::Leader(id) => Some((player, id)),
            SingleflightSlot::Follower => {
                metrics::counter!("rankguard_invalidations_collapsed_total").increment(1);
                debug!(player = %player, "Collapsed into in-flight notification");
                None
            }
        }
    }

    fn dispatch(&self, leading: impl IntoIterator<Item = (Uuid, FlightId)>, reason: &ChangeReason) {
        for (player, id) in leading {
            self.notifications.complete(&player, id, ());
            self.notify(&PermissionChange {
                player_id: player,
                reason: reason.clone(),
            });
        }
    }

    /// Applies a committed group edit.
    ///
    /// Edits in the default group's lineage reach players without memberships,
    /// who are not in the reverse index, so every cached entry is dropped and
    /// every known player is notified.
    pub fn group_changed(&self, change: &GroupChange, reason: ChangeReason) {
        if change.invalidate_everything {
            self.cache.invalidate_everything();
            let mut players: HashSet<Uuid> = self.registry.tracked_players().into_iter().collect();
            players.extend(self.cache.cached_players());
            players.extend(change.affected_players.iter().copied());
            debug!(group_id = %change.group_id, players = players.len(), "Default lineage changed");
            self.players_changed(players, reason);
        } else {
            self.players_changed(change.affected_players.iter().copied(), reason);
        }
    }

    /// Drops a player's cached state without notifying, e.g. on disconnect.
    pub fn evict(&self, player: Uuid) {
        self.cache.invalidate(player);
        self.registry.forget_player(player);
    }

    fn notify(&self, change: &PermissionChange) {
        let listeners: Vec<ChangeListener> = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(change))).is_err() {
                error!(player = %change.player_id, "Change listener panicked");
            }
        }
    }
}

impl std::fmt::Debug for ConsistencyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsistencyManager")
            .field("listeners", &self.listener_count())
            .field("in_flight", &self.notifications.len())
            .finish()
    }
}
