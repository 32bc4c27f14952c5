//! Periodic sweep of timed memberships.
//!
//! A cached set records the earliest expiry among the memberships it was built
//! from. Once that instant passes the cache stops serving the set, but nothing
//! would tell the host until the player's next check. The sweeper finds those
//! sets, purges the expired rows, and fires the change hook so a timed rank
//! visibly ends on time.
//!
//! The same tick prunes the reverse index of players nobody has resolved
//! recently.

use std::sync::Arc;
use std::time::Duration;

use rankguard_storage::PermissionStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::consistency::ChangeReason;
use crate::service::Inner;

impl<S: PermissionStore + ?Sized> Inner<S> {
    /// Sweeps every cached set whose expiry bound has passed. Returns the number
    /// of players swept.
    pub(crate) async fn sweep_expired(&self) -> usize {
        let players = self.cache.expired_players();
        if players.is_empty() {
            return 0;
        }
        let now = self.clock.now();

        for player in &players {
            let player = *player;
            let purged = match self
                .storage_call("purge_expired_memberships", || {
                    self.store.purge_expired_memberships(player, now)
                })
                .await
            {
                Ok(groups) if groups.is_empty() => {
                    // A concurrent load purged and reported them
                    self.cache.invalidate(player);
                    continue;
                }
                Ok(groups) => groups,
                Err(e) => {
                    // The stale set is still dropped; the next load filters
                    // expired memberships on its own.
                    warn!(player = %player, error = %e, "Failed to purge expired memberships");
                    Vec::new()
                }
            };
            for group_id in &purged {
                self.registry.remove_holder(player, group_id);
            }
            debug!(player = %player, purged = ?purged, "Membership expired");
            self.consistency.player_changed(
                player,
                ChangeReason::MembershipExpired { group_ids: purged },
            );
        }

        info!(players = players.len(), "Swept expired memberships");
        players.len()
    }

    /// Forgets tracked players that have no cached set and no pending load.
    ///
    /// Runs under the registry writer so no group edit computes its affected
    /// players halfway through. Each pruned player's epoch is bumped after it is
    /// forgotten, so a load that tracked it earlier cannot cache a set the index
    /// no longer covers.
    pub(crate) async fn prune_idle_players(&self) -> usize {
        let _writer = self.registry.write().await;
        let mut pruned = 0;
        for player in self.registry.tracked_players() {
            if self.cache.contains(player) || self.loads.is_in_flight(&player) {
                continue;
            }
            self.registry.forget_player(player);
            self.cache.invalidate(player);
            pruned += 1;
        }
        if pruned > 0 {
            debug!(players = pruned, "Pruned idle players from the reverse index");
        }
        pruned
    }
}

/// Runs [`Inner::sweep_expired`] and [`Inner::prune_idle_players`] every
/// `period` until shutdown is signalled.
pub(crate) fn spawn_sweeper<S: PermissionStore + ?Sized>(
    inner: Arc<Inner<S>>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    inner.sweep_expired().await;
                    inner.prune_idle_players().await;
                }
            }
        }
        debug!("Expiry sweeper stopped");
    })
}
