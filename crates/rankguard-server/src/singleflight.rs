//! Singleflight for deduplicating concurrent work keyed by player.
//!
//! Used twice: background profile loads (followers may block on the leader's
//! result from a non-async thread), and change notifications (followers are
//! simply collapsed into the leader).
//!
//! Load flights carry the cache generation they were started at. A caller that
//! observed a newer generation never joins an older flight, since that flight
//! may have read storage before the mutation that bumped the generation.

use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::SyncSender;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::AbortHandle;

/// Identifies one flight so a finished or cancelled flight never removes a
/// newer flight registered under the same key.
pub type FlightId = u64;

struct Flight<V> {
    id: FlightId,
    generation: u64,
    waiters: Vec<SyncSender<V>>,
    task: Option<AbortHandle>,
}

/// Result of trying to acquire a singleflight slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SingleflightSlot {
    /// We won the race and should execute the operation.
    Leader(FlightId),
    /// Another task is executing; its result will reach our waiter, if any.
    Follower,
}

/// Map of in-flight operations to the callers waiting on them.
///
/// Check-and-insert goes through DashMap's entry API, so two callers can never
/// both become leader for the same key.
pub struct Singleflight<K, V>
where
    K: Hash + Eq + Clone,
{
    in_flight: DashMap<K, Flight<V>>,
    next_id: AtomicU64,
}

impl<K, V> Singleflight<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            in_flight: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Atomically joins the flight for `key`, or starts one.
    ///
    /// `waiter` receives the leader's result when it completes.
    pub fn acquire(&self, key: K, waiter: Option<SyncSender<V>>) -> SingleflightSlot {
        self.acquire_at(key, 0, waiter)
    }

    /// Like [`acquire`](Self::acquire), for a caller that observed `generation`.
    ///
    /// A flight started at an older generation is superseded: its task is
    /// aborted and its waiters move to the new flight, whose leader the caller
    /// becomes.
    pub fn acquire_at(
        &self,
        key: K,
        generation: u64,
        waiter: Option<SyncSender<V>>,
    ) -> SingleflightSlot {
        match self.in_flight.entry(key) {
            Entry::Occupied(mut entry) if entry.get().generation >= generation => {
                entry.get_mut().waiters.extend(waiter);
                SingleflightSlot::Follower
            }
            Entry::Occupied(mut entry) => {
                let id = self.next_id();
                let stale = entry.get_mut();
                if let Some(task) = stale.task.take() {
                    task.abort();
                }
                let mut waiters = std::mem::take(&mut stale.waiters);
                waiters.extend(waiter);
                entry.insert(Flight {
                    id,
                    generation,
                    waiters,
                    task: None,
                });
                SingleflightSlot::Leader(id)
            }
            Entry::Vacant(entry) => {
                let id = self.next_id();
                entry.insert(Flight {
                    id,
                    generation,
                    waiters: waiter.into_iter().collect(),
                    task: None,
                });
                SingleflightSlot::Leader(id)
            }
        }
    }

    /// Attaches the leader's task so [`cancel`](Self::cancel) can abort it.
    ///
    /// If the flight is already gone (cancelled before the task was attached),
    /// the task is aborted right away.
    pub fn attach(&self, key: &K, id: FlightId, task: AbortHandle) {
        match self.in_flight.get_mut(key) {
            Some(mut flight) if flight.id == id => flight.task = Some(task),
            _ => task.abort(),
        }
    }

    /// Ends a flight and hands `value` to every waiter.
    ///
    /// Returns false if the flight was cancelled or replaced in the meantime.
    pub fn complete(&self, key: &K, id: FlightId, value: V) -> bool {
        match self.in_flight.remove_if(key, |_, flight| flight.id == id) {
            Some((_, flight)) => {
                for waiter in flight.waiters {
                    // A waiter that timed out has dropped its receiver
                    let _ = waiter.try_send(value.clone());
                }
                true
            }
            None => false,
        }
    }

    /// Ends a flight without a result. Waiters observe a disconnect.
    fn abandon(&self, key: &K, id: FlightId) {
        self.in_flight.remove_if(key, |_, flight| flight.id == id);
    }

    /// Cancels the flight for `key`, aborting its task. Returns whether one existed.
    pub fn cancel(&self, key: &K) -> bool {
        match self.in_flight.remove(key) {
            Some((_, flight)) => {
                if let Some(task) = flight.task {
                    task.abort();
                }
                true
            }
            None => false,
        }
    }

    /// Cancels every flight.
    pub fn cancel_all(&self) {
        let keys: Vec<K> = self.in_flight.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.cancel(&key);
        }
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.in_flight.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    fn next_id(&self) -> FlightId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl<K, V> Default for Singleflight<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that ensures singleflight cleanup on drop.
///
/// Covers the leader panicking and the leader's task being aborted.
pub struct SingleflightGuard<'a, K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    singleflight: &'a Singleflight<K, V>,
    key: K,
    id: FlightId,
    completed: bool,
}

impl<'a, K, V> SingleflightGuard<'a, K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new(singleflight: &'a Singleflight<K, V>, key: K, id: FlightId) -> Self {
        Self {
            singleflight,
            key,
            id,
            completed: false,
        }
    }

    /// Completes the flight with `value` (normal path).
    pub fn complete(mut self, value: V) -> bool {
        self.completed = true;
        self.singleflight.complete(&self.key, self.id, value)
    }
}

impl<K, V> Drop for SingleflightGuard<'_, K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn drop(&mut self) {
        if !self.completed {
            self.singleflight.abandon(&self.key, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::{sync_channel, RecvTimeoutError};
    use std::time::Duration;

    #[test]
    fn test_first_caller_leads_and_others_follow() {
        let flights: Singleflight<u32, &'static str> = Singleflight::new();

        let first = flights.acquire(7, None);
        let second = flights.acquire(7, None);
        let other_key = flights.acquire(8, None);

        assert!(matches!(first, SingleflightSlot::Leader(_)));
        assert_eq!(second, SingleflightSlot::Follower);
        assert!(matches!(other_key, SingleflightSlot::Leader(_)));
        assert_eq!(flights.len(), 2);
    }

    #[test]
    fn test_complete_delivers_result_to_every_waiter() {
        // Arrange
        let flights: Singleflight<u32, &'static str> = Singleflight::new();
        let (tx1, rx1) = sync_channel(1);
        let (tx2, rx2) = sync_channel(1);
        let SingleflightSlot::Leader(id) = flights.acquire(7, Some(tx1)) else {
            panic!("expected leader");
        };
        flights.acquire(7, Some(tx2));

        // Act
        assert!(flights.complete(&7, id, "done"));

        // Assert
        assert_eq!(rx1.recv_timeout(Duration::from_secs(1)), Ok("done"));
        assert_eq!(rx2.recv_timeout(Duration::from_secs(1)), Ok("done"));
        assert!(!flights.is_in_flight(&7));
    }

    #[test]
    fn test_stale_completion_does_not_end_newer_flight() {
        let flights: Singleflight<u32, ()> = Singleflight::new();
        let SingleflightSlot::Leader(old) = flights.acquire(7, None) else {
            panic!("expected leader");
        };
        assert!(flights.cancel(&7));
        let SingleflightSlot::Leader(new) = flights.acquire(7, None) else {
            panic!("expected leader");
        };

        assert!(!flights.complete(&7, old, ()));
        assert!(flights.is_in_flight(&7));
        assert!(flights.complete(&7, new, ()));
    }

    #[test]
    fn test_guard_drop_disconnects_waiters() {
        let flights: Singleflight<u32, ()> = Singleflight::new();
        let (tx, rx) = sync_channel(1);
        let SingleflightSlot::Leader(id) = flights.acquire(7, Some(tx)) else {
            panic!("expected leader");
        };

        drop(SingleflightGuard::new(&flights, 7, id));

        assert!(flights.is_empty());
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(10)),
            Err(RecvTimeoutError::Disconnected)
        );
    }

    #[tokio::test]
    async fn test_cancel_aborts_attached_task() {
        let flights: Singleflight<u32, ()> = Singleflight::new();
        let SingleflightSlot::Leader(id) = flights.acquire(7, None) else {
            panic!("expected leader");
        };
        let task = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        flights.attach(&7, id, task.abort_handle());

        assert!(flights.cancel(&7));

        assert!(task.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_newer_generation_supersedes_older_flight() {
        // Arrange: a flight started at generation 1 with one waiter
        let flights: Singleflight<u32, &'static str> = Singleflight::new();
        let (early_tx, early_rx) = sync_channel(1);
        let (late_tx, late_rx) = sync_channel(1);
        let SingleflightSlot::Leader(old) = flights.acquire_at(7, 1, Some(early_tx)) else {
            panic!("expected leader");
        };
        let task = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        flights.attach(&7, old, task.abort_handle());

        // Act
        let slot = flights.acquire_at(7, 2, Some(late_tx));

        // Assert: the caller leads a new flight that keeps the earlier waiter
        let SingleflightSlot::Leader(new) = slot else {
            panic!("expected the newer caller to lead");
        };
        assert_ne!(old, new);
        assert!(task.await.unwrap_err().is_cancelled());
        assert!(!flights.complete(&7, old, "stale"));
        assert!(flights.complete(&7, new, "fresh"));
        assert_eq!(early_rx.recv_timeout(Duration::from_secs(1)), Ok("fresh"));
        assert_eq!(late_rx.recv_timeout(Duration::from_secs(1)), Ok("fresh"));
    }

    #[test]
    fn test_same_or_older_generation_joins_existing_flight() {
        let flights: Singleflight<u32, ()> = Singleflight::new();
        assert!(matches!(
            flights.acquire_at(7, 5, None),
            SingleflightSlot::Leader(_)
        ));

        assert_eq!(flights.acquire_at(7, 5, None), SingleflightSlot::Follower);
        assert_eq!(flights.acquire_at(7, 3, None), SingleflightSlot::Follower);
        assert_eq!(flights.len(), 1);
    }
}
