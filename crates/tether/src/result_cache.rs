//
// result_cache.rs
//
// Async memoize-once cache with in-flight collapsing
//

use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;

/// Result of one computation.
///
/// `Cached` outcomes are stored for later callers; `Transient` outcomes are
/// handed to the callers already waiting on this computation and then
/// forgotten, so the next call computes again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<V> {
    Cached(Option<V>),
    Transient(Option<V>),
}

type Published<V> = Option<Option<V>>;

enum Slot<V> {
    Ready(Option<V>),
    Pending {
        ticket: u64,
        rx: watch::Receiver<Published<V>>,
    },
}

impl<V> Slot<V> {
    fn is_pending(&self, ticket: u64) -> bool {
        matches!(self, Slot::Pending { ticket: t, .. } if *t == ticket)
    }
}

enum Claim<V> {
    Hit(Option<V>),
    Wait(u64, watch::Receiver<Published<V>>),
    Lead(u64, watch::Sender<Published<V>>),
}

/// Mapping from key to an optional outcome.
///
/// A missing key means "not yet computed"; a present `None` means "computed,
/// unknown". Concurrent callers for the same key share a single in-flight
/// computation, stored as a pending slot in the map itself.
pub struct ResultCache<K, V> {
    slots: DashMap<K, Slot<V>>,
    next_ticket: AtomicU64,
}

impl<K: Eq + Hash, V> std::fmt::Debug for ResultCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("slots", &self.slots.len())
            .finish_non_exhaustive()
    }
}

impl<K, V> Default for ResultCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Removes the leader's pending slot if the computation never completes
/// (cancelled or panicked), so waiters can elect a new leader.
struct PendingGuard<'a, K: Eq + Hash, V> {
    slots: &'a DashMap<K, Slot<V>>,
    key: &'a K,
    ticket: u64,
    armed: bool,
}

impl<K: Eq + Hash, V> Drop for PendingGuard<'_, K, V> {
    fn drop(&mut self) {
        if self.armed {
            let ticket = self.ticket;
            self.slots.remove_if(self.key, |_, slot| slot.is_pending(ticket));
        }
    }
}

impl<K, V> ResultCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            next_ticket: AtomicU64::new(0),
        }
    }

    /// Return the cached outcome for `key`, or run `compute` exactly once
    /// across all concurrent callers and share its result.
    pub async fn get_or_compute<F, Fut>(&self, key: &K, compute: F) -> Option<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome<V>>,
    {
        let (ticket, tx) = loop {
            match self.claim(key) {
                Claim::Hit(value) => return value,
                Claim::Wait(ticket, rx) => {
                    if let Some(value) = Self::wait(rx).await {
                        return value;
                    }
                    // Leader went away without publishing; clear its slot and retry.
                    self.slots.remove_if(key, |_, slot| slot.is_pending(ticket));
                }
                Claim::Lead(ticket, tx) => break (ticket, tx),
            }
        };

        let mut guard = PendingGuard {
            slots: &self.slots,
            key,
            ticket,
            armed: true,
        };

        let (value, keep) = match compute().await {
            Outcome::Cached(value) => (value, true),
            Outcome::Transient(value) => (value, false),
        };

        if keep {
            if let Some(mut slot) = self.slots.get_mut(key) {
                if slot.is_pending(ticket) {
                    *slot = Slot::Ready(value.clone());
                }
            }
        } else {
            self.slots.remove_if(key, |_, slot| slot.is_pending(ticket));
        }
        guard.armed = false;

        tx.send_replace(Some(value.clone()));
        value
    }

    fn claim(&self, key: &K) -> Claim<V> {
        match self.slots.entry(key.clone()) {
            Entry::Occupied(entry) => match entry.get() {
                Slot::Ready(value) => Claim::Hit(value.clone()),
                Slot::Pending { ticket, rx } => Claim::Wait(*ticket, rx.clone()),
            },
            Entry::Vacant(entry) => {
                let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = watch::channel(None);
                entry.insert(Slot::Pending { ticket, rx });
                Claim::Lead(ticket, tx)
            }
        }
    }

    /// `None` when the leader dropped without publishing.
    async fn wait(mut rx: watch::Receiver<Published<V>>) -> Published<V> {
        loop {
            if let Some(value) = rx.borrow_and_update().clone() {
                return Some(value);
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone();
            }
        }
    }

    /// Completed outcome for `key`, ignoring in-flight computations.
    pub fn cached(&self, key: &K) -> Option<Option<V>> {
        match self.slots.get(key)?.value() {
            Slot::Ready(value) => Some(value.clone()),
            Slot::Pending { .. } => None,
        }
    }

    /// Whether `key` has a completed or in-flight entry.
    pub fn contains(&self, key: &K) -> bool {
        self.slots.contains_key(key)
    }

    /// Remove the entry for `key`.
    ///
    /// An in-flight computation is detached: its callers still receive the
    /// result, but it is not stored. Returns the removed outcome (`Some(None)`
    /// for an in-flight entry), or `None` if nothing was present.
    pub fn invalidate(&self, key: &K) -> Option<Option<V>> {
        let (_, slot) = self.slots.remove(key)?;
        Some(match slot {
            Slot::Ready(value) => value,
            Slot::Pending { .. } => None,
        })
    }

    /// Remove the entry for `key` only if it is completed.
    pub fn take_ready(&self, key: &K) -> Option<Option<V>> {
        self.take_ready_if(key, |_| true)
    }

    /// Remove the entry for `key` only if it is completed and `matches` its outcome.
    pub fn take_ready_if(&self, key: &K, matches: impl FnOnce(&Option<V>) -> bool) -> Option<Option<V>> {
        let removed = self.slots.remove_if(key, |_, slot| match slot {
            Slot::Ready(value) => matches(value),
            Slot::Pending { .. } => false,
        });
        match removed? {
            (_, Slot::Ready(value)) => Some(value),
            (_, Slot::Pending { .. }) => None,
        }
    }

    /// Remove every entry whose key matches, completed or in flight.
    pub fn invalidate_where(&self, mut matches: impl FnMut(&K) -> bool) -> Vec<(K, Option<V>)> {
        let keys: Vec<K> = self
            .slots
            .iter()
            .filter(|entry| matches(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        keys.into_iter()
            .filter_map(|key| {
                let value = self.invalidate(&key)?;
                Some((key, value))
            })
            .collect()
    }

    /// Keep the entries matching `keep`, which sees the outcome of completed
    /// entries and `None` for in-flight ones. Dropped in-flight entries are
    /// detached like [`ResultCache::invalidate`] does.
    pub fn retain(&self, mut keep: impl FnMut(&K, Option<&Option<V>>) -> bool) {
        self.slots.retain(|key, slot| match slot {
            Slot::Ready(value) => keep(key, Some(value)),
            Slot::Pending { .. } => keep(key, None),
        });
    }

    /// Keys with an in-flight computation.
    pub fn pending_keys(&self) -> Vec<K> {
        self.slots
            .iter()
            .filter(|entry| matches!(entry.value(), Slot::Pending { .. }))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Snapshot of completed entries.
    pub fn ready_entries(&self) -> Vec<(K, Option<V>)> {
        self.slots
            .iter()
            .filter_map(|entry| match entry.value() {
                Slot::Ready(value) => Some((entry.key().clone(), value.clone())),
                Slot::Pending { .. } => None,
            })
            .collect()
    }

    /// Remove everything, returning the completed entries.
    pub fn drain(&self) -> Vec<(K, Option<V>)> {
        let entries = self.ready_entries();
        self.slots.clear();
        entries
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
