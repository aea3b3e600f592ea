//! Wall-clock lifetimes and the containers built on them.
//!
//! [`ExpirableMap`] is the single lifetime authority in the server: every
//! read-style access first removes entries whose expiry has passed, firing the
//! registered eviction hook once per removal. There is no background sweeper;
//! expiry is observed lazily on access, which suffices because every operation
//! that cares about an entry touches its map first.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Duration as TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// An absolute wall-clock deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Expiry {
    at: DateTime<Utc>,
}

impl Expiry {
    /// Deadline a duration from now.
    pub fn from_ttl(ttl: std::time::Duration) -> Self {
        let ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX);
        Self {
            at: Utc::now() + ttl,
        }
    }

    /// Deadline at an explicit instant.
    pub fn at(deadline: DateTime<Utc>) -> Self {
        Self { at: deadline }
    }

    /// The absolute deadline.
    pub fn deadline(&self) -> DateTime<Utc> {
        self.at
    }

    /// Remaining time to live; negative once the deadline has passed.
    pub fn ttl(&self) -> TimeDelta {
        self.at - Utc::now()
    }

    pub fn is_expired(&self) -> bool {
        self.ttl() <= TimeDelta::zero()
    }

    /// The later of two deadlines.
    pub fn later_of(self, other: Self) -> Self {
        if other.at > self.at { other } else { self }
    }
}

/// Values stored in an [`ExpirableMap`] expose the expiry that governs them.
pub trait HasExpiry {
    fn expiry(&self) -> Expiry;
}

/// Hook fired once per evicted entry, with the removed key and value.
pub type EvictionHook<K, V> = Box<dyn FnMut(&K, &V) + Send>;

/// A `BTreeMap` whose entries carry a TTL, swept lazily on every read-style
/// access.
///
/// [`sweep`](Self::sweep) returns the removed pairs so the owner can run
/// stateful side effects that the in-map hook (which only borrows the map)
/// cannot.
pub struct ExpirableMap<K, V> {
    items: BTreeMap<K, V>,
    on_evict: Option<EvictionHook<K, V>>,
}

impl<K, V> ExpirableMap<K, V>
where
    K: Ord + Clone,
    V: HasExpiry,
{
    pub fn new() -> Self {
        Self {
            items: BTreeMap::new(),
            on_evict: None,
        }
    }

    pub fn with_eviction_hook(hook: EvictionHook<K, V>) -> Self {
        Self {
            items: BTreeMap::new(),
            on_evict: Some(hook),
        }
    }

    /// Remove all expired entries, firing the eviction hook for each, and
    /// return the removed pairs in key order.
    pub fn sweep(&mut self) -> Vec<(K, V)> {
        let expired: Vec<K> = self
            .items
            .iter()
            .filter(|(_, value)| value.expiry().is_expired())
            .map(|(key, _)| key.clone())
            .collect();

        let mut removed = Vec::with_capacity(expired.len());
        for key in expired {
            if let Some(value) = self.items.remove(&key) {
                if let Some(hook) = self.on_evict.as_mut() {
                    hook(&key, &value);
                }
                removed.push((key, value));
            }
        }
        removed
    }

    /// Insert an entry, returning the previous live value for the key.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.items
            .insert(key, value)
            .filter(|prev| !prev.expiry().is_expired())
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.sweep();
        self.items.get(key)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.sweep();
        self.items.get_mut(key)
    }

    pub fn contains_key(&mut self, key: &K) -> bool {
        self.sweep();
        self.items.contains_key(key)
    }

    /// Remove an entry; expired entries are swept (and hooked) first, so a
    /// dead value is never handed back.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.sweep();
        self.items.remove(key)
    }

    pub fn len(&mut self) -> usize {
        self.sweep();
        self.items.len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    pub fn iter(&mut self) -> impl Iterator<Item = (&K, &V)> {
        self.sweep();
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&K, &mut V)> {
        self.sweep();
        self.items.iter_mut()
    }

    pub fn keys(&mut self) -> impl Iterator<Item = &K> {
        self.sweep();
        self.items.keys()
    }

    pub fn values(&mut self) -> impl Iterator<Item = &V> {
        self.sweep();
        self.items.values()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.sweep();
        self.items.values_mut()
    }

    /// Entry-style access: get the live value for `key`, or insert the value
    /// produced by `default` and return it.
    pub fn get_or_insert_with(&mut self, key: K, default: impl FnOnce() -> V) -> &mut V {
        self.sweep();
        self.items.entry(key).or_insert_with(default)
    }
}

impl<K, V> Default for ExpirableMap<K, V>
where
    K: Ord + Clone,
    V: HasExpiry,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> std::fmt::Debug for ExpirableMap<K, V>
where
    K: std::fmt::Debug,
    V: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpirableMap")
            .field("items", &self.items)
            .field("has_eviction_hook", &self.on_evict.is_some())
            .finish()
    }
}

/// Fixed-capacity FIFO that overwrites its oldest element when full.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    /// # Panics
    /// Panics if `capacity` is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an item, dropping the oldest when at capacity.
    pub fn push(&mut self, item: T) {
        if self.items.len() == self.capacity {
            let _oldest = self.items.pop_front();
        }
        self.items.push_back(item);
    }

    /// Drain all buffered items in insertion order.
    pub fn flush(&mut self) -> Vec<T> {
        self.items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
