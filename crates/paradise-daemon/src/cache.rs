//! Fixed-capacity LRU cache shared between the player core and fetch tasks.
//!
//! Recency is a monotonically increasing tick per entry; `order` maps ticks
//! back to keys so the oldest entry is the first one in the map.  `get` and
//! `put` refresh recency; `contains` is a pure peek so in-flight bookkeeping
//! does not reorder anything.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};

struct Inner<K, V> {
    capacity: usize,
    tick: u64,
    entries: HashMap<K, (V, u64)>,
    order: BTreeMap<u64, K>,
}

impl<K: Eq + Hash + Clone, V> Inner<K, V> {
    fn touch(&mut self, key: &K) {
        self.tick += 1;
        let tick = self.tick;
        if let Some((_, old)) = self.entries.get_mut(key) {
            self.order.remove(old);
            *old = tick;
            self.order.insert(tick, key.clone());
        }
    }
}

pub struct BoundedCache<K, V> {
    inner: Mutex<Inner<K, V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> BoundedCache<K, V> {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                capacity: capacity.max(1),
                tick: 0,
                entries: HashMap::new(),
                order: BTreeMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K, V>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns a clone of the value and marks the entry most recently used.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.lock();
        let value = inner.entries.get(key).map(|(v, _)| v.clone())?;
        inner.touch(key);
        Some(value)
    }

    /// Inserts or replaces, then evicts least-recently-used entries down to
    /// capacity.
    pub fn put(&self, key: K, value: V) {
        let mut inner = self.lock();
        inner.tick += 1;
        let tick = inner.tick;
        if let Some((_, old)) = inner.entries.insert(key.clone(), (value, tick)) {
            inner.order.remove(&old);
        }
        inner.order.insert(tick, key);

        while inner.entries.len() > inner.capacity {
            let Some((_, oldest)) = inner.order.pop_first() else {
                break;
            };
            inner.entries.remove(&oldest);
        }
    }

    /// Membership test that leaves recency untouched.
    pub fn contains(&self, key: &K) -> bool {
        self.lock().entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
