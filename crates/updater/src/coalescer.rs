//! Keyed FIFO where a newer entry replaces the queued one for the same key.

use std::collections::VecDeque;

use rustc_hash::{FxHashMap, FxHashSet};

/// At most one pending value per key plus a set of keys currently being worked on. A key that
/// is in flight stays queued until [`Coalescer::finish`] is called for it.
pub struct Coalescer<V> {
    pending: FxHashMap<String, V>,
    order: VecDeque<String>,
    in_flight: FxHashSet<String>,
    coalesced: u64,
}

impl<V> Default for Coalescer<V> {
    fn default() -> Self {
        Self { pending: FxHashMap::default(), order: VecDeque::new(), in_flight: FxHashSet::default(), coalesced: 0 }
    }
}

impl<V> Coalescer<V> {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.pending.len() }
    pub fn is_empty(&self) -> bool { self.pending.is_empty() }
    pub fn in_flight(&self) -> usize { self.in_flight.len() }
    pub fn coalesced(&self) -> u64 { self.coalesced }

    pub fn is_pending(&self, key: &str) -> bool { self.pending.contains_key(key) }
    pub fn is_in_flight(&self, key: &str) -> bool { self.in_flight.contains(key) }

    /// Queue `value` for `key`; returns true when it replaced an older pending value.
    pub fn push(&mut self, key: &str, value: V) -> bool {
        if self.pending.insert(key.to_string(), value).is_some() {
            self.coalesced += 1;
            return true;
        }
        self.order.push_back(key.to_string());
        false
    }

    /// Take the oldest pending entry whose key is not in flight and mark it in flight.
    pub fn pop_ready(&mut self) -> Option<(String, V)> {
        let idx = self.order.iter().position(|k| !self.in_flight.contains(k))?;
        let key = self.order.remove(idx)?;
        let value = self.pending.remove(&key)?;
        self.in_flight.insert(key.clone());
        Some((key, value))
    }

    /// Take the pending value for an in-flight `key` so its worker can carry it forward; the value
    /// it replaces counts as coalesced.
    pub fn take_pending(&mut self, key: &str) -> Option<V> {
        let value = self.pending.remove(key)?;
        self.order.retain(|k| k != key);
        self.coalesced += 1;
        Some(value)
    }

    pub fn finish(&mut self, key: &str) { self.in_flight.remove(key); }

    /// Drop everything that has not started; returns how many entries were dropped.
    pub fn clear_pending(&mut self) -> usize {
        let n = self.pending.len();
        self.pending.clear();
        self.order.clear();
        n
    }

    pub fn is_idle(&self) -> bool { self.pending.is_empty() && self.in_flight.is_empty() }
}
