//! A bounded, time-expiring key -> item cache whose evictions are enqueued
//! onto a flush queue for periodic draining.
//!
//! Grounded on the same shape as a periodically-flushed `Mutex<HashMap<...>>`
//! accumulator, generalized from "flush only on a ticker" to "evict
//! individual entries on insert/age, flush on demand".

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use chrono::Duration;
use crossbeam_queue::SegQueue;

use crate::clock::Clock;

struct Slot<V> {
    value: V,
    written_at: chrono::DateTime<chrono::Utc>,
}

/// A size-bounded, time-bounded cache of fingerprint -> item with a side
/// output queue. `max_entries <= 0` disables caching entirely: nothing is
/// ever stored, every lookup misses.
pub struct AggregatingCache<K, V> {
    max_entries: usize,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<K, Slot<V>>>,
    flush_queue: SegQueue<V>,
}

impl<K, V> AggregatingCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(max_entries: i64, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_entries: max_entries.max(0) as usize,
            ttl,
            clock,
            entries: Mutex::new(HashMap::new()),
            flush_queue: SegQueue::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_entries > 0
    }

    /// Returns a clone of the cached value plus its last-write timestamp,
    /// sweeping it first if it has aged past the write-TTL.
    pub fn get(&self, key: &K) -> Option<(V, chrono::DateTime<chrono::Utc>)> {
        if !self.is_enabled() {
            return None;
        }
        let now = self.clock.now();
        let mut guard = self.entries.lock().expect("cache mutex poisoned");
        if let Some(slot) = guard.get(key) {
            if now - slot.written_at > self.ttl {
                let slot = guard.remove(key).expect("checked present above");
                self.flush_queue.push(slot.value);
                return None;
            }
        }
        guard.get(key).map(|slot| (slot.value.clone(), slot.written_at))
    }

    /// Mutates an existing entry in place without resetting its write
    /// timestamp (used to merge an operation into a pending aggregate).
    /// Returns `false` if no entry exists for `key`.
    pub fn update_in_place(&self, key: &K, f: impl FnOnce(&mut V)) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let mut guard = self.entries.lock().expect("cache mutex poisoned");
        match guard.get_mut(key) {
            Some(slot) => {
                f(&mut slot.value);
                true
            }
            None => false,
        }
    }

    /// Inserts or replaces the entry for `key`, resetting its write
    /// timestamp to now. If the cache is over its size bound after
    /// insertion, the oldest entry (by write timestamp) is evicted onto the
    /// flush queue.
    pub fn upsert(&self, key: K, value: V) {
        if !self.is_enabled() {
            return;
        }
        let now = self.clock.now();
        let mut guard = self.entries.lock().expect("cache mutex poisoned");
        guard.insert(
            key,
            Slot {
                value,
                written_at: now,
            },
        );

        while guard.len() > self.max_entries {
            let oldest_key = guard
                .iter()
                .min_by_key(|(_, slot)| slot.written_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest_key) = oldest_key {
                if let Some(slot) = guard.remove(&oldest_key) {
                    self.flush_queue.push(slot.value);
                }
            } else {
                break;
            }
        }
    }

    /// Removes `key` unconditionally, pushing its value (if any) onto the
    /// flush queue. Used on shutdown (`clear()`).
    pub fn remove(&self, key: &K) -> Option<V> {
        let mut guard = self.entries.lock().expect("cache mutex poisoned");
        guard.remove(key).map(|slot| slot.value)
    }

    /// Snapshot of all currently cached (key, value) pairs.
    pub fn entries_snapshot(&self) -> Vec<(K, V)> {
        let guard = self.entries.lock().expect("cache mutex poisoned");
        guard
            .iter()
            .map(|(k, slot)| (k.clone(), slot.value.clone()))
            .collect()
    }

    /// Drains and returns everything queued by eviction since the last
    /// flush.
    pub fn flush(&self) -> Vec<V> {
        let mut out = Vec::new();
        while let Some(v) = self.flush_queue.pop() {
            out.push(v);
        }
        out
    }

    /// Invalidates the cache and the output queue, discarding all state.
    pub fn clear(&self) {
        let mut guard = self.entries.lock().expect("cache mutex poisoned");
        guard.clear();
        while self.flush_queue.pop().is_some() {}
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
