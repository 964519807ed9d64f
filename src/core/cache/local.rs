use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Which tier an entry was filled from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Local,
    Remote,
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub source_tier: Tier,
    pub inserted_at: Instant,
    pub ttl: Duration,
    seq: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) >= self.ttl
    }
}

/// Bounded, TTL-based process-local tier.
///
/// Eviction is insertion order: once `capacity` is reached the oldest write
/// goes first. Entries may disappear at any time; callers treat a miss as normal.
#[derive(Debug)]
pub struct LocalTier {
    capacity: usize,
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, CacheEntry>,
    // (seq, key) in insertion order; stale pairs are skipped on eviction
    order: VecDeque<(u64, String)>,
    next_seq: u64,
}

impl LocalTier {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.get_at(key, Instant::now())
    }

    pub(crate) fn get_at(&self, key: &str, now: Instant) -> Option<Vec<u8>> {
        self.inner.lock().lookup(key, now)
    }

    /// Look up several keys under one lock; result is aligned with `keys`
    pub fn get_many(&self, keys: &[String]) -> Vec<Option<Vec<u8>>> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        keys.iter().map(|key| inner.lookup(key, now)).collect()
    }

    pub fn insert(&self, key: &str, value: Vec<u8>, ttl: Duration, source_tier: Tier) {
        self.insert_at(key, value, ttl, source_tier, Instant::now());
    }

    pub(crate) fn insert_at(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
        source_tier: Tier,
        now: Instant,
    ) {
        if ttl.is_zero() {
            return;
        }

        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;

        inner.entries.insert(
            key.to_string(),
            CacheEntry {
                key: key.to_string(),
                value,
                source_tier,
                inserted_at: now,
                ttl,
                seq,
            },
        );
        inner.order.push_back((seq, key.to_string()));

        while inner.entries.len() > self.capacity {
            let Some((seq, key)) = inner.order.pop_front() else {
                break;
            };
            if inner.entries.get(&key).map(|e| e.seq) == Some(seq) {
                inner.entries.remove(&key);
            }
        }

        // Overwrites leave stale order pairs behind; compact before they pile up
        if inner.order.len() > self.capacity.saturating_mul(2) {
            let Inner { entries, order, .. } = &mut *inner;
            order.retain(|(seq, key)| entries.get(key).map(|e| e.seq) == Some(*seq));
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        self.inner.lock().entries.remove(key).is_some()
    }

    pub fn entry(&self, key: &str) -> Option<CacheEntry> {
        self.inner.lock().entries.get(key).cloned()
    }
}

impl Inner {
    fn lookup(&mut self, key: &str, now: Instant) -> Option<Vec<u8>> {
        let expired = self.entries.get(key)?.is_expired(now);
        if expired {
            self.entries.remove(key);
            return None;
        }
        self.entries.get(key).map(|entry| entry.value.clone())
    }
}
