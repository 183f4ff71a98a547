//! Short-lived memo of identification outcomes, keyed by owner and image content.

use recall_core::ContentSignature;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::engine::Identification;

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub owner_id: String,
    pub signature: ContentSignature,
}

impl CacheKey {
    pub fn new(owner_id: &str, signature: ContentSignature) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            signature,
        }
    }
}

struct Entry {
    value: Identification,
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<CacheKey, Entry>,
    /// Bumped on every invalidation of an owner.
    generations: HashMap<String, u64>,
}

impl Inner {
    fn generation(&self, owner_id: &str) -> u64 {
        self.generations.get(owner_id).copied().unwrap_or(0)
    }
}

pub struct ResultCache {
    ttl: Duration,
    capacity: usize,
    inner: Mutex<Inner>,
}

impl ResultCache {
    pub fn new(ttl: Duration) -> Self {
        Self::with_capacity(ttl, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Current invalidation generation for `owner_id`.
    ///
    /// Capture it before reading the owner's registry and hand it to
    /// [`put_if_current`](Self::put_if_current) with the result.
    pub fn generation(&self, owner_id: &str) -> u64 {
        self.lock().generation(owner_id)
    }

    /// Cached outcome, if present and not yet expired.
    pub fn get(&self, key: &CacheKey) -> Option<Identification> {
        let mut inner = self.lock();
        let entries = &mut inner.entries;
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: CacheKey, value: Identification) {
        self.put_with_ttl(key, value, self.ttl);
    }

    pub fn put_with_ttl(&self, key: CacheKey, value: Identification, ttl: Duration) {
        let mut inner = self.lock();
        Self::insert(&mut inner, self.capacity, key, value, ttl);
    }

    /// Store `value` unless the owner was invalidated since `generation` was taken.
    ///
    /// Returns whether the value was stored.
    pub fn put_if_current(&self, key: CacheKey, value: Identification, generation: u64) -> bool {
        let mut inner = self.lock();
        if inner.generation(&key.owner_id) != generation {
            tracing::debug!(owner = %key.owner_id, "registry changed during identification, result not cached");
            return false;
        }
        Self::insert(&mut inner, self.capacity, key, value, self.ttl);
        true
    }

    fn insert(inner: &mut Inner, capacity: usize, key: CacheKey, value: Identification, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let now = Instant::now();
        let entries = &mut inner.entries;

        if entries.len() >= capacity && !entries.contains_key(&key) {
            entries.retain(|_, e| e.expires_at > now);
            if entries.len() >= capacity {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, e)| e.expires_at)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    entries.remove(&oldest);
                }
            }
        }

        entries.insert(
            key,
            Entry {
                value,
                expires_at: now + ttl,
            },
        );
    }

    /// Drop every entry for `owner_id`. Called whenever the owner's registry changes.
    ///
    /// Also advances the owner's generation, so results computed against the
    /// old registry are refused by [`put_if_current`](Self::put_if_current).
    pub fn invalidate_owner(&self, owner_id: &str) -> usize {
        let mut inner = self.lock();
        *inner.generations.entry(owner_id.to_string()).or_insert(0) += 1;
        let before = inner.entries.len();
        inner.entries.retain(|k, _| k.owner_id != owner_id);
        let removed = before - inner.entries.len();
        if removed > 0 {
            tracing::debug!(owner = owner_id, removed, "result cache invalidated");
        }
        removed
    }

    /// Remove expired entries. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, e| e.expires_at > now);
        before - inner.entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
