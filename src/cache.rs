//! Bounded LRU cache of resolved redirect URLs with a per-entry TTL.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use crate::storage::models::VariantKind;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub file_uid: String,
    pub variant: Option<VariantKind>,
    /// Signed URLs embed the response disposition, so attachment and inline
    /// URLs are cached separately.
    pub attachment: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedRedirect {
    pub url: String,
    pub content_type: String,
}

struct Entry {
    value: CachedRedirect,
    expires_at: Instant,
    stamp: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<CacheKey, Entry>,
    /// Recency order: lowest stamp is least recently used.
    order: BTreeMap<u64, CacheKey>,
    tick: u64,
}

impl Inner {
    fn next_stamp(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn remove(&mut self, key: &CacheKey) -> Option<Entry> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.stamp);
        Some(entry)
    }
}

/// Thread-safe; every operation runs under one lock so eviction and insertion
/// are atomic with respect to lookups.
pub struct RedirectCache {
    max_entries: usize,
    ttl: Duration,
    inner: Mutex<Inner>,
}

impl RedirectCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            max_entries,
            ttl,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Poisoning is ignored: a panicked holder leaves at worst one stale entry.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Look up a live entry and mark it most recently used.
    pub fn get(&self, key: &CacheKey) -> Option<CachedRedirect> {
        let mut inner = self.lock();
        let now = Instant::now();

        let expired = inner.entries.get(key)?.expires_at <= now;
        if expired {
            inner.remove(key);
            return None;
        }

        let stamp = inner.next_stamp();
        let entry = inner.entries.get_mut(key)?;
        let old = std::mem::replace(&mut entry.stamp, stamp);
        let value = entry.value.clone();
        inner.order.remove(&old);
        inner.order.insert(stamp, key.clone());
        Some(value)
    }

    pub fn insert(&self, key: CacheKey, value: CachedRedirect) {
        if self.max_entries == 0 {
            return;
        }
        let mut inner = self.lock();
        let now = Instant::now();

        inner.remove(&key);
        let stamp = inner.next_stamp();
        inner.order.insert(stamp, key.clone());
        inner.entries.insert(
            key,
            Entry {
                value,
                expires_at: now + self.ttl,
                stamp,
            },
        );

        while inner.entries.len() > self.max_entries {
            let Some((_, oldest)) = inner.order.pop_first() else {
                break;
            };
            inner.entries.remove(&oldest);
        }
    }

    /// Drop every entry for a file, whatever the variant or disposition.
    pub fn invalidate_file(&self, file_uid: &str) {
        let mut inner = self.lock();
        let keys: Vec<CacheKey> = inner
            .entries
            .keys()
            .filter(|k| k.file_uid == file_uid)
            .cloned()
            .collect();
        for key in keys {
            inner.remove(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
