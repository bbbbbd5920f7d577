//! Per-collection document cache with pinning and idle eviction.
//!
//! Entries are kept in recency order so the idle sweep walks from the least
//! recently used end and stops at the first entry that is still fresh.
//! Pins are counted per id, separately from the entries themselves: an entry
//! that is deleted and later re-cached while a result set still tracks it
//! keeps its pins.

use crate::error::{Result, SyncError};
use crate::types::{DocId, Document};
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

struct CacheEntry {
    doc: Document,
    last_access: Instant,
}

struct CacheState {
    entries: LruCache<DocId, CacheEntry>,
    pins: HashMap<DocId, usize>,
}

/// Hit/miss accounting for one collection's cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Percentage of lookups served from the cache.
    pub hit_ratio: f64,
    pub entries: usize,
    pub pinned: usize,
}

/// Keyed cache of full documents.
pub struct DocumentCache {
    state: Mutex<CacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
    timeout: Duration,
    max_entries: Option<usize>,
}

impl DocumentCache {
    pub fn new(timeout: Duration, max_entries: Option<usize>) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: LruCache::unbounded(),
                pins: HashMap::new(),
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            timeout,
            max_entries,
        }
    }

    /// Cache a document under its `_id`.
    pub fn set(&self, doc: Document) -> Result<()> {
        let id = DocId::of(&doc).ok_or_else(|| {
            SyncError::InvalidOperation("cannot cache a document without a scalar _id".to_string())
        })?;
        let mut state = self.state.lock();
        state.entries.put(
            id,
            CacheEntry {
                doc,
                last_access: Instant::now(),
            },
        );
        if let Some(max) = self.max_entries {
            Self::evict_over_capacity(&mut state, max);
        }
        Ok(())
    }

    /// Copy of a cached document, refreshing its last access.
    pub fn get(&self, id: &DocId) -> Option<Document> {
        let mut state = self.state.lock();
        match state.entries.get_mut(id) {
            Some(entry) => {
                entry.last_access = Instant::now();
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.doc.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn has(&self, id: &DocId) -> bool {
        let mut state = self.state.lock();
        match state.entries.get_mut(id) {
            Some(entry) => {
                entry.last_access = Instant::now();
                self.hits.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn delete(&self, id: &DocId) {
        self.state.lock().entries.pop(id);
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.state.lock().entries.clear();
    }

    /// Drop entries matching a predicate. Returns how many were dropped.
    pub fn clear_matching(&self, predicate: impl Fn(&Document) -> bool) -> usize {
        let mut state = self.state.lock();
        let doomed: Vec<DocId> = state
            .entries
            .iter()
            .filter(|(_, entry)| predicate(&entry.doc))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &doomed {
            state.entries.pop(id);
        }
        doomed.len()
    }

    /// Drop every entry no result set or watcher holds a pin on.
    pub fn clear_unpinned(&self) -> usize {
        let mut state = self.state.lock();
        let CacheState { entries, pins } = &mut *state;
        let doomed: Vec<DocId> = entries
            .iter()
            .filter(|(id, _)| !pins.contains_key(*id))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &doomed {
            entries.pop(id);
        }
        doomed.len()
    }

    /// First cached document matching a predicate.
    ///
    /// Scans the live entries and copies only the match.
    pub fn find(&self, predicate: impl Fn(&Document) -> bool) -> Option<Document> {
        let mut state = self.state.lock();
        let found = state
            .entries
            .iter()
            .find(|(_, entry)| predicate(&entry.doc))
            .map(|(id, _)| id.clone());
        match found {
            Some(id) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                let entry = state.entries.get_mut(&id)?;
                entry.last_access = Instant::now();
                Some(entry.doc.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Merge freshly fetched documents: cached entries win, the rest are cached.
    ///
    /// Returns the effective documents in input order.
    pub fn merge_docs(&self, fetched: Vec<Document>) -> Vec<Document> {
        let mut merged = Vec::with_capacity(fetched.len());
        for doc in fetched {
            let Some(id) = DocId::of(&doc) else {
                continue;
            };
            if let Some(cached) = self.get(&id) {
                merged.push(cached);
                continue;
            }
            if let Err(e) = self.set(doc.clone()) {
                tracing::warn!(error = %e, "skipping uncachable document");
            }
            merged.push(doc);
        }
        merged
    }

    pub fn pin(&self, id: &DocId) {
        *self.state.lock().pins.entry(id.clone()).or_insert(0) += 1;
    }

    pub fn unpin(&self, id: &DocId) {
        let mut state = self.state.lock();
        if let Some(count) = state.pins.get_mut(id) {
            *count -= 1;
            if *count == 0 {
                state.pins.remove(id);
            }
        }
    }

    pub fn pin_count(&self, id: &DocId) -> usize {
        self.state.lock().pins.get(id).copied().unwrap_or(0)
    }

    /// Evict unpinned entries idle for longer than the timeout.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Sweep as if the current time were `now`.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut state = self.state.lock();
        let mut expired = Vec::new();
        // Least recently used first.
        for (id, entry) in state.entries.iter().rev() {
            if now.saturating_duration_since(entry.last_access) <= self.timeout {
                break;
            }
            if !state.pins.contains_key(id) {
                expired.push(id.clone());
            }
        }
        for id in &expired {
            state.entries.pop(id);
        }
        if !expired.is_empty() {
            tracing::debug!(evicted = expired.len(), "cache sweep");
        }
        expired.len()
    }

    fn evict_over_capacity(state: &mut CacheState, max: usize) {
        while state.entries.len() > max {
            let victim = state
                .entries
                .iter()
                .rev()
                .find(|(id, _)| !state.pins.contains_key(*id))
                .map(|(id, _)| id.clone());
            match victim {
                Some(id) => {
                    state.entries.pop(&id);
                }
                // Everything left is pinned.
                None => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let state = self.state.lock();
        CacheStats {
            hits,
            misses,
            hit_ratio: if total == 0 {
                0.0
            } else {
                hits as f64 * 100.0 / total as f64
            },
            entries: state.entries.len(),
            pinned: state.pins.len(),
        }
    }
}
