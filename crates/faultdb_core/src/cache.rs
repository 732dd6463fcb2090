//! Shared row cache.
//!
//! The cache maps object identifiers to the last committed row seen for them.
//! It is shared by every context of a coordinator and sits on a sharded
//! concurrent map, so lookups from different contexts rarely contend.
//!
//! Entries are pinned while a live entity handle refers to them. Only unpinned
//! entries are evicted, least recently used first, and only once the byte
//! ceiling is exceeded.

use crate::identifier::ObjectId;
use crate::row::Row;
use crate::stats::EngineStats;
use crate::types::VersionToken;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct CacheEntry {
    row: Arc<Row>,
    inserted_at: Instant,
    last_access: u64,
    pins: usize,
    size: usize,
}

/// Identifier-keyed cache of committed rows.
#[derive(Debug)]
pub struct RowCache {
    entries: DashMap<ObjectId, CacheEntry>,
    bytes: AtomicUsize,
    capacity: usize,
    clock: AtomicU64,
    stats: Arc<EngineStats>,
}

impl RowCache {
    /// Creates a cache holding roughly `capacity` bytes of unpinned rows.
    #[must_use]
    pub fn new(capacity: usize, stats: Arc<EngineStats>) -> Self {
        Self {
            entries: DashMap::new(),
            bytes: AtomicUsize::new(0),
            capacity,
            clock: AtomicU64::new(0),
            stats,
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Cached row for `id`, ignoring staleness.
    pub fn get(&self, id: &ObjectId) -> Option<Arc<Row>> {
        self.get_fresh(id, Duration::ZERO)
    }

    /// Cached row for `id` if it is younger than `staleness`.
    ///
    /// A zero interval means entries never go stale. A stale hit counts as a
    /// miss and returns `None`; the entry stays until it is replaced.
    pub fn get_fresh(&self, id: &ObjectId, staleness: Duration) -> Option<Arc<Row>> {
        let now = self.tick();
        match self.entries.get_mut(id) {
            Some(mut entry) => {
                if !staleness.is_zero() && entry.inserted_at.elapsed() > staleness {
                    self.stats.record_cache_stale();
                    return None;
                }
                entry.last_access = now;
                self.stats.record_cache_hit();
                Some(Arc::clone(&entry.row))
            }
            None => {
                self.stats.record_cache_miss();
                None
            }
        }
    }

    /// Version of the cached row, without touching recency or statistics.
    #[must_use]
    pub fn version_of(&self, id: &ObjectId) -> Option<VersionToken> {
        self.entries.get(id).map(|e| e.row.version())
    }

    /// Stores a committed row and returns the cached copy.
    ///
    /// An older version never replaces a newer one; re-putting the same
    /// version only refreshes its insertion time.
    pub fn put(&self, id: ObjectId, row: Row) -> Arc<Row> {
        self.insert(id, row, 0)
    }

    /// Stores a committed row and pins it in one step.
    pub fn put_retained(&self, id: ObjectId, row: Row) -> Arc<Row> {
        self.insert(id, row, 1)
    }

    fn insert(&self, id: ObjectId, row: Row, pins: usize) -> Arc<Row> {
        let now = self.tick();
        let size = row.approx_size();
        let cached = {
            let mut entry = self.entries.entry(id).or_insert_with(|| CacheEntry {
                row: Arc::new(Row::default()),
                inserted_at: Instant::now(),
                last_access: now,
                pins: 0,
                size: 0,
            });
            if entry.size == 0 || row.version() > entry.row.version() {
                self.bytes.fetch_add(size, Ordering::Relaxed);
                self.bytes.fetch_sub(entry.size, Ordering::Relaxed);
                entry.row = Arc::new(row);
                entry.size = size;
                entry.inserted_at = Instant::now();
            } else if row.version() == entry.row.version() {
                entry.inserted_at = Instant::now();
            }
            entry.last_access = now;
            entry.pins += pins;
            Arc::clone(&entry.row)
        };
        self.evict_if_needed();
        cached
    }

    /// Drops the entry for `id`. Pins are discarded with it.
    pub fn invalidate(&self, id: &ObjectId) {
        if let Some((_, entry)) = self.entries.remove(id) {
            self.bytes.fetch_sub(entry.size, Ordering::Relaxed);
        }
    }

    /// Marks `id` as recently used.
    pub fn touch(&self, id: &ObjectId) {
        let now = self.tick();
        if let Some(mut entry) = self.entries.get_mut(id) {
            entry.last_access = now;
        }
    }

    /// Returns true if the entry for `id` was inserted more than `interval`
    /// before `as_of`. Missing entries and a zero interval are never stale.
    #[must_use]
    pub fn is_stale(&self, id: &ObjectId, as_of: Instant, interval: Duration) -> bool {
        if interval.is_zero() {
            return false;
        }
        self.entries
            .get(id)
            .is_some_and(|e| as_of.saturating_duration_since(e.inserted_at) > interval)
    }

    /// Pins the entry for `id` so it cannot be evicted.
    ///
    /// Returns false if nothing is cached for `id`.
    pub fn retain(&self, id: &ObjectId) -> bool {
        match self.entries.get_mut(id) {
            Some(mut entry) => {
                entry.pins += 1;
                true
            }
            None => false,
        }
    }

    /// Releases one pin on `id`.
    pub fn release(&self, id: &ObjectId) {
        let released = match self.entries.get_mut(id) {
            Some(mut entry) => {
                entry.pins = entry.pins.saturating_sub(1);
                entry.pins == 0
            }
            None => false,
        };
        if released {
            self.evict_if_needed();
        }
    }

    /// Number of pins on `id`.
    #[must_use]
    pub fn pins(&self, id: &ObjectId) -> usize {
        self.entries.get(id).map_or(0, |e| e.pins)
    }

    /// Removes unpinned entries older than `interval`. Returns how many went.
    pub fn purge_stale(&self, interval: Duration) -> usize {
        if interval.is_zero() {
            return 0;
        }
        let before = self.entries.len();
        let mut freed = 0;
        self.entries.retain(|_, e| {
            let keep = e.pins > 0 || e.inserted_at.elapsed() <= interval;
            if !keep {
                freed += e.size;
            }
            keep
        });
        self.bytes.fetch_sub(freed, Ordering::Relaxed);
        let purged = before.saturating_sub(self.entries.len());
        self.stats.record_cache_evictions(purged as u64);
        purged
    }

    /// Removes every unpinned entry, as under memory pressure. Returns how
    /// many went.
    pub fn purge_unpinned(&self) -> usize {
        let before = self.entries.len();
        let mut freed = 0;
        self.entries.retain(|_, e| {
            if e.pins > 0 {
                return true;
            }
            freed += e.size;
            false
        });
        self.bytes.fetch_sub(freed, Ordering::Relaxed);
        let purged = before.saturating_sub(self.entries.len());
        self.stats.record_cache_evictions(purged as u64);
        tracing::debug!(purged, "row cache purged");
        purged
    }

    /// Number of cached rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Approximate bytes held.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Returns true if `id` is cached.
    #[must_use]
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.entries.contains_key(id)
    }

    fn evict_if_needed(&self) {
        if self.size_bytes() <= self.capacity {
            return;
        }
        let mut candidates: Vec<(u64, ObjectId, usize)> = self
            .entries
            .iter()
            .filter(|e| e.pins == 0)
            .map(|e| (e.last_access, *e.key(), e.size))
            .collect();
        candidates.sort_unstable_by_key(|(access, _, _)| *access);

        let mut excess = self.size_bytes().saturating_sub(self.capacity);
        let mut evicted = 0u64;
        for (_, id, _) in candidates {
            if excess == 0 {
                break;
            }
            if let Some((_, entry)) = self.entries.remove_if(&id, |_, e| e.pins == 0) {
                self.bytes.fetch_sub(entry.size, Ordering::Relaxed);
                excess = excess.saturating_sub(entry.size);
                evicted += 1;
            }
        }
        if evicted > 0 {
            self.stats.record_cache_evictions(evicted);
            tracing::debug!(evicted, bytes = self.size_bytes(), "row cache evicted entries");
        }
    }
}
