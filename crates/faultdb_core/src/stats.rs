//! Engine statistics.
//!
//! Counters distinguish the three cost tiers of object access: row cache
//! hits (cheap), relationship id resolution (moderate) and backing store
//! queries (expensive).
//!
//! # Usage
//!
//! ```rust,ignore
//! let before = coordinator.stats();
//! context.prefetch(&handles)?;
//! let after = coordinator.stats();
//! assert_eq!(after.store_queries - before.store_queries, 1);
//! ```

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Engine statistics.
///
/// All counters are atomic and can be read while operations are in progress.
/// Values only ever increase.
#[derive(Debug, Default)]
pub struct EngineStats {
    // Backing store
    store_queries: AtomicU64,
    rows_read: AtomicU64,
    rows_written: AtomicU64,
    bytes_written: AtomicU64,

    // Row cache
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_stale: AtomicU64,
    cache_evictions: AtomicU64,

    // Handles
    faults_fulfilled: AtomicU64,
    relationship_faults: AtomicU64,

    // Saves
    saves: AtomicU64,
    saves_failed: AtomicU64,
    conflicts: AtomicU64,
    conflicts_resolved: AtomicU64,
    notifications: AtomicU64,
}

impl EngineStats {
    /// Creates a new stats instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one backing store query returning `rows` rows.
    pub(crate) fn record_store_query(&self, rows: u64) {
        self.store_queries.fetch_add(1, Ordering::Relaxed);
        self.rows_read.fetch_add(rows, Ordering::Relaxed);
    }

    /// Records a committed frame.
    pub(crate) fn record_commit(&self, rows: u64, bytes: u64) {
        self.saves.fetch_add(1, Ordering::Relaxed);
        self.rows_written.fetch_add(rows, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records a save that did not commit.
    pub(crate) fn record_save_failure(&self) {
        self.saves_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_stale(&self) {
        self.cache_stale.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_evictions(&self, count: u64) {
        self.cache_evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_fault_fulfilled(&self) {
        self.faults_fulfilled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_relationship_fault(&self) {
        self.relationship_faults.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a detected conflict and whether the policy resolved it.
    pub(crate) fn record_conflict(&self, resolved: bool) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
        if resolved {
            self.conflicts_resolved.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_notification(&self) {
        self.notifications.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of backing store queries so far.
    pub fn store_queries(&self) -> u64 {
        self.store_queries.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all stats.
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            store_queries: load(&self.store_queries),
            rows_read: load(&self.rows_read),
            rows_written: load(&self.rows_written),
            bytes_written: load(&self.bytes_written),
            cache_hits: load(&self.cache_hits),
            cache_misses: load(&self.cache_misses),
            cache_stale: load(&self.cache_stale),
            cache_evictions: load(&self.cache_evictions),
            faults_fulfilled: load(&self.faults_fulfilled),
            relationship_faults: load(&self.relationship_faults),
            saves: load(&self.saves),
            saves_failed: load(&self.saves_failed),
            conflicts: load(&self.conflicts),
            conflicts_resolved: load(&self.conflicts_resolved),
            notifications: load(&self.notifications),
        }
    }
}

/// A point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
    /// Backing store queries issued.
    pub store_queries: u64,
    /// Rows returned by those queries.
    pub rows_read: u64,
    /// Rows written by commits.
    pub rows_written: u64,
    /// Journal bytes written.
    pub bytes_written: u64,
    /// Row cache lookups served from memory.
    pub cache_hits: u64,
    /// Row cache lookups that missed.
    pub cache_misses: u64,
    /// Cached rows rejected as stale.
    pub cache_stale: u64,
    /// Rows evicted to stay under the ceiling.
    pub cache_evictions: u64,
    /// Faults turned into materialized handles.
    pub faults_fulfilled: u64,
    /// Relationship faults resolved to identifiers.
    pub relationship_faults: u64,
    /// Committed saves.
    pub saves: u64,
    /// Saves rejected by validation, conflicts or I/O.
    pub saves_failed: u64,
    /// Conflicts detected.
    pub conflicts: u64,
    /// Conflicts the merge policy resolved.
    pub conflicts_resolved: u64,
    /// Save notifications emitted.
    pub notifications: u64,
}
