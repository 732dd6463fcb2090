//! Stress tests for faultdb.
//!
//! These drivers run many contexts against one coordinator at once and
//! report throughput and failures.

use crate::fixtures::insert_country;
use faultdb_core::{
    CoreError, EntityHandle, Faultable, FetchRequest, PropertyLocalWins, StatsSnapshot,
    StoreCoordinator,
};
use serde::Serialize;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress test run.
#[derive(Debug, Clone, Serialize)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Operations rejected by validation or conflicts.
    pub rejected_ops: usize,
    /// Operations that failed for any other reason.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
    /// Engine counters at the end of the run.
    pub stats: StatsSnapshot,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(
        successful: usize,
        rejected: usize,
        failed: usize,
        duration: Duration,
        stats: StatsSnapshot,
    ) -> Self {
        let total = successful + rejected + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            rejected_ops: rejected,
            failed_ops: failed,
            duration,
            ops_per_second,
            stats,
        }
    }

    /// Prints a summary of the run.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {name} ===");
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Rejected: {}", self.rejected_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }

    /// The result as JSON, for collecting runs.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).expect("Stress results serialize")
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Saves per thread.
    pub operations: usize,
    /// Number of concurrent contexts, one per thread.
    pub threads: usize,
    /// Number of distinct countries.
    pub entity_count: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 200,
            threads: 4,
            entity_count: 50,
        }
    }
}

#[derive(Default)]
struct Tally {
    successful: usize,
    rejected: usize,
    failed: usize,
}

impl Tally {
    fn record(&mut self, result: Result<(), CoreError>) {
        match result {
            Ok(()) => self.successful += 1,
            Err(e) if e.is_recoverable() => self.rejected += 1,
            Err(_) => self.failed += 1,
        }
    }

    fn merge(&mut self, other: Tally) {
        self.successful += other.successful;
        self.rejected += other.rejected;
        self.failed += other.failed;
    }
}

/// Commits `config.entity_count` countries and returns their handles' ids.
fn seed(coordinator: &Arc<StoreCoordinator>, config: &StressConfig) -> Vec<faultdb_core::ObjectId> {
    let context = coordinator.new_context();
    let handles: Vec<EntityHandle> = (0..config.entity_count)
        .map(|i| {
            let code = i64::try_from(i % 999 + 1).expect("code fits");
            insert_country(&context, &format!("Country {i}"), code)
        })
        .collect();
    context.save().expect("Failed to seed countries");
    handles.iter().map(EntityHandle::id).collect()
}

/// Every thread repeatedly edits overlapping countries and saves, merging
/// the other threads' saves as they arrive.
pub fn stress_concurrent_saves(
    coordinator: &Arc<StoreCoordinator>,
    config: &StressConfig,
) -> StressTestResult {
    let ids = Arc::new(seed(coordinator, config));
    let start = Instant::now();

    let workers: Vec<_> = (0..config.threads)
        .map(|t| {
            let coordinator = Arc::clone(coordinator);
            let ids = Arc::clone(&ids);
            let operations = config.operations;
            thread::spawn(move || {
                let notes = coordinator.subscribe();
                let context = coordinator.new_context();
                context
                    .set_merge_policy(Arc::new(PropertyLocalWins))
                    .expect("Context is on this thread");
                let mut tally = Tally::default();
                for op in 0..operations {
                    for note in notes.try_iter() {
                        let _ = context.merge_external_save(&note);
                    }
                    let id = ids[(t * 7 + op) % ids.len()];
                    let result = context.existing_object(id).and_then(|country| {
                        let motto = format!("thread {t} op {op}");
                        country.set("motto", motto.as_str())?;
                        context.save()
                    });
                    if result.is_err() {
                        let _ = context.rollback();
                    }
                    tally.record(result);
                }
                tally
            })
        })
        .collect();

    let mut tally = Tally::default();
    for worker in workers {
        tally.merge(worker.join().expect("Stress worker panicked"));
    }
    StressTestResult::new(
        tally.successful,
        tally.rejected,
        tally.failed,
        start.elapsed(),
        coordinator.stats(),
    )
}

/// Every thread fetches all countries as faults and fires each one.
pub fn stress_fault_storm(
    coordinator: &Arc<StoreCoordinator>,
    config: &StressConfig,
) -> StressTestResult {
    seed(coordinator, config);
    let start = Instant::now();

    let workers: Vec<_> = (0..config.threads)
        .map(|_| {
            let coordinator = Arc::clone(coordinator);
            let operations = config.operations;
            thread::spawn(move || {
                let mut tally = Tally::default();
                for _ in 0..operations {
                    let context = coordinator.new_context();
                    let result = context
                        .fetch(&FetchRequest::new("Country"))
                        .and_then(|countries| {
                            countries.iter().try_for_each(|c| c.ensure_materialized())
                        });
                    tally.record(result);
                }
                tally
            })
        })
        .collect();

    let mut tally = Tally::default();
    for worker in workers {
        tally.merge(worker.join().expect("Stress worker panicked"));
    }
    StressTestResult::new(
        tally.successful,
        tally.rejected,
        tally.failed,
        start.elapsed(),
        coordinator.stats(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::TestStore;

    fn small() -> StressConfig {
        StressConfig {
            operations: 20,
            threads: 3,
            entity_count: 5,
        }
    }

    #[test]
    fn concurrent_saves_never_fail_hard() {
        let store = TestStore::memory();
        let result = stress_concurrent_saves(&store, &small());
        assert_eq!(result.failed_ops, 0, "{}", result.to_json());
        assert_eq!(result.total_ops, 60);
        assert!(result.successful_ops > 0);
    }

    #[test]
    fn fault_storm_is_served_from_the_cache() {
        let store = TestStore::memory();
        let result = stress_fault_storm(&store, &small());
        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.stats.faults_fulfilled, 3 * 20 * 5);
        assert!(result.stats.cache_hits >= 3 * 20 * 5);
    }
}
