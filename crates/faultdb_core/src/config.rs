//! Engine configuration.

use std::time::Duration;

/// What a property access does when the handle's row is confirmed gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InaccessibleFaultPolicy {
    /// Fail the access with `CoreError::InvalidHandle`.
    #[default]
    Error,
    /// Return type-appropriate empty values and mark the handle deleted.
    TreatAsDeleted,
}

/// Which side wins when an external save touches an attribute the context
/// has also changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeTrump {
    /// Unsaved local values are kept.
    #[default]
    LocalTrumps,
    /// Store values replace unsaved local values.
    StoreTrumps,
}

/// Configuration for opening a store coordinator.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,

    /// Whether to error if the store already exists.
    pub error_if_exists: bool,

    /// Whether to sync the journal on every commit (safer but slower).
    pub sync_on_commit: bool,

    /// Age after which a cached row is no longer trusted (zero = never).
    pub staleness_interval: Duration,

    /// Row cache memory ceiling in bytes.
    pub row_cache_capacity: usize,

    /// Rows per cache-population batch during fetch (0 = one batch).
    pub fetch_batch_size: usize,

    /// Default handling of inaccessible faults for new contexts.
    pub inaccessible_fault_policy: InaccessibleFaultPolicy,

    /// Default external-save merge behaviour for new contexts.
    pub merge_trump: MergeTrump,

    /// Save notifications retained for polling.
    pub notification_history: usize,

    /// Format version to use for new stores.
    pub format_version: (u16, u16),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            error_if_exists: false,
            sync_on_commit: true,
            staleness_interval: Duration::ZERO,
            row_cache_capacity: 64 * 1024 * 1024, // 64 MB
            fetch_batch_size: 0,
            inaccessible_fault_policy: InaccessibleFaultPolicy::Error,
            merge_trump: MergeTrump::LocalTrumps,
            notification_history: 1024,
            format_version: (1, 0),
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the store if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether to error if the store exists.
    #[must_use]
    pub const fn error_if_exists(mut self, value: bool) -> Self {
        self.error_if_exists = value;
        self
    }

    /// Sets whether to sync the journal on every commit.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets the row staleness interval.
    #[must_use]
    pub const fn staleness_interval(mut self, interval: Duration) -> Self {
        self.staleness_interval = interval;
        self
    }

    /// Sets the row cache ceiling in bytes.
    #[must_use]
    pub const fn row_cache_capacity(mut self, bytes: usize) -> Self {
        self.row_cache_capacity = bytes;
        self
    }

    /// Sets the fetch batch size.
    #[must_use]
    pub const fn fetch_batch_size(mut self, rows: usize) -> Self {
        self.fetch_batch_size = rows;
        self
    }

    /// Sets the default inaccessible fault policy.
    #[must_use]
    pub const fn inaccessible_fault_policy(mut self, policy: InaccessibleFaultPolicy) -> Self {
        self.inaccessible_fault_policy = policy;
        self
    }

    /// Sets the default external-save merge behaviour.
    #[must_use]
    pub const fn merge_trump(mut self, trump: MergeTrump) -> Self {
        self.merge_trump = trump;
        self
    }

    /// Sets how many notifications are kept for polling.
    #[must_use]
    pub const fn notification_history(mut self, count: usize) -> Self {
        self.notification_history = count;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert!(config.create_if_missing);
        assert!(!config.error_if_exists);
        assert!(config.sync_on_commit);
        assert_eq!(config.staleness_interval, Duration::ZERO);
        assert_eq!(config.inaccessible_fault_policy, InaccessibleFaultPolicy::Error);
        assert_eq!(config.merge_trump, MergeTrump::LocalTrumps);
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .create_if_missing(false)
            .sync_on_commit(false)
            .row_cache_capacity(1024)
            .staleness_interval(Duration::from_secs(5))
            .inaccessible_fault_policy(InaccessibleFaultPolicy::TreatAsDeleted);

        assert!(!config.create_if_missing);
        assert!(!config.sync_on_commit);
        assert_eq!(config.row_cache_capacity, 1024);
        assert_eq!(config.staleness_interval, Duration::from_secs(5));
        assert_eq!(
            config.inaccessible_fault_policy,
            InaccessibleFaultPolicy::TreatAsDeleted
        );
    }
}
