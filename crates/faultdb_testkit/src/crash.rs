//! Crash recovery testing for faultdb.
//!
//! Simulates crashes while the journal is being written and checks that a
//! reopened store holds exactly the commits that completed.
//!
//! ## Test Strategy
//!
//! 1. **Torn tail** - cut a captured journal at every byte offset and reopen
//! 2. **Crash during append** - let a backend accept only part of a frame
//! 3. **Failed sync** - make the commit fail after the bytes were written
//!
//! ## Usage
//!
//! ```rust,ignore
//! use faultdb_testkit::crash::CrashRecoveryHarness;
//!
//! let harness = CrashRecoveryHarness::with_commits(5);
//! for result in harness.cut_at_every_offset() {
//!     assert!(result.passed, "{result:?}");
//! }
//! ```

use crate::fixtures::{insert_country, world_model};
use faultdb_core::{Config, FetchRequest, StoreCoordinator};
use faultdb_storage::{InMemoryBackend, StorageBackend, StorageError, StorageResult};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Result of a crash recovery check.
#[derive(Debug, Clone)]
pub struct CrashRecoveryResult {
    /// Whether the check passed.
    pub passed: bool,
    /// Description of what was checked.
    pub description: String,
    /// Countries expected after recovery.
    pub expected_rows: usize,
    /// Countries found after recovery.
    pub actual_rows: usize,
    /// Any error message.
    pub error: Option<String>,
}

impl CrashRecoveryResult {
    fn compare(description: String, expected: usize, actual: usize) -> Self {
        Self {
            passed: expected == actual,
            description,
            expected_rows: expected,
            actual_rows: actual,
            error: None,
        }
    }

    fn failed(description: String, expected: usize, error: &str) -> Self {
        Self {
            passed: false,
            description,
            expected_rows: expected,
            actual_rows: 0,
            error: Some(error.to_string()),
        }
    }
}

/// A storage backend wrapper that can simulate crashes.
///
/// Wraps a shared [`InMemoryBackend`], so the test keeps access to the bytes
/// after handing the backend to a coordinator.
#[derive(Debug)]
pub struct CrashableBackend {
    inner: Arc<InMemoryBackend>,
    crash_after_bytes: AtomicUsize,
    bytes_written: AtomicUsize,
    crashed: AtomicBool,
    fail_on_sync: AtomicBool,
}

impl CrashableBackend {
    /// Creates a crashable backend over `inner`.
    pub fn new(inner: Arc<InMemoryBackend>) -> Self {
        Self {
            inner,
            crash_after_bytes: AtomicUsize::new(usize::MAX),
            bytes_written: AtomicUsize::new(0),
            crashed: AtomicBool::new(false),
            fail_on_sync: AtomicBool::new(false),
        }
    }

    /// Crashes once `bytes` more bytes have been appended. The append that
    /// crosses the limit writes only the bytes below it.
    pub fn crash_after(&self, bytes: usize) {
        self.bytes_written.store(0, Ordering::SeqCst);
        self.crash_after_bytes.store(bytes, Ordering::SeqCst);
    }

    /// Sets whether sync should fail.
    pub fn set_fail_on_sync(&self, fail: bool) {
        self.fail_on_sync.store(fail, Ordering::SeqCst);
    }

    /// Returns true once a simulated crash happened.
    pub fn has_crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    /// The wrapped backend.
    pub fn inner(&self) -> &Arc<InMemoryBackend> {
        &self.inner
    }

    fn crash_error() -> StorageError {
        StorageError::Io(io::Error::new(io::ErrorKind::Other, "simulated crash"))
    }
}

impl StorageBackend for CrashableBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn append(&self, data: &[u8]) -> StorageResult<u64> {
        if self.has_crashed() {
            return Err(Self::crash_error());
        }
        let limit = self.crash_after_bytes.load(Ordering::SeqCst);
        let written = self.bytes_written.fetch_add(data.len(), Ordering::SeqCst);
        if written + data.len() > limit {
            let keep = limit.saturating_sub(written);
            if keep > 0 {
                self.inner.append(&data[..keep])?;
            }
            self.crashed.store(true, Ordering::SeqCst);
            return Err(Self::crash_error());
        }
        self.inner.append(data)
    }

    fn flush(&self) -> StorageResult<()> {
        self.inner.flush()
    }

    fn sync(&self) -> StorageResult<()> {
        if self.fail_on_sync.load(Ordering::SeqCst) {
            return Err(Self::crash_error());
        }
        self.inner.sync()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn truncate(&self, new_size: u64) -> StorageResult<()> {
        self.inner.truncate(new_size)
    }

    fn replace(&self, data: &[u8]) -> StorageResult<()> {
        self.inner.replace(data)
    }
}

/// Opens a coordinator over a copy of `journal` and counts its countries.
///
/// # Errors
///
/// Returns the open or fetch error as text.
pub fn recovered_country_count(journal: Vec<u8>) -> Result<usize, String> {
    let backend = InMemoryBackend::with_data(journal);
    let coordinator =
        StoreCoordinator::open_with_backend(Box::new(backend), world_model(), Config::default())
            .map_err(|e| e.to_string())?;
    let context = coordinator.new_context();
    context
        .count(&FetchRequest::new("Country"))
        .map_err(|e| e.to_string())
}

/// Builds a journal of single-country commits and replays damaged copies.
pub struct CrashRecoveryHarness {
    journal: Vec<u8>,
    /// Journal length after each commit; entry `i` holds `i + 1` countries.
    boundaries: Vec<usize>,
    /// Journal length before the first country commit.
    base: usize,
}

impl CrashRecoveryHarness {
    /// Commits `commits` countries, one per save, into a fresh journal.
    pub fn with_commits(commits: usize) -> Self {
        let backend = Arc::new(InMemoryBackend::new());
        let coordinator = StoreCoordinator::open_with_backend(
            Box::new(CrashableBackend::new(Arc::clone(&backend))),
            world_model(),
            Config::default(),
        )
        .expect("Failed to open store");
        let base = backend.data().len();
        let context = coordinator.new_context();
        let mut boundaries = Vec::with_capacity(commits);
        for i in 0..commits {
            let code = i64::try_from(i % 999 + 1).expect("code fits");
            insert_country(&context, &format!("Country {i}"), code);
            context.save().expect("Failed to save");
            boundaries.push(backend.data().len());
        }
        Self {
            journal: backend.data(),
            boundaries,
            base,
        }
    }

    /// The captured journal.
    pub fn journal(&self) -> &[u8] {
        &self.journal
    }

    /// Countries that survive a cut at `offset`.
    pub fn expected_at(&self, offset: usize) -> usize {
        self.boundaries.iter().filter(|end| **end <= offset).count()
    }

    /// Reopens the journal cut at `offset`.
    pub fn cut_at(&self, offset: usize) -> CrashRecoveryResult {
        let expected = self.expected_at(offset);
        let description = format!("journal cut at byte {offset}");
        match recovered_country_count(self.journal[..offset].to_vec()) {
            Ok(actual) => CrashRecoveryResult::compare(description, expected, actual),
            Err(e) => CrashRecoveryResult::failed(description, expected, &e),
        }
    }

    /// Reopens the journal cut at every offset past the initial frames.
    pub fn cut_at_every_offset(&self) -> Vec<CrashRecoveryResult> {
        (self.base..=self.journal.len())
            .map(|offset| self.cut_at(offset))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_torn_tail_recovers_the_complete_prefix() {
        let harness = CrashRecoveryHarness::with_commits(3);
        for result in harness.cut_at_every_offset() {
            assert!(result.passed, "{result:?}");
        }
    }

    #[test]
    fn crash_during_append_keeps_earlier_commits() {
        let memory = Arc::new(InMemoryBackend::new());
        let backend = Arc::new(CrashableBackend::new(Arc::clone(&memory)));
        let coordinator = StoreCoordinator::open_with_backend(
            Box::new(SharedCrashable(Arc::clone(&backend))),
            world_model(),
            Config::default(),
        )
        .unwrap();
        let context = coordinator.new_context();
        insert_country(&context, "France", 250);
        context.save().unwrap();

        backend.crash_after(10);
        insert_country(&context, "Peru", 604);
        assert!(context.save().is_err());
        assert!(backend.has_crashed());
        assert!(context.has_changes().unwrap());

        assert_eq!(recovered_country_count(memory.data()).unwrap(), 1);
    }

    #[test]
    fn failed_sync_publishes_nothing() {
        let memory = Arc::new(InMemoryBackend::new());
        let backend = Arc::new(CrashableBackend::new(Arc::clone(&memory)));
        let coordinator = StoreCoordinator::open_with_backend(
            Box::new(SharedCrashable(Arc::clone(&backend))),
            world_model(),
            Config::default(),
        )
        .unwrap();
        let context = coordinator.new_context();
        insert_country(&context, "France", 250);
        backend.set_fail_on_sync(true);
        assert!(context.save().is_err());
        assert_eq!(coordinator.stats().saves_failed, 1);

        backend.set_fail_on_sync(false);
        context.save().unwrap();
        assert_eq!(recovered_country_count(memory.data()).unwrap(), 1);
    }

    /// Lets a test keep its own handle on the crashable backend.
    #[derive(Debug)]
    struct SharedCrashable(Arc<CrashableBackend>);

    impl StorageBackend for SharedCrashable {
        fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
            self.0.read_at(offset, len)
        }
        fn append(&self, data: &[u8]) -> StorageResult<u64> {
            self.0.append(data)
        }
        fn flush(&self) -> StorageResult<()> {
            self.0.flush()
        }
        fn sync(&self) -> StorageResult<()> {
            self.0.sync()
        }
        fn size(&self) -> StorageResult<u64> {
            self.0.size()
        }
        fn truncate(&self, new_size: u64) -> StorageResult<()> {
            self.0.truncate(new_size)
        }
        fn replace(&self, data: &[u8]) -> StorageResult<()> {
            self.0.replace(data)
        }
    }
}
