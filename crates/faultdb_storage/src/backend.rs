//! The backend trait.

use crate::error::StorageResult;

/// An append-only byte store.
///
/// # Invariants
///
/// - `append` returns the offset at which `data` begins
/// - bytes returned by `read_at` for an already-appended range never change
///   until `truncate` or `replace` is called
/// - after `sync` returns, every appended byte survives process exit
pub trait StorageBackend: Send + Sync {
    /// Reads exactly `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::ReadPastEnd`] if the range is not fully
    /// inside the store, or an I/O error.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends `data` and returns the offset where it starts.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn append(&self, data: &[u8]) -> StorageResult<u64>;

    /// Pushes buffered writes to the operating system.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    fn flush(&self) -> StorageResult<()>;

    /// Flushes data and metadata to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    fn sync(&self) -> StorageResult<()>;

    /// Returns the number of bytes currently stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Drops every byte at or after `new_size`.
    ///
    /// Used to cut a torn frame off the journal tail during recovery.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::InvalidTruncate`] when `new_size` is
    /// larger than the store.
    fn truncate(&self, new_size: u64) -> StorageResult<()>;

    /// Atomically swaps the whole content for `data`.
    ///
    /// Used by journal compaction. Readers either see the old content or the
    /// new one, never a mix.
    ///
    /// # Errors
    ///
    /// Returns an error if the new content cannot be made durable.
    fn replace(&self, data: &[u8]) -> StorageResult<()>;
}
