//! In-memory backend.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

/// A backend that keeps every byte in a `Vec<u8>`.
///
/// Suitable for tests and throwaway stores. It can be told to fail writes,
/// which lets callers exercise the I/O error path without a real disk.
///
/// # Example
///
/// ```rust
/// use faultdb_storage::{InMemoryBackend, StorageBackend};
///
/// let backend = InMemoryBackend::new();
/// backend.append(b"abc").unwrap();
/// assert_eq!(backend.size().unwrap(), 3);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    data: RwLock<Vec<u8>>,
    fail_writes: AtomicBool,
}

impl InMemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend pre-loaded with `data`.
    ///
    /// Handy for replaying a captured journal in recovery tests.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Returns a copy of the stored bytes.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// Makes every subsequent write fail with an I/O error (or stop failing).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::Other,
                "injected write failure",
            )));
        }
        Ok(())
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let data = self.data.read();
        let size = data.len() as u64;
        let end = offset.saturating_add(len as u64);
        if end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }
        let start = offset as usize;
        Ok(data[start..start + len].to_vec())
    }

    fn append(&self, bytes: &[u8]) -> StorageResult<u64> {
        self.check_writable()?;
        let mut data = self.data.write();
        let offset = data.len() as u64;
        data.extend_from_slice(bytes);
        Ok(offset)
    }

    fn flush(&self) -> StorageResult<()> {
        self.check_writable()
    }

    fn sync(&self) -> StorageResult<()> {
        self.check_writable()
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn truncate(&self, new_size: u64) -> StorageResult<()> {
        let mut data = self.data.write();
        let size = data.len() as u64;
        if new_size > size {
            return Err(StorageError::InvalidTruncate {
                requested: new_size,
                size,
            });
        }
        data.truncate(new_size as usize);
        Ok(())
    }

    fn replace(&self, bytes: &[u8]) -> StorageResult<()> {
        self.check_writable()?;
        *self.data.write() = bytes.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_report_their_start_offset() {
        let backend = InMemoryBackend::new();
        assert_eq!(backend.append(b"head").unwrap(), 0);
        assert_eq!(backend.append(b"tail").unwrap(), 4);
        assert_eq!(backend.size().unwrap(), 8);
        assert_eq!(backend.read_at(4, 4).unwrap(), b"tail");
    }

    #[test]
    fn read_past_end_is_rejected() {
        let backend = InMemoryBackend::with_data(b"short".to_vec());
        assert!(matches!(
            backend.read_at(3, 10),
            Err(StorageError::ReadPastEnd { size: 5, .. })
        ));
        assert!(backend.read_at(5, 0).unwrap().is_empty());
    }

    #[test]
    fn truncate_cannot_grow() {
        let backend = InMemoryBackend::with_data(b"0123456789".to_vec());
        backend.truncate(4).unwrap();
        assert_eq!(backend.data(), b"0123");
        assert!(matches!(
            backend.truncate(40),
            Err(StorageError::InvalidTruncate { requested: 40, size: 4 })
        ));
    }

    #[test]
    fn replace_swaps_content() {
        let backend = InMemoryBackend::with_data(b"old content".to_vec());
        backend.replace(b"new").unwrap();
        assert_eq!(backend.data(), b"new");
    }

    #[test]
    fn injected_failures_block_writes_but_not_reads() {
        let backend = InMemoryBackend::with_data(b"kept".to_vec());
        backend.set_fail_writes(true);
        assert!(matches!(backend.append(b"x"), Err(StorageError::Io(_))));
        assert!(backend.sync().is_err());
        assert_eq!(backend.read_at(0, 4).unwrap(), b"kept");

        backend.set_fail_writes(false);
        assert_eq!(backend.append(b"x").unwrap(), 4);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn appends_read_back_at_their_offsets(
                chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..64), 1..16),
            ) {
                let backend = InMemoryBackend::new();
                let offsets: Vec<u64> = chunks
                    .iter()
                    .map(|chunk| backend.append(chunk).unwrap())
                    .collect();
                for (offset, chunk) in offsets.iter().zip(&chunks) {
                    prop_assert_eq!(&backend.read_at(*offset, chunk.len()).unwrap(), chunk);
                }
                let total: usize = chunks.iter().map(Vec::len).sum();
                prop_assert_eq!(backend.size().unwrap(), total as u64);
            }
        }
    }
}
