//! Single-file backend.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// A backend over one OS file.
///
/// The file is opened twice: one handle is reserved for the appending
/// writer, the other serves reads. A reader positioned on committed bytes
/// therefore never waits for an append that is still in progress.
///
/// # Durability
///
/// - `flush()` hands buffered bytes to the OS
/// - `sync()` calls `File::sync_all()`
/// - `replace()` writes a sibling `.tmp` file, syncs it and renames it over
///   the original
///
/// ```no_run
/// use faultdb_storage::{FileBackend, StorageBackend};
/// use std::path::Path;
///
/// let backend = FileBackend::open(Path::new("rows.log")).unwrap();
/// backend.append(b"frame").unwrap();
/// backend.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    writer: Mutex<File>,
    reader: Mutex<File>,
    size: AtomicU64,
}

impl FileBackend {
    /// Opens `path`, creating an empty file if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let (writer, reader) = Self::open_handles(path)?;
        let size = writer.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            size: AtomicU64::new(size),
        })
    }

    /// Like [`FileBackend::open`], creating missing parent directories first.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory or the file cannot be created.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Self::open(path)
    }

    /// Returns the path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_handles(path: &Path) -> StorageResult<(File, File)> {
        let writer = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let reader = OpenOptions::new().read(true).open(path)?;
        Ok((writer, reader))
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let size = self.size.load(Ordering::Acquire);
        if offset.saturating_add(len as u64) > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }
        if len == 0 {
            return Ok(Vec::new());
        }

        let mut reader = self.reader.lock();
        reader.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn append(&self, data: &[u8]) -> StorageResult<u64> {
        let mut writer = self.writer.lock();
        let offset = self.size.load(Ordering::Acquire);
        if data.is_empty() {
            return Ok(offset);
        }
        writer.seek(SeekFrom::Start(offset))?;
        writer.write_all(data)?;
        // Publish the new end only after the bytes are written.
        self.size.store(offset + data.len() as u64, Ordering::Release);
        Ok(offset)
    }

    fn flush(&self) -> StorageResult<()> {
        self.writer.lock().flush()?;
        Ok(())
    }

    fn sync(&self) -> StorageResult<()> {
        let mut writer = self.writer.lock();
        writer.flush()?;
        writer.sync_all()?;
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.size.load(Ordering::Acquire))
    }

    fn truncate(&self, new_size: u64) -> StorageResult<()> {
        let writer = self.writer.lock();
        let size = self.size.load(Ordering::Acquire);
        if new_size > size {
            return Err(StorageError::InvalidTruncate {
                requested: new_size,
                size,
            });
        }
        writer.set_len(new_size)?;
        self.size.store(new_size, Ordering::Release);
        writer.sync_all()?;
        Ok(())
    }

    fn replace(&self, data: &[u8]) -> StorageResult<()> {
        let mut writer = self.writer.lock();
        let mut reader = self.reader.lock();

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(data)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        let (new_writer, new_reader) = Self::open_handles(&self.path)?;
        *writer = new_writer;
        *reader = new_reader;
        self.size.store(data.len() as u64, Ordering::Release);
        Ok(())
    }
}
