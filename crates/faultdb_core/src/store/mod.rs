//! The backing store.
//!
//! [`RowStore`] keeps rows in an append-only journal of commit frames and an
//! in-memory index `(kind, key) -> (position, version)` rebuilt at open.
//!
//! One writer at a time appends a frame and then publishes its effects to the
//! index. Readers work through a [`StoreSnapshot`], which holds the index read
//! lock, so they never observe a partially published commit and are only
//! held up for the short publish step, not for the append or sync.

mod frame;

pub use frame::{
    read_frame, CommitFrame, EncodedFrame, FrameRead, JournalOp, RowSpan, CHECKSUM_LEN, FRAME_MAGIC,
    FRAME_VERSION, HEADER_LEN,
};

use crate::dir::StoreDir;
use crate::error::{CoreError, CoreResult};
use crate::manifest::Manifest;
use crate::migration::MigrationMapping;
use crate::query::Predicate;
use crate::row::{Row, RowValues};
use crate::stats::EngineStats;
use crate::types::{KindId, SequenceNumber, StoreId, VersionToken};
use faultdb_codec::from_cbor;
use faultdb_storage::{StorageBackend, StorageError};
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// A row write requested by the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Insert or update a row; the store assigns the next version.
    Put {
        /// Entity kind.
        kind: KindId,
        /// Primary key.
        key: u64,
        /// New values.
        values: RowValues,
    },
    /// Delete a row.
    Delete {
        /// Entity kind.
        kind: KindId,
        /// Primary key.
        key: u64,
    },
}

/// The effect of one write after commit.
#[derive(Debug, Clone, PartialEq)]
pub enum AppliedOp {
    /// A row now exists at this version.
    Put {
        /// Entity kind.
        kind: KindId,
        /// Primary key.
        key: u64,
        /// The committed row.
        row: Row,
    },
    /// A row is gone.
    Delete {
        /// Entity kind.
        kind: KindId,
        /// Primary key.
        key: u64,
    },
}

/// Summary of a committed frame.
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    /// Sequence of the frame.
    pub sequence: SequenceNumber,
    /// Commit time, milliseconds since the epoch.
    pub timestamp: i64,
    /// Applied writes, in request order.
    pub applied: Vec<AppliedOp>,
    /// Frame size in bytes.
    pub bytes: u64,
}

/// Result of a compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionStats {
    /// Journal size before.
    pub bytes_before: u64,
    /// Journal size after.
    pub bytes_after: u64,
    /// Live rows kept.
    pub rows: usize,
}

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    offset: u64,
    len: usize,
    version: VersionToken,
}

#[derive(Debug, Default)]
struct StoreState {
    index: BTreeMap<(KindId, u64), IndexEntry>,
    next_keys: HashMap<KindId, u64>,
    sequence: SequenceNumber,
    journal_schema: Option<u32>,
    kind_names: BTreeMap<KindId, String>,
}

impl StoreState {
    fn apply_frame(&mut self, frame: &CommitFrame, spans: &[Option<RowSpan>], base: u64) {
        for (op, span) in frame.ops.iter().zip(spans) {
            match op {
                JournalOp::Put {
                    kind, key, version, ..
                } => {
                    if let Some(span) = span {
                        self.index.insert(
                            (*kind, *key),
                            IndexEntry {
                                offset: base + span.offset,
                                len: span.len,
                                version: *version,
                            },
                        );
                    }
                    self.bump_key(*kind, key.saturating_add(1));
                }
                JournalOp::Delete { kind, key } => {
                    self.index.remove(&(*kind, *key));
                    self.bump_key(*kind, key.saturating_add(1));
                }
                JournalOp::SchemaVersion(version) => self.journal_schema = Some(*version),
                JournalOp::KeyFloor { kind, next } => self.bump_key(*kind, *next),
                JournalOp::KindName { kind, name } => {
                    self.kind_names.insert(*kind, name.clone());
                }
            }
        }
        self.sequence = self.sequence.max(frame.sequence);
    }

    fn bump_key(&mut self, kind: KindId, floor: u64) {
        let next = self.next_keys.entry(kind).or_insert(1);
        *next = (*next).max(floor);
    }

    /// Brings `manifest` in line with the schema version and kind names the
    /// journal recorded. Returns true if anything changed.
    fn repair_manifest(&self, manifest: &mut Manifest) -> bool {
        let mut changed = false;
        if let Some(version) = self.journal_schema {
            if manifest.schema_version != version {
                manifest.schema_version = version;
                changed = true;
            }
        }
        for (&kind, name) in &self.kind_names {
            if manifest.kind(name) == Some(kind) {
                continue;
            }
            manifest.kinds.retain(|_, k| *k != kind);
            manifest.kinds.insert(name.clone(), kind);
            manifest.next_kind = manifest.next_kind.max(kind.0.saturating_add(1));
            changed = true;
        }
        changed
    }
}

/// Durable key to row storage over a [`StorageBackend`].
pub struct RowStore {
    backend: Box<dyn StorageBackend>,
    dir: Option<StoreDir>,
    manifest: RwLock<Manifest>,
    writer: Mutex<()>,
    state: RwLock<StoreState>,
    poisoned: AtomicBool,
    sync_on_commit: bool,
    stats: Arc<EngineStats>,
}

impl std::fmt::Debug for RowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowStore")
            .field("store_id", &self.store_id())
            .field("path", &self.dir.as_ref().map(StoreDir::path))
            .finish_non_exhaustive()
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

impl RowStore {
    /// Opens a store over `backend`, replaying the journal.
    ///
    /// A torn frame at the end of the journal is truncated away. `dir`, when
    /// given, receives manifest updates and keeps the directory locked for the
    /// life of the store.
    ///
    /// The journal is authoritative for the schema version and for kind names
    /// written by migrations; a manifest that fell behind is repaired here.
    ///
    /// # Errors
    ///
    /// Returns `StoreCorruption` for a damaged complete frame, or any I/O error.
    pub fn open(
        backend: Box<dyn StorageBackend>,
        dir: Option<StoreDir>,
        mut manifest: Manifest,
        sync_on_commit: bool,
        stats: Arc<EngineStats>,
    ) -> CoreResult<Self> {
        let state = Self::recover(backend.as_ref())?;
        if state.repair_manifest(&mut manifest) {
            tracing::warn!(
                schema_version = manifest.schema_version,
                "manifest behind the journal, repaired"
            );
            if let Some(dir) = &dir {
                dir.save_manifest(&manifest)?;
            }
        }
        tracing::info!(
            store = %manifest.store_id,
            sequence = state.sequence.as_u64(),
            rows = state.index.len(),
            "row store opened"
        );
        Ok(Self {
            backend,
            dir,
            manifest: RwLock::new(manifest),
            writer: Mutex::new(()),
            state: RwLock::new(state),
            poisoned: AtomicBool::new(false),
            sync_on_commit,
            stats,
        })
    }

    fn recover(backend: &dyn StorageBackend) -> CoreResult<StoreState> {
        let size = backend.size()?;
        let data = backend.read_at(0, usize::try_from(size).map_err(|_| {
            CoreError::invalid_format("journal larger than addressable memory")
        })?)?;

        let mut state = StoreState::default();
        let mut pos = 0usize;
        while pos < data.len() {
            match read_frame(&data[pos..])? {
                FrameRead::Frame { frame, spans, len } => {
                    state.apply_frame(&frame, &spans, pos as u64);
                    pos += len;
                }
                FrameRead::Torn => {
                    tracing::warn!(
                        offset = pos,
                        discarded = data.len() - pos,
                        "discarding torn frame at journal tail"
                    );
                    backend.truncate(pos as u64)?;
                    break;
                }
            }
        }
        Ok(state)
    }

    /// Reads every complete frame of the journal.
    ///
    /// Returns the frames and the number of trailing bytes that do not form a
    /// complete frame. Used by offline inspection.
    ///
    /// # Errors
    ///
    /// Returns `StoreCorruption` for a damaged complete frame.
    pub fn read_journal(backend: &dyn StorageBackend) -> CoreResult<(Vec<CommitFrame>, u64)> {
        let size = backend.size()?;
        let data = backend.read_at(0, usize::try_from(size).unwrap_or(usize::MAX))?;
        let mut frames = Vec::new();
        let mut pos = 0usize;
        while pos < data.len() {
            match read_frame(&data[pos..])? {
                FrameRead::Frame { frame, len, .. } => {
                    frames.push(frame);
                    pos += len;
                }
                FrameRead::Torn => break,
            }
        }
        Ok((frames, (data.len() - pos) as u64))
    }

    /// Stable identity of the store.
    #[must_use]
    pub fn store_id(&self) -> StoreId {
        self.manifest.read().store_id
    }

    /// Copy of the manifest.
    #[must_use]
    pub fn manifest(&self) -> Manifest {
        self.manifest.read().clone()
    }

    /// Schema version the stored rows conform to.
    #[must_use]
    pub fn current_schema_version(&self) -> u32 {
        let journal = self.state.read().journal_schema;
        journal.unwrap_or_else(|| self.manifest.read().schema_version)
    }

    /// Sequence of the last committed frame.
    #[must_use]
    pub fn sequence(&self) -> SequenceNumber {
        self.state.read().sequence
    }

    /// Number of live rows.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.state.read().index.len()
    }

    /// Returns true after a failed commit could not be rolled back.
    ///
    /// A poisoned store refuses every further write until it is reopened.
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    fn check_poisoned(&self) -> CoreResult<()> {
        if self.is_poisoned() {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::Other,
                "journal tail is unknown after a failed commit; reopen the store",
            ))
            .into());
        }
        Ok(())
    }

    /// Cuts the journal back to `size` after a failed commit, poisoning the
    /// store if that fails too.
    fn roll_back_tail(&self, size: u64) -> CoreResult<()> {
        if let Err(e) = self.backend.truncate(size) {
            tracing::error!(error = %e, size, "journal rollback failed, store poisoned");
            self.poisoned.store(true, Ordering::Release);
            return Err(e.into());
        }
        Ok(())
    }

    /// Journal size in bytes.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the backend fails.
    pub fn journal_size(&self) -> CoreResult<u64> {
        Ok(self.backend.size()?)
    }

    /// Resolves entity names to kind ids, registering new names.
    ///
    /// # Errors
    ///
    /// Returns an error if the updated manifest cannot be saved.
    pub fn register_kinds<'a, I>(&self, names: I) -> CoreResult<Vec<KindId>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut manifest = self.manifest.write();
        let before = manifest.next_kind;
        let kinds: Vec<_> = names
            .into_iter()
            .map(|name| manifest.get_or_register_kind(name))
            .collect();
        if manifest.next_kind != before {
            if let Some(dir) = &self.dir {
                dir.save_manifest(&manifest)?;
            }
        }
        Ok(kinds)
    }

    /// Starts a consistent read of committed rows.
    pub fn snapshot(&self) -> StoreSnapshot<'_> {
        StoreSnapshot {
            store: self,
            state: self.state.read(),
        }
    }

    /// Reserves `count` fresh primary keys for `kind`.
    pub fn reserve_keys(&self, kind: KindId, count: u64) -> Range<u64> {
        let mut state = self.state.write();
        let next = state.next_keys.entry(kind).or_insert(1);
        let start = *next;
        *next = start.saturating_add(count);
        start..*next
    }

    /// Commits `ops` as one frame.
    ///
    /// Versions are assigned here: a put writes the current version plus one,
    /// starting at 1. `on_publish` runs while the index write lock is held,
    /// right after the commit becomes visible, so anything it updates changes
    /// atomically with the store from a reader's point of view.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the append or sync fails; nothing is
    /// published in that case.
    pub fn commit<F>(&self, ops: Vec<WriteOp>, on_publish: F) -> CoreResult<CommitOutcome>
    where
        F: FnOnce(&[AppliedOp]),
    {
        let guard = self.writer.lock();
        let journal_ops = {
            let state = self.state.read();
            ops.into_iter()
                .map(|op| match op {
                    WriteOp::Put { kind, key, values } => {
                        let version = state
                            .index
                            .get(&(kind, key))
                            .map_or(VersionToken(1), |e| e.version.next());
                        JournalOp::Put {
                            kind,
                            key,
                            version,
                            values,
                        }
                    }
                    WriteOp::Delete { kind, key } => JournalOp::Delete { kind, key },
                })
                .collect()
        };
        self.commit_locked(&guard, journal_ops, on_publish)
    }

    fn commit_locked<F>(
        &self,
        _writer: &MutexGuard<'_, ()>,
        ops: Vec<JournalOp>,
        on_publish: F,
    ) -> CoreResult<CommitOutcome>
    where
        F: FnOnce(&[AppliedOp]),
    {
        self.check_poisoned()?;
        let frame = CommitFrame {
            sequence: self.state.read().sequence.next(),
            timestamp: now_millis(),
            ops,
        };
        let encoded = frame.encode()?;

        let start = self.backend.size()?;
        let offset = match self.backend.append(&encoded.bytes) {
            Ok(offset) => offset,
            Err(e) => {
                tracing::error!(error = %e, "journal append failed");
                // A partial write must not sit in front of the next frame.
                self.roll_back_tail(start)?;
                return Err(e.into());
            }
        };
        if self.sync_on_commit {
            if let Err(e) = self.backend.sync() {
                tracing::error!(error = %e, "journal sync failed");
                // Drop the unsynced frame so a later commit does not build on it.
                self.roll_back_tail(offset)?;
                return Err(e.into());
            }
        }

        let applied: Vec<AppliedOp> = frame
            .ops
            .iter()
            .filter_map(|op| match op {
                JournalOp::Put {
                    kind,
                    key,
                    version,
                    values,
                } => Some(AppliedOp::Put {
                    kind: *kind,
                    key: *key,
                    row: Row::new(values.clone(), *version),
                }),
                JournalOp::Delete { kind, key } => Some(AppliedOp::Delete {
                    kind: *kind,
                    key: *key,
                }),
                JournalOp::SchemaVersion(_)
                | JournalOp::KeyFloor { .. }
                | JournalOp::KindName { .. } => None,
            })
            .collect();

        {
            let mut state = self.state.write();
            state.apply_frame(&frame, &encoded.spans, offset);
            on_publish(&applied);
        }

        self.stats
            .record_commit(applied.len() as u64, encoded.bytes.len() as u64);
        tracing::debug!(
            sequence = frame.sequence.as_u64(),
            ops = applied.len(),
            bytes = encoded.bytes.len(),
            "frame committed"
        );
        Ok(CommitOutcome {
            sequence: frame.sequence,
            timestamp: frame.timestamp,
            applied,
            bytes: encoded.bytes.len() as u64,
        })
    }

    /// Applies a migration mapping as a single commit.
    ///
    /// Every rewritten row gets a new version. The frame records the new
    /// schema version and every renamed kind, so a crash before the manifest
    /// is saved is repaired on the next open.
    ///
    /// # Errors
    ///
    /// Returns `MigrationFailed` if the store is not at `from_version` or a
    /// step fails.
    pub fn apply_migration(&self, mapping: &MigrationMapping) -> CoreResult<usize> {
        let guard = self.writer.lock();
        let current = self.current_schema_version();
        if current != mapping.from_version {
            return Err(CoreError::migration_failed(format!(
                "store is at version {current}, mapping starts at {}",
                mapping.from_version
            )));
        }

        let mut manifest = self.manifest();
        let (mut rows, versions) = {
            let snapshot = self.snapshot();
            let mut rows = BTreeMap::new();
            let mut versions = HashMap::new();
            for (&(kind, key), entry) in &snapshot.state.index {
                rows.insert((kind, key), snapshot.read_values(entry)?);
                versions.insert((kind, key), entry.version);
            }
            (rows, versions)
        };

        let previous = manifest.clone();
        let changed = mapping.apply(&mut manifest, &mut rows)?;
        let mut ops = vec![JournalOp::SchemaVersion(mapping.to_version)];
        for (name, &kind) in &manifest.kinds {
            if previous.kind_name(kind) != Some(name.as_str()) {
                ops.push(JournalOp::KindName {
                    kind,
                    name: name.clone(),
                });
            }
        }
        for key in &changed {
            if let Some(values) = rows.remove(key) {
                let version = versions.get(key).copied().unwrap_or_default().next();
                ops.push(JournalOp::Put {
                    kind: key.0,
                    key: key.1,
                    version,
                    values,
                });
            }
        }

        self.commit_locked(&guard, ops, |_| {})?;
        if let Some(dir) = &self.dir {
            dir.save_manifest(&manifest)?;
        }
        *self.manifest.write() = manifest;
        tracing::info!(
            from = mapping.from_version,
            to = mapping.to_version,
            rows = changed.len(),
            "migration applied"
        );
        Ok(changed.len())
    }

    /// Rewrites the journal with only the live rows.
    ///
    /// Row versions, the schema version and the key counters survive.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the rewrite fails; the old journal is then
    /// left in place.
    pub fn compact(&self) -> CoreResult<CompactionStats> {
        let guard = self.writer.lock();
        self.check_poisoned()?;
        let bytes_before = self.backend.size()?;
        let schema = self.current_schema_version();

        let mut state = self.state.write();
        let mut ops = vec![JournalOp::SchemaVersion(schema)];
        for (&kind, name) in &state.kind_names {
            ops.push(JournalOp::KindName {
                kind,
                name: name.clone(),
            });
        }
        for (&kind, &next) in &state.next_keys {
            ops.push(JournalOp::KeyFloor { kind, next });
        }
        for (&(kind, key), entry) in &state.index {
            let values = self.read_entry(entry)?;
            ops.push(JournalOp::Put {
                kind,
                key,
                version: entry.version,
                values,
            });
        }
        let frame = CommitFrame {
            sequence: state.sequence,
            timestamp: now_millis(),
            ops,
        };
        let encoded = frame.encode()?;
        self.backend.replace(&encoded.bytes)?;

        let mut rebuilt = StoreState::default();
        rebuilt.apply_frame(&frame, &encoded.spans, 0);
        let rows = rebuilt.index.len();
        *state = rebuilt;
        drop(state);
        drop(guard);

        let bytes_after = encoded.bytes.len() as u64;
        tracing::info!(bytes_before, bytes_after, rows, "journal compacted");
        Ok(CompactionStats {
            bytes_before,
            bytes_after,
            rows,
        })
    }

    fn read_entry(&self, entry: &IndexEntry) -> CoreResult<RowValues> {
        let bytes = self.backend.read_at(entry.offset, entry.len)?;
        Ok(from_cbor(&bytes)?)
    }
}

/// A consistent view of committed rows.
///
/// Every query method counts as one backing store query in the engine
/// statistics, however many rows it touches. Do not start a second snapshot
/// on the same thread while one is alive.
pub struct StoreSnapshot<'a> {
    store: &'a RowStore,
    state: RwLockReadGuard<'a, StoreState>,
}

impl StoreSnapshot<'_> {
    fn read_values(&self, entry: &IndexEntry) -> CoreResult<RowValues> {
        self.store.read_entry(entry)
    }

    fn read_row(&self, entry: &IndexEntry) -> CoreResult<Row> {
        Ok(Row::new(self.read_values(entry)?, entry.version))
    }

    /// Sequence of the last commit visible in this snapshot.
    #[must_use]
    pub fn sequence(&self) -> SequenceNumber {
        self.state.sequence
    }

    /// Fetches one row.
    ///
    /// # Errors
    ///
    /// Returns a storage or codec error if the row cannot be read.
    pub fn get(&self, kind: KindId, key: u64) -> CoreResult<Option<Row>> {
        let row = match self.state.index.get(&(kind, key)) {
            Some(entry) => Some(self.read_row(entry)?),
            None => None,
        };
        self.store
            .stats
            .record_store_query(u64::from(row.is_some()));
        Ok(row)
    }

    /// Fetches many rows in one query. Missing keys are skipped.
    ///
    /// # Errors
    ///
    /// Returns a storage or codec error if a row cannot be read.
    pub fn get_many(&self, keys: &[(KindId, u64)]) -> CoreResult<Vec<((KindId, u64), Row)>> {
        let mut rows = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = self.state.index.get(key) {
                rows.push((*key, self.read_row(entry)?));
            }
        }
        self.store.stats.record_store_query(rows.len() as u64);
        Ok(rows)
    }

    /// Rows of `kind` matching `predicate`, in primary key order.
    ///
    /// # Errors
    ///
    /// Returns a storage or codec error if a row cannot be read.
    pub fn scan(&self, kind: KindId, predicate: &Predicate) -> CoreResult<Vec<(u64, Row)>> {
        let mut rows = Vec::new();
        for (&(_, key), entry) in self.state.index.range((kind, 0)..=(kind, u64::MAX)) {
            let row = self.read_row(entry)?;
            if predicate.evaluate(row.values()) {
                rows.push((key, row));
            }
        }
        self.store.stats.record_store_query(rows.len() as u64);
        Ok(rows)
    }

    /// Current version of one row, without reading it.
    #[must_use]
    pub fn version_of(&self, kind: KindId, key: u64) -> Option<VersionToken> {
        self.state.index.get(&(kind, key)).map(|e| e.version)
    }

    /// Primary keys of every row of `kind`.
    #[must_use]
    pub fn keys(&self, kind: KindId) -> Vec<u64> {
        self.state
            .index
            .range((kind, 0)..=(kind, u64::MAX))
            .map(|(&(_, key), _)| key)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faultdb_codec::Value;
    use faultdb_storage::{FileBackend, InMemoryBackend};
    use tempfile::tempdir;

    fn values(name: &str, code: i64) -> RowValues {
        let mut values = RowValues::new();
        values.insert("name".into(), Value::from(name));
        values.insert("code".into(), Value::Integer(code));
        values
    }

    fn memory_store() -> RowStore {
        RowStore::open(
            Box::new(InMemoryBackend::new()),
            None,
            Manifest::new((1, 0), 1),
            true,
            Arc::new(EngineStats::new()),
        )
        .unwrap()
    }

    const COUNTRY: KindId = KindId(1);

    /// Lets a test keep its own handle on the journal bytes.
    struct Shared(Arc<InMemoryBackend>);
    impl StorageBackend for Shared {
        fn read_at(&self, o: u64, l: usize) -> faultdb_storage::StorageResult<Vec<u8>> {
            self.0.read_at(o, l)
        }
        fn append(&self, d: &[u8]) -> faultdb_storage::StorageResult<u64> {
            self.0.append(d)
        }
        fn flush(&self) -> faultdb_storage::StorageResult<()> {
            self.0.flush()
        }
        fn sync(&self) -> faultdb_storage::StorageResult<()> {
            self.0.sync()
        }
        fn size(&self) -> faultdb_storage::StorageResult<u64> {
            self.0.size()
        }
        fn truncate(&self, n: u64) -> faultdb_storage::StorageResult<()> {
            self.0.truncate(n)
        }
        fn replace(&self, d: &[u8]) -> faultdb_storage::StorageResult<()> {
            self.0.replace(d)
        }
    }

    #[test]
    fn versions_start_at_one_and_advance() {
        let store = memory_store();
        let out = store
            .commit(
                vec![WriteOp::Put {
                    kind: COUNTRY,
                    key: 1,
                    values: values("France", 250),
                }],
                |_| {},
            )
            .unwrap();
        assert_eq!(out.sequence, SequenceNumber(1));
        store
            .commit(
                vec![WriteOp::Put {
                    kind: COUNTRY,
                    key: 1,
                    values: values("France", 251),
                }],
                |_| {},
            )
            .unwrap();

        let snapshot = store.snapshot();
        let row = snapshot.get(COUNTRY, 1).unwrap().unwrap();
        assert_eq!(row.version(), VersionToken(2));
        assert_eq!(row.get("code"), Some(&Value::Integer(251)));
    }

    #[test]
    fn publish_hook_sees_applied_rows() {
        let store = memory_store();
        let mut seen = Vec::new();
        store
            .commit(
                vec![
                    WriteOp::Put {
                        kind: COUNTRY,
                        key: 3,
                        values: values("Peru", 604),
                    },
                    WriteOp::Delete {
                        kind: COUNTRY,
                        key: 99,
                    },
                ],
                |applied| seen.extend_from_slice(applied),
            )
            .unwrap();
        assert_eq!(seen.len(), 2);
        assert!(matches!(&seen[0], AppliedOp::Put { row, .. } if row.version() == VersionToken(1)));
    }

    #[test]
    fn scan_filters_and_counts_one_query() {
        let store = memory_store();
        let keys = store.reserve_keys(COUNTRY, 3);
        let ops = keys
            .clone()
            .zip([("France", 250), ("Peru", 604), ("Chile", 152)])
            .map(|(key, (name, code))| WriteOp::Put {
                kind: COUNTRY,
                key,
                values: values(name, code),
            })
            .collect();
        store.commit(ops, |_| {}).unwrap();

        let before = store.stats.snapshot().store_queries;
        let snapshot = store.snapshot();
        let hits = snapshot
            .scan(COUNTRY, &Predicate::gt("code", 200))
            .unwrap();
        assert_eq!(hits.len(), 2);
        let many = snapshot
            .get_many(&keys.map(|k| (COUNTRY, k)).collect::<Vec<_>>())
            .unwrap();
        assert_eq!(many.len(), 3);
        drop(snapshot);
        assert_eq!(store.stats.snapshot().store_queries - before, 2);
    }

    #[test]
    fn reserved_keys_do_not_overlap() {
        let store = memory_store();
        let a = store.reserve_keys(COUNTRY, 2);
        let b = store.reserve_keys(COUNTRY, 2);
        assert_eq!(a, 1..3);
        assert_eq!(b, 3..5);
    }

    #[test]
    fn reopen_recovers_index_and_truncates_torn_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rows.log");
        {
            let store = RowStore::open(
                Box::new(FileBackend::open(&path).unwrap()),
                None,
                Manifest::new((1, 0), 1),
                true,
                Arc::new(EngineStats::new()),
            )
            .unwrap();
            store
                .commit(
                    vec![WriteOp::Put {
                        kind: COUNTRY,
                        key: 7,
                        values: values("France", 250),
                    }],
                    |_| {},
                )
                .unwrap();
        }
        let intact = std::fs::metadata(&path).unwrap().len();
        {
            use std::io::Write;
            let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(b"FDBJ\x01\x00\xff\x00\x00\x00partial").unwrap();
        }

        let store = RowStore::open(
            Box::new(FileBackend::open(&path).unwrap()),
            None,
            Manifest::new((1, 0), 1),
            true,
            Arc::new(EngineStats::new()),
        )
        .unwrap();
        assert_eq!(store.journal_size().unwrap(), intact);
        assert_eq!(store.sequence(), SequenceNumber(1));
        assert_eq!(store.reserve_keys(COUNTRY, 1), 8..9);
        let row = store.snapshot().get(COUNTRY, 7).unwrap().unwrap();
        assert_eq!(row.get("name"), Some(&Value::from("France")));
    }

    #[test]
    fn corrupt_frame_refuses_to_open() {
        let store = memory_store();
        store
            .commit(
                vec![WriteOp::Put {
                    kind: COUNTRY,
                    key: 1,
                    values: values("France", 250),
                }],
                |_| {},
            )
            .unwrap();
        let mut bytes = store.backend.read_at(0, store.journal_size().unwrap() as usize).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;

        let reopened = RowStore::open(
            Box::new(InMemoryBackend::with_data(bytes)),
            None,
            Manifest::new((1, 0), 1),
            true,
            Arc::new(EngineStats::new()),
        );
        assert!(matches!(reopened, Err(CoreError::StoreCorruption { .. })));
    }

    #[test]
    fn failed_append_publishes_nothing() {
        let backend = Arc::new(InMemoryBackend::new());
        let store = RowStore::open(
            Box::new(Shared(Arc::clone(&backend))),
            None,
            Manifest::new((1, 0), 1),
            true,
            Arc::new(EngineStats::new()),
        )
        .unwrap();

        backend.set_fail_writes(true);
        let mut published = false;
        let result = store.commit(
            vec![WriteOp::Put {
                kind: COUNTRY,
                key: 1,
                values: values("France", 250),
            }],
            |_| published = true,
        );
        assert!(matches!(result, Err(CoreError::Storage(_))));
        assert!(!published);
        assert_eq!(store.row_count(), 0);
        assert_eq!(store.sequence(), SequenceNumber(0));
    }

    /// Memory journal whose sync and truncate can be made to fail.
    #[derive(Default)]
    struct Flaky {
        inner: Arc<InMemoryBackend>,
        fail_sync: Arc<AtomicBool>,
        fail_truncate: Arc<AtomicBool>,
    }

    fn injected(flag: &AtomicBool) -> faultdb_storage::StorageResult<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(StorageError::Io(io::Error::new(io::ErrorKind::Other, "disk gone")));
        }
        Ok(())
    }

    impl StorageBackend for Flaky {
        fn read_at(&self, o: u64, l: usize) -> faultdb_storage::StorageResult<Vec<u8>> {
            self.inner.read_at(o, l)
        }
        fn append(&self, d: &[u8]) -> faultdb_storage::StorageResult<u64> {
            self.inner.append(d)
        }
        fn flush(&self) -> faultdb_storage::StorageResult<()> {
            self.inner.flush()
        }
        fn sync(&self) -> faultdb_storage::StorageResult<()> {
            injected(&self.fail_sync)?;
            self.inner.sync()
        }
        fn size(&self) -> faultdb_storage::StorageResult<u64> {
            self.inner.size()
        }
        fn truncate(&self, n: u64) -> faultdb_storage::StorageResult<()> {
            injected(&self.fail_truncate)?;
            self.inner.truncate(n)
        }
        fn replace(&self, d: &[u8]) -> faultdb_storage::StorageResult<()> {
            self.inner.replace(d)
        }
    }

    fn flaky_store(flaky: Flaky) -> RowStore {
        RowStore::open(
            Box::new(flaky),
            None,
            Manifest::new((1, 0), 1),
            true,
            Arc::new(EngineStats::new()),
        )
        .unwrap()
    }

    fn put(code: i64) -> Vec<WriteOp> {
        vec![WriteOp::Put {
            kind: COUNTRY,
            key: 1,
            values: values("France", code),
        }]
    }

    #[test]
    fn failed_sync_rolls_back_the_frame() {
        let flaky = Flaky::default();
        let memory = Arc::clone(&flaky.inner);
        let fail_sync = Arc::clone(&flaky.fail_sync);
        let store = flaky_store(flaky);
        store.commit(put(250), |_| {}).unwrap();
        let size = memory.size().unwrap();

        fail_sync.store(true, Ordering::SeqCst);
        assert!(store.commit(put(251), |_| {}).is_err());
        assert!(!store.is_poisoned());
        assert_eq!(memory.size().unwrap(), size);

        fail_sync.store(false, Ordering::SeqCst);
        store.commit(put(252), |_| {}).unwrap();
        let row = store.snapshot().get(COUNTRY, 1).unwrap().unwrap();
        assert_eq!(row.get("code"), Some(&Value::Integer(252)));
    }

    #[test]
    fn failed_rollback_poisons_the_store() {
        let flaky = Flaky::default();
        let fail_sync = Arc::clone(&flaky.fail_sync);
        let fail_truncate = Arc::clone(&flaky.fail_truncate);
        let store = flaky_store(flaky);
        store.commit(put(250), |_| {}).unwrap();

        fail_sync.store(true, Ordering::SeqCst);
        fail_truncate.store(true, Ordering::SeqCst);
        assert!(matches!(
            store.commit(put(251), |_| {}),
            Err(CoreError::Storage(_))
        ));
        assert!(store.is_poisoned());

        fail_sync.store(false, Ordering::SeqCst);
        fail_truncate.store(false, Ordering::SeqCst);
        let mut published = false;
        let result = store.commit(put(252), |_| published = true);
        assert!(matches!(result, Err(CoreError::Storage(_))));
        assert!(!published);
        assert!(store.compact().is_err());
        assert_eq!(store.sequence(), SequenceNumber(1));
        let row = store.snapshot().get(COUNTRY, 1).unwrap().unwrap();
        assert_eq!(row.get("code"), Some(&Value::Integer(250)));
    }

    #[test]
    fn reopen_repairs_manifest_left_behind_by_migration() {
        let mut manifest = Manifest::new((1, 0), 1);
        let nation = manifest.get_or_register_kind("Nation");
        let stale = manifest.clone();
        let memory = Arc::new(InMemoryBackend::new());
        let store = RowStore::open(
            Box::new(Shared(Arc::clone(&memory))),
            None,
            manifest,
            true,
            Arc::new(EngineStats::new()),
        )
        .unwrap();
        store
            .commit(
                vec![WriteOp::Put {
                    kind: nation,
                    key: 1,
                    values: values("France", 250),
                }],
                |_| {},
            )
            .unwrap();
        let mapping = MigrationMapping::new(1, 2)
            .step(crate::migration::MigrationStep::rename_entity("Nation", "Country"));
        store.apply_migration(&mapping).unwrap();
        drop(store);

        // The manifest never made it to disk.
        let reopened = RowStore::open(
            Box::new(InMemoryBackend::with_data(memory.data())),
            None,
            stale,
            true,
            Arc::new(EngineStats::new()),
        )
        .unwrap();
        let manifest = reopened.manifest();
        assert_eq!(manifest.schema_version, 2);
        assert_eq!(manifest.kind("Country"), Some(nation));
        assert_eq!(manifest.kind("Nation"), None);
        assert_eq!(reopened.current_schema_version(), 2);

        reopened.compact().unwrap();
        let (frames, _) = RowStore::read_journal(reopened.backend.as_ref()).unwrap();
        assert!(frames[0].ops.contains(&JournalOp::KindName {
            kind: nation,
            name: "Country".into(),
        }));
    }

    #[test]
    fn compaction_keeps_live_rows_versions_and_counters() {
        let store = memory_store();
        for code in 0..5 {
            store
                .commit(
                    vec![WriteOp::Put {
                        kind: COUNTRY,
                        key: 1,
                        values: values("France", code),
                    }],
                    |_| {},
                )
                .unwrap();
        }
        store
            .commit(
                vec![
                    WriteOp::Put {
                        kind: COUNTRY,
                        key: 9,
                        values: values("Gone", 0),
                    },
                    WriteOp::Delete {
                        kind: COUNTRY,
                        key: 9,
                    },
                ],
                |_| {},
            )
            .unwrap();

        let stats = store.compact().unwrap();
        assert!(stats.bytes_after < stats.bytes_before);
        assert_eq!(stats.rows, 1);

        let snapshot = store.snapshot();
        let row = snapshot.get(COUNTRY, 1).unwrap().unwrap();
        assert_eq!(row.version(), VersionToken(5));
        assert_eq!(row.get("code"), Some(&Value::Integer(4)));
        assert!(snapshot.get(COUNTRY, 9).unwrap().is_none());
        drop(snapshot);
        assert_eq!(store.reserve_keys(COUNTRY, 1), 10..11);
    }

    #[test]
    fn migration_rewrites_rows_in_one_frame() {
        use crate::migration::MigrationStep;

        let store = memory_store();
        let kind = store.register_kinds(["Country"]).unwrap()[0];
        store
            .commit(
                vec![WriteOp::Put {
                    kind,
                    key: 1,
                    values: values("France", 250),
                }],
                |_| {},
            )
            .unwrap();

        let mapping = MigrationMapping::new(1, 2)
            .step(MigrationStep::add_attribute("Country", "population", 0));
        assert_eq!(store.apply_migration(&mapping).unwrap(), 1);
        assert_eq!(store.current_schema_version(), 2);
        assert_eq!(store.sequence(), SequenceNumber(2));
        let row = store.snapshot().get(kind, 1).unwrap().unwrap();
        assert_eq!(row.version(), VersionToken(2));
        assert_eq!(row.get("population"), Some(&Value::Integer(0)));

        assert!(store.apply_migration(&mapping).is_err());
    }
}
