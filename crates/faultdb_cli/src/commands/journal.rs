//! Offline access to a store directory shared by the commands.

use faultdb_core::{read_frame, CommitFrame, CoreError, FrameRead, JournalOp, KindId, Manifest, StoreDir};
use faultdb_storage::{FileBackend, StorageBackend};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// A locked store directory with its manifest and journal.
pub struct OpenedStore {
    /// Holds the directory lock while the command runs.
    pub dir: StoreDir,
    /// Decoded manifest.
    pub manifest: Manifest,
    /// Journal backend.
    pub journal: FileBackend,
}

/// Locks the store at `path` and loads its manifest.
pub fn open(path: &Path) -> Result<OpenedStore, Box<dyn std::error::Error>> {
    let dir = match StoreDir::open(path, false) {
        Ok(dir) => dir,
        Err(CoreError::DatabaseLocked) => {
            return Err(format!("Store at {} is open in another process", path.display()).into())
        }
        Err(e) => return Err(e.into()),
    };
    let manifest = dir
        .load_manifest()?
        .ok_or_else(|| format!("No store found at {}", path.display()))?;
    let journal = FileBackend::open(&dir.journal_path())?;
    Ok(OpenedStore {
        dir,
        manifest,
        journal,
    })
}

/// One complete frame and where it sits.
pub struct FrameEntry {
    /// Byte offset of the frame.
    pub offset: u64,
    /// Frame length in bytes.
    pub len: usize,
    /// Decoded frame.
    pub frame: CommitFrame,
}

/// Outcome of walking the journal front to back.
pub struct JournalWalk {
    /// Complete frames, in order.
    pub frames: Vec<FrameEntry>,
    /// Bytes after the last complete frame that do not form one.
    pub torn_bytes: u64,
    /// First damaged frame, if any: its offset and the error.
    pub corruption: Option<(u64, String)>,
    /// Journal size.
    pub size: u64,
}

/// Reads frames until the end, a torn tail or the first damaged frame.
pub fn walk(journal: &dyn StorageBackend) -> Result<JournalWalk, Box<dyn std::error::Error>> {
    let size = journal.size()?;
    let data = journal.read_at(0, usize::try_from(size)?)?;
    let mut frames = Vec::new();
    let mut pos = 0usize;
    let mut corruption = None;
    while pos < data.len() {
        match read_frame(&data[pos..]) {
            Ok(FrameRead::Frame { frame, len, .. }) => {
                frames.push(FrameEntry {
                    offset: pos as u64,
                    len,
                    frame,
                });
                pos += len;
            }
            Ok(FrameRead::Torn) => break,
            Err(e) => {
                corruption = Some((pos as u64, e.to_string()));
                break;
            }
        }
    }
    let torn_bytes = if corruption.is_some() {
        0
    } else {
        (data.len() - pos) as u64
    };
    Ok(JournalWalk {
        frames,
        torn_bytes,
        corruption,
        size,
    })
}

/// Live rows per kind after replaying `frames`.
pub fn live_rows(frames: &[FrameEntry]) -> BTreeMap<KindId, usize> {
    let mut rows = BTreeSet::new();
    for entry in frames {
        for op in &entry.frame.ops {
            match op {
                JournalOp::Put { kind, key, .. } => {
                    rows.insert((*kind, *key));
                }
                JournalOp::Delete { kind, key } => {
                    rows.remove(&(*kind, *key));
                }
                JournalOp::SchemaVersion(_)
                | JournalOp::KeyFloor { .. }
                | JournalOp::KindName { .. } => {}
            }
        }
    }
    let mut counts = BTreeMap::new();
    for (kind, _) in rows {
        *counts.entry(kind).or_insert(0) += 1;
    }
    counts
}

/// Name of `kind` in the manifest, or its number.
pub fn kind_label(manifest: &Manifest, kind: KindId) -> String {
    manifest
        .kind_name(kind)
        .map_or_else(|| format!("#{kind}"), str::to_string)
}

/// Human-readable byte count.
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use faultdb_core::{
        AttributeDescription, AttributeType, EntityDescription, Model, StoreCoordinator,
    };
    use std::path::PathBuf;
    use tempfile::TempDir;

    /// A store with three saved countries, one of them deleted again.
    pub(crate) fn sample_store() -> (TempDir, PathBuf) {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("store");
        let model = Model::new(1).entity(
            EntityDescription::new("Country")
                .attribute(AttributeDescription::new("name", AttributeType::Text)),
        );
        let coordinator = StoreCoordinator::open(&path, model).unwrap();
        let context = coordinator.new_context();
        let mut countries = Vec::new();
        for name in ["France", "Peru", "Chile"] {
            let country = context.insert("Country").unwrap();
            country.set("name", name).unwrap();
            countries.push(country);
        }
        context.save().unwrap();
        context.delete(&countries[2]).unwrap();
        context.save().unwrap();
        (temp, path)
    }

    #[test]
    fn walk_replays_every_commit() {
        let (_temp, path) = sample_store();
        let store = open(&path).unwrap();
        let walk = walk(&store.journal).unwrap();
        assert!(walk.corruption.is_none());
        assert_eq!(walk.torn_bytes, 0);
        assert!(walk.frames.len() >= 2);

        let live = live_rows(&walk.frames);
        let country = store.manifest.kind("Country").unwrap();
        assert_eq!(live.get(&country), Some(&2));
        assert_eq!(kind_label(&store.manifest, country), "Country");
    }

    #[test]
    fn torn_tail_is_reported_not_fatal() {
        let (_temp, path) = sample_store();
        let store = open(&path).unwrap();
        store.journal.append(b"FDBJ\x01").unwrap();
        let walk = walk(&store.journal).unwrap();
        assert!(walk.corruption.is_none());
        assert_eq!(walk.torn_bytes, 5);
    }

    #[test]
    fn missing_store_is_an_error() {
        let temp = TempDir::new().unwrap();
        assert!(open(&temp.path().join("absent")).is_err());
    }

    #[test]
    fn sizes_are_humane() {
        assert_eq!(format_size(12), "12 B");
        assert_eq!(format_size(2048), "2.0 KB");
    }
}
