//! Dump command implementation.

use super::journal::{self, kind_label, FrameEntry};
use faultdb_core::{JournalOp, Manifest, Value};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// A dumped frame.
#[derive(Debug, Serialize)]
pub struct DumpFrame {
    /// Byte offset in the journal.
    pub offset: u64,
    /// Frame length in bytes.
    pub len: usize,
    /// Commit sequence.
    pub sequence: u64,
    /// Commit time, milliseconds since the epoch.
    pub timestamp: i64,
    /// Operations in the frame.
    pub ops: Vec<DumpOp>,
}

/// A dumped operation.
#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DumpOp {
    /// Row written.
    Put {
        /// Entity name.
        entity: String,
        /// Primary key.
        key: u64,
        /// Row version.
        version: u64,
        /// Row values.
        values: BTreeMap<String, serde_json::Value>,
    },
    /// Row removed.
    Delete {
        /// Entity name.
        entity: String,
        /// Primary key.
        key: u64,
    },
    /// Schema version marker.
    Schema {
        /// Version.
        version: u32,
    },
    /// Primary-key floor.
    KeyFloor {
        /// Entity name.
        entity: String,
        /// Lowest assignable key.
        next: u64,
    },
    /// Entity name recorded by a migration.
    KindName {
        /// Kind id.
        kind: u32,
        /// Entity name.
        name: String,
    },
}

/// Runs the dump command.
pub fn run(
    path: &Path,
    limit: Option<usize>,
    from_sequence: u64,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = journal::open(path)?;
    let walk = journal::walk(&store.journal)?;

    let frames: Vec<DumpFrame> = walk
        .frames
        .iter()
        .filter(|entry| entry.frame.sequence.as_u64() >= from_sequence)
        .take(limit.unwrap_or(usize::MAX))
        .map(|entry| dump_frame(&store.manifest, entry))
        .collect();

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&frames)?);
        }
        _ => {
            for frame in &frames {
                print_frame(frame);
            }
            println!("{} frames", frames.len());
        }
    }

    if let Some((offset, error)) = walk.corruption {
        eprintln!("stopped at damaged frame at offset {offset}: {error}");
    } else if walk.torn_bytes > 0 {
        eprintln!("{} trailing bytes do not form a frame", walk.torn_bytes);
    }
    Ok(())
}

fn dump_frame(manifest: &Manifest, entry: &FrameEntry) -> DumpFrame {
    let ops = entry
        .frame
        .ops
        .iter()
        .map(|op| match op {
            JournalOp::Put {
                kind,
                key,
                version,
                values,
            } => DumpOp::Put {
                entity: kind_label(manifest, *kind),
                key: *key,
                version: version.0,
                values: values
                    .iter()
                    .map(|(name, value)| (name.clone(), to_json(value)))
                    .collect(),
            },
            JournalOp::Delete { kind, key } => DumpOp::Delete {
                entity: kind_label(manifest, *kind),
                key: *key,
            },
            JournalOp::SchemaVersion(version) => DumpOp::Schema { version: *version },
            JournalOp::KeyFloor { kind, next } => DumpOp::KeyFloor {
                entity: kind_label(manifest, *kind),
                next: *next,
            },
            JournalOp::KindName { kind, name } => DumpOp::KindName {
                kind: kind.0,
                name: name.clone(),
            },
        })
        .collect();

    DumpFrame {
        offset: entry.offset,
        len: entry.len,
        sequence: entry.frame.sequence.as_u64(),
        timestamp: entry.frame.timestamp,
        ops,
    }
}

/// Plain JSON for an attribute value. Bytes become a hex string.
fn to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Integer(i) | Value::Timestamp(i) => serde_json::Value::from(*i),
        Value::Float(f) => serde_json::Value::from(*f),
        Value::Text(s) => serde_json::Value::String(s.clone()),
        Value::Bytes(bytes) => {
            serde_json::Value::String(bytes.iter().map(|b| format!("{b:02x}")).collect())
        }
        Value::Array(items) => serde_json::Value::Array(items.iter().map(to_json).collect()),
    }
}

fn print_frame(frame: &DumpFrame) {
    println!(
        "#{} @{} ({} bytes, t={})",
        frame.sequence, frame.offset, frame.len, frame.timestamp
    );
    for op in &frame.ops {
        match op {
            DumpOp::Put {
                entity,
                key,
                version,
                values,
            } => {
                let values = serde_json::to_string(values).unwrap_or_default();
                println!("  PUT    {entity}/{key} v{version} {values}");
            }
            DumpOp::Delete { entity, key } => println!("  DELETE {entity}/{key}"),
            DumpOp::Schema { version } => println!("  SCHEMA v{version}"),
            DumpOp::KeyFloor { entity, next } => println!("  FLOOR  {entity} >= {next}"),
            DumpOp::KindName { kind, name } => println!("  NAME   kind {kind} = {name}"),
        }
    }
}
