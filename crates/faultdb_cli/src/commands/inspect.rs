//! Inspect command implementation.

use super::journal::{self, format_size, kind_label};
use serde::Serialize;
use std::path::Path;

/// Store inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Store path.
    pub path: String,
    /// Store identity.
    pub store_id: String,
    /// Format version as `major.minor`.
    pub format_version: String,
    /// Schema version the rows conform to.
    pub schema_version: u32,
    /// Journal size in bytes.
    pub journal_size: u64,
    /// Number of complete frames.
    pub frame_count: usize,
    /// Sequence of the last complete frame.
    pub last_sequence: u64,
    /// Bytes of an incomplete trailing frame.
    pub torn_bytes: u64,
    /// Live rows across all entities.
    pub row_count: usize,
    /// Per-entity statistics (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entities: Option<Vec<EntityStats>>,
}

/// Statistics for a single entity.
#[derive(Debug, Serialize)]
pub struct EntityStats {
    /// Entity name.
    pub name: String,
    /// Kind id.
    pub kind: u32,
    /// Number of live rows.
    pub rows: usize,
}

/// Runs the inspect command.
pub fn run(path: &Path, show_entities: bool, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = journal::open(path)?;
    let walk = journal::walk(&store.journal)?;
    if let Some((offset, error)) = &walk.corruption {
        tracing::warn!(offset, %error, "journal damaged; counts stop at the damage");
    }

    let live = journal::live_rows(&walk.frames);
    let mut entities: Vec<EntityStats> = store
        .manifest
        .kinds
        .iter()
        .map(|(name, kind)| EntityStats {
            name: name.clone(),
            kind: kind.0,
            rows: live.get(kind).copied().unwrap_or(0),
        })
        .collect();
    for (kind, rows) in &live {
        if !store.manifest.kinds.values().any(|k| k == kind) {
            entities.push(EntityStats {
                name: kind_label(&store.manifest, *kind),
                kind: kind.0,
                rows: *rows,
            });
        }
    }

    let (major, minor) = store.manifest.format_version;
    let result = InspectResult {
        path: path.display().to_string(),
        store_id: store.manifest.store_id.to_string(),
        format_version: format!("{major}.{minor}"),
        schema_version: store.manifest.schema_version,
        journal_size: walk.size,
        frame_count: walk.frames.len(),
        last_sequence: walk.frames.last().map_or(0, |f| f.frame.sequence.as_u64()),
        torn_bytes: walk.torn_bytes,
        row_count: live.values().sum(),
        entities: show_entities.then_some(entities),
    };

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("faultdb Store Inspection");
    println!("========================");
    println!();
    println!("Path:     {}", result.path);
    println!("Store:    {}", result.store_id);
    println!("Format:   {}", result.format_version);
    println!("Schema:   v{}", result.schema_version);
    println!();
    println!("Journal:");
    println!("  Size:          {}", format_size(result.journal_size));
    println!("  Frames:        {}", result.frame_count);
    println!("  Last sequence: {}", result.last_sequence);
    if result.torn_bytes > 0 {
        println!("  Torn tail:     {} bytes", result.torn_bytes);
    }
    println!();
    println!("Rows: {}", result.row_count);

    if let Some(entities) = &result.entities {
        println!();
        println!("Entities:");
        for entity in entities {
            println!("  [{}] {}: {} rows", entity.kind, entity.name, entity.rows);
        }
    }
}
