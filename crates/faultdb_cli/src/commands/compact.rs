//! Compact command implementation.

use super::journal::{self, format_size};
use faultdb_core::{EngineStats, JournalOp, RowStore};
use std::path::Path;
use std::sync::Arc;

/// What a compaction would remove.
#[derive(Debug, PartialEq, Eq)]
pub struct CompactionPlan {
    /// Frames in the journal.
    pub frames: usize,
    /// Put and delete operations in the journal.
    pub ops: usize,
    /// Rows that survive.
    pub live_rows: usize,
    /// Journal size.
    pub bytes_before: u64,
}

impl CompactionPlan {
    /// Operations a rewrite drops.
    pub fn obsolete_ops(&self) -> usize {
        self.ops.saturating_sub(self.live_rows)
    }
}

/// Runs the compact command.
pub fn run(path: &Path, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    println!("Compacting journal at {}", path.display());
    if dry_run {
        println!("(dry run - no changes will be made)");
    }
    println!();

    let store = journal::open(path)?;
    let walk = journal::walk(&store.journal)?;
    if let Some((offset, error)) = walk.corruption {
        return Err(format!("refusing to compact a damaged journal (offset {offset}: {error})").into());
    }

    let plan = CompactionPlan {
        frames: walk.frames.len(),
        ops: walk
            .frames
            .iter()
            .flat_map(|f| &f.frame.ops)
            .filter(|op| matches!(op, JournalOp::Put { .. } | JournalOp::Delete { .. }))
            .count(),
        live_rows: journal::live_rows(&walk.frames).values().sum(),
        bytes_before: walk.size,
    };

    println!("Compaction Analysis:");
    println!("  Frames:          {}", plan.frames);
    println!("  Row operations:  {}", plan.ops);
    println!("  Live rows:       {}", plan.live_rows);
    println!("  Obsolete:        {}", plan.obsolete_ops());
    println!("  Size before:     {}", format_size(plan.bytes_before));

    if dry_run {
        return Ok(());
    }
    if plan.frames <= 1 && plan.obsolete_ops() == 0 {
        println!();
        println!("No compaction needed - journal is already minimal");
        return Ok(());
    }

    println!();
    println!("Performing compaction...");
    let journal::OpenedStore {
        dir,
        manifest,
        journal,
    } = store;
    let rows = RowStore::open(
        Box::new(journal),
        Some(dir),
        manifest,
        true,
        Arc::new(EngineStats::new()),
    )?;
    let stats = rows.compact()?;
    println!("  Size after:      {}", format_size(stats.bytes_after));
    println!(
        "  Space saved:     {}",
        format_size(stats.bytes_before.saturating_sub(stats.bytes_after))
    );
    println!("✓ Compaction complete");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::journal::tests::sample_store;

    #[test]
    fn compaction_keeps_live_rows_only() {
        let (_temp, path) = sample_store();
        run(&path, true).unwrap();
        run(&path, false).unwrap();

        let store = journal::open(&path).unwrap();
        let walk = journal::walk(&store.journal).unwrap();
        assert_eq!(walk.frames.len(), 1);
        let live: usize = journal::live_rows(&walk.frames).values().sum();
        assert_eq!(live, 2);
    }
}
