//! Verify command implementation.

use super::journal::{self, JournalWalk};
use faultdb_core::{JournalOp, Manifest};
use std::path::Path;

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Number of frames checked.
    pub frames_checked: usize,
    /// Number of operations checked.
    pub ops_checked: usize,
    /// Problems that make the store unusable.
    pub errors: Vec<String>,
    /// Problems recovery repairs on the next open.
    pub warnings: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs the verify command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying store at {}", path.display());
    println!();

    let store = journal::open(path)?;
    let walk = journal::walk(&store.journal)?;
    let result = check(&store.manifest, &walk);
    print_result(&result);

    println!();
    if result.is_ok() {
        println!("✓ Store verification passed");
        Ok(())
    } else {
        println!("✗ Store verification failed");
        Err("Verification failed".into())
    }
}

/// Checks a walked journal against its manifest.
pub fn check(manifest: &Manifest, walk: &JournalWalk) -> VerifyResult {
    let mut result = VerifyResult::default();

    if let Some((offset, error)) = &walk.corruption {
        result
            .errors
            .push(format!("damaged frame at offset {offset}: {error}"));
    }
    if walk.torn_bytes > 0 {
        result.warnings.push(format!(
            "{} bytes of an incomplete frame at the tail; they are discarded on open",
            walk.torn_bytes
        ));
    }

    let mut last_sequence = None;
    for entry in &walk.frames {
        result.frames_checked += 1;
        let sequence = entry.frame.sequence;
        if let Some(last) = last_sequence {
            if sequence <= last {
                result.errors.push(format!(
                    "frame at offset {} has sequence {sequence} after {last}",
                    entry.offset
                ));
            }
        }
        last_sequence = Some(sequence);

        for op in &entry.frame.ops {
            result.ops_checked += 1;
            match op {
                JournalOp::Put { kind, .. } | JournalOp::Delete { kind, .. } => {
                    if manifest.kind_name(*kind).is_none() {
                        result.errors.push(format!(
                            "frame {sequence} writes kind {kind}, which the manifest does not register"
                        ));
                    }
                }
                JournalOp::SchemaVersion(version) => {
                    if *version > manifest.schema_version {
                        result.warnings.push(format!(
                            "frame {sequence} declares schema v{version}, newer than the manifest's v{}; the next open repairs the manifest",
                            manifest.schema_version
                        ));
                    }
                }
                JournalOp::KindName { kind, name } => {
                    if manifest.kind(name) != Some(*kind) {
                        result.warnings.push(format!(
                            "frame {sequence} names kind {kind} {name}, which the manifest does not; the next open repairs the manifest"
                        ));
                    }
                }
                JournalOp::KeyFloor { .. } => {}
            }
        }
    }

    result
}

fn print_result(result: &VerifyResult) {
    println!("  Frames checked:     {}", result.frames_checked);
    println!("  Operations checked: {}", result.ops_checked);

    for warning in &result.warnings {
        println!("  ! {warning}");
    }
    if !result.errors.is_empty() {
        println!("  Errors:");
        for error in result.errors.iter().take(10) {
            println!("    - {error}");
        }
        if result.errors.len() > 10 {
            println!("    ... and {} more", result.errors.len() - 10);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::journal::tests::sample_store;
    use faultdb_storage::StorageBackend;

    #[test]
    fn healthy_store_passes() {
        let (_temp, path) = sample_store();
        run(&path).unwrap();
    }

    #[test]
    fn flipped_byte_fails_verification() {
        let (_temp, path) = sample_store();
        let store = journal::open(&path).unwrap();
        let mut bytes = store.journal.read_at(0, store.journal.size().unwrap() as usize).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        store.journal.replace(&bytes).unwrap();

        let walk = journal::walk(&store.journal).unwrap();
        let result = check(&store.manifest, &walk);
        assert!(!result.is_ok());
        assert!(result.errors[0].contains("damaged frame"));
    }

    #[test]
    fn torn_tail_only_warns() {
        let (_temp, path) = sample_store();
        let store = journal::open(&path).unwrap();
        store.journal.append(b"FDB").unwrap();
        let walk = journal::walk(&store.journal).unwrap();
        let result = check(&store.manifest, &walk);
        assert!(result.is_ok());
        assert_eq!(result.warnings.len(), 1);
    }
}
