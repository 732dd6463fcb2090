//! Fuzz testing harnesses for faultdb.
//!
//! These functions can be driven by cargo-fuzz or by proptest. None of them
//! may panic on any input.

use crate::fixtures::world_model;
use faultdb_codec::{from_cbor, to_cbor, Value};
use faultdb_core::{
    read_frame, Config, Context, EntityHandle, FetchRequest, FrameRead, Predicate,
    StoreCoordinator,
};
use faultdb_storage::InMemoryBackend;

/// Fuzz target for frame decoding.
///
/// Arbitrary bytes either decode to a frame, report a torn frame, or fail
/// with an error.
pub fn fuzz_read_frame(data: &[u8]) {
    if let Ok(FrameRead::Frame { len, .. }) = read_frame(data) {
        assert!(len <= data.len(), "frame longer than its input");
    }
}

/// Fuzz target for opening a store over an arbitrary journal.
pub fn fuzz_journal_open(data: &[u8]) {
    let backend = InMemoryBackend::with_data(data.to_vec());
    let _ = StoreCoordinator::open_with_backend(Box::new(backend), world_model(), Config::default());
}

/// Fuzz target for value roundtrip.
pub fn fuzz_value_roundtrip(data: &[u8]) {
    if let Ok(value) = from_cbor::<Value>(data) {
        if let Ok(encoded) = to_cbor(&value) {
            let decoded: Value = from_cbor(&encoded).expect("Re-decoding must succeed");
            assert_eq!(
                format!("{value:?}"),
                format!("{decoded:?}"),
                "Roundtrip mismatch"
            );
        }
    }
}

/// Fuzz target for context operations.
///
/// Each input byte picks an operation on a small pool of countries. Errors
/// are fine; panics and broken uniquing are not.
pub fn fuzz_context_operations(data: &[u8]) {
    let Ok(coordinator) = StoreCoordinator::open_in_memory(world_model()) else {
        return;
    };
    let context = coordinator.new_context();
    let mut pool: Vec<EntityHandle> = Vec::new();

    for (i, byte) in data.iter().enumerate() {
        let pick = |pool: &[EntityHandle]| pool.get(usize::from(*byte >> 3) % pool.len().max(1)).cloned();
        match byte % 8 {
            0 => {
                if let Ok(country) = context.insert("Country") {
                    let _ = country.set("name", format!("C{i}"));
                    let _ = country.set("code", i64::from(*byte) + 1);
                    pool.push(country);
                }
            }
            1 => {
                if let Some(country) = pick(&pool) {
                    let _ = country.set("code", i64::from(*byte));
                }
            }
            2 => {
                if let Some(country) = pick(&pool) {
                    let _ = context.delete(&country);
                }
            }
            3 => {
                let _ = context.save();
            }
            4 => {
                let _ = context.rollback();
            }
            5 => {
                let request = FetchRequest::new("Country").predicate(Predicate::lt("code", i64::from(*byte)));
                if let Ok(found) = context.fetch(&request) {
                    check_unique(&context, &found);
                }
            }
            6 => {
                if let Some(country) = pick(&pool) {
                    let _ = context.refresh(&country, byte & 1 == 0);
                }
            }
            _ => {
                let _ = context.prefetch(&pool);
            }
        }
    }
}

fn check_unique(context: &Context, handles: &[EntityHandle]) {
    for handle in handles {
        if let Ok(again) = context.object_with_id(handle.id()) {
            assert!(again.ptr_eq(handle), "two handles for {}", handle.id());
        }
    }
}
