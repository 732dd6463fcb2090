//! # faultdb storage
//!
//! Byte-store backends for faultdb.
//!
//! The row journal of `faultdb_core` persists through a [`StorageBackend`].
//! Backends know nothing about frames, rows or identifiers: they hand out
//! bytes at offsets, append, and durably flush.
//!
//! ## Concurrency
//!
//! All trait methods take `&self`. Backends synchronize internally so that
//! readers holding committed offsets can keep reading while a single writer
//! appends the next commit. Appended bytes are never modified in place; only
//! [`StorageBackend::truncate`] and [`StorageBackend::replace`] rewrite
//! history, and the journal calls those with the writer lock held.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - ephemeral stores and tests
//! - [`FileBackend`] - a single OS file
//!
//! ## Example
//!
//! ```rust
//! use faultdb_storage::{InMemoryBackend, StorageBackend};
//!
//! let backend = InMemoryBackend::new();
//! let offset = backend.append(b"frame").unwrap();
//! assert_eq!(backend.read_at(offset, 5).unwrap(), b"frame");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
