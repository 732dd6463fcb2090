//! # faultdb core
//!
//! An object-graph persistence engine with lazy loading.
//!
//! This crate provides:
//! - [`StoreCoordinator`]: one per store, shared by every context; owns the
//!   row journal, the shared [`RowCache`] and save notifications
//! - [`Context`]: a thread-affine working set of [`EntityHandle`]s with
//!   uniquing, change tracking, undo and merging of other contexts' saves
//! - faulting: handles load their row on first access, through the cache
//! - [`MergePolicy`]: conflict resolution at save
//! - schema versions and [`MigrationMapping`]s applied at open
//!
//! ## Usage
//!
//! ```rust
//! use faultdb_core::{
//!     AttributeDescription, AttributeType, EntityDescription, FetchRequest, Model, Predicate,
//!     StoreCoordinator, Value,
//! };
//!
//! let model = Model::new(1).entity(
//!     EntityDescription::new("Country")
//!         .attribute(AttributeDescription::new("name", AttributeType::Text))
//!         .attribute(AttributeDescription::new("code", AttributeType::Integer)),
//! );
//! let coordinator = StoreCoordinator::open_in_memory(model).unwrap();
//! let context = coordinator.new_context();
//!
//! let france = context.insert("Country").unwrap();
//! france.set("name", "France").unwrap();
//! france.set("code", 250).unwrap();
//! context.save().unwrap();
//!
//! let request = FetchRequest::new("Country").predicate(Predicate::eq("code", 250));
//! let found = context.fetch(&request).unwrap();
//! assert!(found[0].ptr_eq(&france));
//! assert_eq!(found[0].get("name").unwrap(), Value::from("France"));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod config;
mod context;
mod coordinator;
mod dir;
mod error;
mod identifier;
mod manifest;
mod merge;
mod migration;
mod model;
mod notification;
mod query;
mod row;
mod stats;
mod store;
mod types;

pub use cache::RowCache;
pub use config::{Config, InaccessibleFaultPolicy, MergeTrump};
pub use context::{Context, ContextQueue, EntityHandle, Faultable, HandleState};
pub use coordinator::{
    Changeset, CommitReceipt, PendingDelete, PendingUpdate, StoreCoordinator,
};
pub use dir::StoreDir;
pub use error::{ConflictRecord, CoreError, CoreResult, ValidationError, ValidationErrors};
pub use identifier::{ObjectId, ObjectKey};
pub use manifest::{Manifest, MANIFEST_MAGIC, MANIFEST_VERSION};
pub use merge::{
    merge_properties, CustomMerge, Fail, LocalWins, MergeFn, MergePolicy, MergeRejection,
    MostRecentWins, PropertyLocalWins, PropertyStoreWins, StoreWins,
};
pub use migration::{plan as migration_plan, MigrationMapping, MigrationStep, TransformFn};
pub use model::{
    AttributeDescription, AttributeType, AttributeValidatorFn, DeleteRule, EntityDescription,
    Model, ObjectValidatorFn, Property, RelationshipDescription, ValidationRule,
};
pub use notification::{NotificationCenter, SaveNotification};
pub use query::{compare_by, CancelToken, CompareOp, FetchRequest, Predicate, SortDescriptor};
pub use row::{Row, RowValues};
pub use stats::{EngineStats, StatsSnapshot};
pub use store::{
    read_frame, AppliedOp, CommitFrame, CommitOutcome, CompactionStats, EncodedFrame, FrameRead,
    JournalOp, RowSpan, RowStore, StoreSnapshot, WriteOp, CHECKSUM_LEN, FRAME_MAGIC,
    FRAME_VERSION, HEADER_LEN,
};
pub use types::{ContextId, KindId, SequenceNumber, StoreId, VersionToken};

pub use faultdb_codec::Value;

/// Version of the engine crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
