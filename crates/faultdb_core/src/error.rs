//! Error types for faultdb core.

use crate::identifier::ObjectId;
use crate::row::Row;
use std::fmt;
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// A single failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// The object that failed.
    pub id: ObjectId,
    /// Entity name of the object.
    pub entity: String,
    /// The attribute or relationship, `None` for object-level validators.
    pub attribute: Option<String>,
    /// Human readable reason.
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.attribute {
            Some(attribute) => write!(f, "{}.{} ({}): {}", self.entity, attribute, self.id, self.message),
            None => write!(f, "{} ({}): {}", self.entity, self.id, self.message),
        }
    }
}

/// Every validation failure found by one save.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl ValidationErrors {
    /// Returns true if nothing failed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of failures.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterates over the failures.
    pub fn iter(&self) -> impl Iterator<Item = &ValidationError> {
        self.0.iter()
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, error) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{error}")?;
        }
        Ok(())
    }
}

/// A divergence the merge policy refused to resolve.
///
/// `None` for `store` means the row was deleted in the store; `None` for
/// `local` means the context was deleting the row.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictRecord {
    /// The object in conflict.
    pub id: ObjectId,
    /// The row the context tried to write.
    pub local: Option<Row>,
    /// The row currently in the store.
    pub store: Option<Row>,
    /// The committed row the context last saw.
    pub snapshot: Option<Row>,
    /// Why the policy rejected it.
    pub reason: String,
}

/// Errors that can occur in faultdb core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// One or more validators failed during save.
    #[error("validation failed: {0}")]
    Validation(ValidationErrors),

    /// The merge policy did not resolve a save conflict.
    #[error("save conflict on {} object(s)", conflicts.len())]
    Conflict {
        /// Every unresolved conflict of the save.
        conflicts: Vec<ConflictRecord>,
    },

    /// The handle's backing row is gone.
    #[error("invalid handle: row for {id} no longer exists")]
    InvalidHandle {
        /// Identifier of the dead row.
        id: ObjectId,
    },

    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] faultdb_storage::StorageError),

    /// CBOR codec error.
    #[error("codec error: {0}")]
    Codec(#[from] faultdb_codec::CodecError),

    /// I/O error outside the storage backend (directory, manifest).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A context or handle was touched from a thread that does not own it.
    #[error("cross-thread access: {what} is bound to another thread")]
    CrossThreadAccess {
        /// What was accessed.
        what: &'static str,
    },

    /// A fetch was cancelled through its token.
    #[error("operation cancelled")]
    Cancelled,

    /// A temporary identifier reached a context other than its owner.
    #[error("temporary identifier {id} used outside the context that created it")]
    TemporaryIdentifierShared {
        /// The leaked identifier.
        id: ObjectId,
    },

    /// The store's schema version differs from the model and no migration applies.
    #[error("schema mismatch: store is at version {store}, model expects {model}")]
    SchemaMismatch {
        /// Version recorded in the store.
        store: u32,
        /// Version of the in-process model.
        model: u32,
    },

    /// Database is already open or locked.
    #[error("database locked: another process has exclusive access")]
    DatabaseLocked,

    /// Invalid database format or version.
    #[error("invalid database format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// The journal holds a damaged frame.
    #[error("store corruption: {message}")]
    StoreCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// No entity with this name is in the model.
    #[error("unknown entity: {name}")]
    UnknownEntity {
        /// Requested entity name.
        name: String,
    },

    /// The entity has no attribute or relationship with this name.
    #[error("unknown attribute {attribute} on {entity}")]
    UnknownAttribute {
        /// Entity name.
        entity: String,
        /// Requested attribute name.
        attribute: String,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },

    /// Migration failed.
    #[error("migration failed: {message}")]
    MigrationFailed {
        /// Description of the failure.
        message: String,
    },
}

impl CoreError {
    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates a store corruption error.
    pub fn store_corruption(message: impl Into<String>) -> Self {
        Self::StoreCorruption {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a migration failed error.
    pub fn migration_failed(message: impl Into<String>) -> Self {
        Self::MigrationFailed {
            message: message.into(),
        }
    }

    /// Creates an unknown entity error.
    pub fn unknown_entity(name: impl Into<String>) -> Self {
        Self::UnknownEntity { name: name.into() }
    }

    /// Creates an unknown attribute error.
    pub fn unknown_attribute(entity: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self::UnknownAttribute {
            entity: entity.into(),
            attribute: attribute.into(),
        }
    }

    /// Returns true if the caller can fix its data and retry the save.
    ///
    /// Only validation and conflict failures qualify. Storage and threading
    /// errors must propagate.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::Conflict { .. })
    }
}
