//! Object identifiers.
//!
//! An [`ObjectId`] is the triple `(store, kind, key)`. Keys start out
//! temporary when a context inserts an object and become permanent when the
//! coordinator reserves a primary key for them, at the latest at the start of
//! the save that commits the object.

use crate::error::{CoreError, CoreResult};
use crate::types::{ContextId, KindId, StoreId};
use std::fmt;

/// The key part of an identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectKey {
    /// Store-wide unique primary key.
    Permanent(u64),
    /// Placeholder handed out at insertion, valid only in its context.
    Temporary {
        /// Context that allocated the key.
        context: ContextId,
        /// Allocation counter.
        serial: u64,
    },
}

/// Globally stable identity of a persisted or pending object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId {
    store: StoreId,
    kind: KindId,
    key: ObjectKey,
}

impl ObjectId {
    /// Creates an identifier from its parts.
    #[must_use]
    pub const fn new(store: StoreId, kind: KindId, key: ObjectKey) -> Self {
        Self { store, kind, key }
    }

    /// Creates a permanent identifier.
    #[must_use]
    pub const fn permanent(store: StoreId, kind: KindId, key: u64) -> Self {
        Self::new(store, kind, ObjectKey::Permanent(key))
    }

    /// The store this object lives in.
    #[must_use]
    pub const fn store(&self) -> StoreId {
        self.store
    }

    /// The entity kind.
    #[must_use]
    pub const fn kind(&self) -> KindId {
        self.kind
    }

    /// The key.
    #[must_use]
    pub const fn key(&self) -> ObjectKey {
        self.key
    }

    /// Returns true for a temporary identifier.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self.key, ObjectKey::Temporary { .. })
    }

    /// Primary key, if permanent.
    #[must_use]
    pub const fn primary_key(&self) -> Option<u64> {
        match self.key {
            ObjectKey::Permanent(pk) => Some(pk),
            ObjectKey::Temporary { .. } => None,
        }
    }

    /// Checks that this identifier may be used in `context`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TemporaryIdentifierShared`] for a temporary id
    /// allocated by another context.
    pub fn check_usable_in(&self, context: ContextId) -> CoreResult<()> {
        match self.key {
            ObjectKey::Temporary { context: owner, .. } if owner != context => {
                Err(CoreError::TemporaryIdentifierShared { id: *self })
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.key {
            ObjectKey::Permanent(pk) => {
                write!(f, "faultdb://{}/{}/p{}", self.store, self.kind.0, pk)
            }
            ObjectKey::Temporary { context, serial } => {
                write!(f, "faultdb://{}/{}/t{}-{}", self.store, self.kind.0, context.0, serial)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temporary_ids_stay_in_their_context() {
        let owner = ContextId(10);
        let id = ObjectId::new(
            StoreId::nil(),
            KindId(1),
            ObjectKey::Temporary {
                context: owner,
                serial: 1,
            },
        );
        assert!(id.is_temporary());
        assert!(id.check_usable_in(owner).is_ok());
        assert!(matches!(
            id.check_usable_in(ContextId(11)),
            Err(CoreError::TemporaryIdentifierShared { .. })
        ));
    }

    #[test]
    fn permanent_ids_travel_freely() {
        let id = ObjectId::permanent(StoreId::nil(), KindId(2), 250);
        assert_eq!(id.primary_key(), Some(250));
        assert!(id.check_usable_in(ContextId(99)).is_ok());
        assert!(id.to_string().ends_with("/2/p250"));
    }
}
