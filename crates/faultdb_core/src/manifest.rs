//! Store manifest.

use crate::error::{CoreError, CoreResult};
use crate::types::{KindId, StoreId};
use faultdb_codec::{from_cbor, to_cbor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Magic bytes for manifest file.
pub const MANIFEST_MAGIC: [u8; 4] = *b"FDBM";

/// Current manifest version.
pub const MANIFEST_VERSION: u16 = 1;

/// Store metadata kept next to the journal.
///
/// The manifest stores:
/// - Format version
/// - Store identity
/// - Schema version the rows were written under
/// - Entity name to kind id registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Format version (major, minor).
    pub format_version: (u16, u16),
    /// Stable identity of the store.
    pub store_id: StoreId,
    /// Schema version at creation or at the last migration.
    pub schema_version: u32,
    /// Entity name to kind id.
    pub kinds: BTreeMap<String, KindId>,
    /// Next kind id to assign.
    pub next_kind: u32,
}

impl Manifest {
    /// Creates a manifest for a fresh store.
    #[must_use]
    pub fn new(format_version: (u16, u16), schema_version: u32) -> Self {
        Self {
            format_version,
            store_id: StoreId::generate(),
            schema_version,
            kinds: BTreeMap::new(),
            next_kind: 1,
        }
    }

    /// Gets or assigns the kind id of an entity name.
    pub fn get_or_register_kind(&mut self, name: &str) -> KindId {
        if let Some(&kind) = self.kinds.get(name) {
            return kind;
        }
        let kind = KindId(self.next_kind);
        self.next_kind += 1;
        self.kinds.insert(name.to_string(), kind);
        kind
    }

    /// Gets the kind id of an entity name.
    #[must_use]
    pub fn kind(&self, name: &str) -> Option<KindId> {
        self.kinds.get(name).copied()
    }

    /// Entity name registered for a kind id.
    #[must_use]
    pub fn kind_name(&self, kind: KindId) -> Option<&str> {
        self.kinds
            .iter()
            .find(|(_, &k)| k == kind)
            .map(|(name, _)| name.as_str())
    }

    /// Moves a kind id to a new entity name.
    ///
    /// Renaming to the current name, or renaming a name that already moved,
    /// is a no-op so an interrupted migration can be replayed.
    ///
    /// # Errors
    ///
    /// Returns an error if neither name is registered, or the target name is
    /// taken by a different kind.
    pub fn rename_kind(&mut self, from: &str, to: &str) -> CoreResult<()> {
        match (self.kinds.get(from).copied(), self.kinds.get(to).copied()) {
            (Some(kind), None) => {
                self.kinds.remove(from);
                self.kinds.insert(to.to_string(), kind);
                Ok(())
            }
            (None, Some(_)) => Ok(()),
            (Some(a), Some(b)) if a == b => Ok(()),
            (Some(_), Some(_)) => Err(CoreError::migration_failed(format!(
                "cannot rename {from} to {to}: {to} already exists"
            ))),
            (None, None) => Err(CoreError::migration_failed(format!(
                "cannot rename {from}: entity is not registered"
            ))),
        }
    }

    /// Encodes the manifest to bytes.
    ///
    /// # Errors
    ///
    /// Returns a codec error if serialization fails.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&MANIFEST_MAGIC);
        buf.extend_from_slice(&MANIFEST_VERSION.to_le_bytes());
        buf.extend_from_slice(&to_cbor(self)?);
        Ok(buf)
    }

    /// Decodes a manifest from bytes.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` for a bad header and a codec error for a bad body.
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        if data.len() < 6 || data[0..4] != MANIFEST_MAGIC {
            return Err(CoreError::invalid_format("invalid manifest magic"));
        }
        let version = u16::from_le_bytes([data[4], data[5]]);
        if version > MANIFEST_VERSION {
            return Err(CoreError::invalid_format(format!(
                "unsupported manifest version: {version}"
            )));
        }
        Ok(from_cbor(&data[6..])?)
    }
}
