//! Schema migrations.
//!
//! A [`MigrationMapping`] moves a store from one schema version to the next.
//! It is applied by the row store as a single commit, so a crash leaves the
//! store either fully at `from_version` or fully at `to_version`.
//!
//! # Example
//!
//! ```rust,ignore
//! use faultdb_core::{MigrationMapping, MigrationStep, Value};
//!
//! let v1_to_v2 = MigrationMapping::new(1, 2)
//!     .step(MigrationStep::rename_entity("Nation", "Country"))
//!     .step(MigrationStep::add_attribute("Country", "population", Value::Integer(0)));
//!
//! let coordinator = StoreCoordinator::open_with_migrations(path, model_v2, config, &[v1_to_v2])?;
//! ```

use crate::error::{CoreError, CoreResult};
use crate::manifest::Manifest;
use crate::row::RowValues;
use crate::types::KindId;
use faultdb_codec::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Row rewrite function of a [`MigrationStep::Transform`].
pub type TransformFn = Arc<dyn Fn(&mut RowValues) -> CoreResult<()> + Send + Sync>;

/// One change applied by a migration.
#[derive(Clone)]
pub enum MigrationStep {
    /// Renames an entity. Rows keep their kind id.
    RenameEntity {
        /// Old name.
        from: String,
        /// New name.
        to: String,
    },
    /// Renames an attribute in every row of an entity.
    RenameAttribute {
        /// Entity name.
        entity: String,
        /// Old attribute name.
        from: String,
        /// New attribute name.
        to: String,
    },
    /// Adds an attribute to every row that lacks it.
    AddAttribute {
        /// Entity name.
        entity: String,
        /// Attribute name.
        attribute: String,
        /// Value written into existing rows.
        default: Value,
    },
    /// Drops an attribute from every row.
    RemoveAttribute {
        /// Entity name.
        entity: String,
        /// Attribute name.
        attribute: String,
    },
    /// Rewrites every row of an entity with a custom function.
    Transform {
        /// Entity name.
        entity: String,
        /// Rewrite.
        apply: TransformFn,
    },
}

impl fmt::Debug for MigrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RenameEntity { from, to } => write!(f, "RenameEntity({from} -> {to})"),
            Self::RenameAttribute { entity, from, to } => {
                write!(f, "RenameAttribute({entity}.{from} -> {to})")
            }
            Self::AddAttribute {
                entity,
                attribute,
                default,
            } => write!(f, "AddAttribute({entity}.{attribute} = {default})"),
            Self::RemoveAttribute { entity, attribute } => {
                write!(f, "RemoveAttribute({entity}.{attribute})")
            }
            Self::Transform { entity, .. } => write!(f, "Transform({entity})"),
        }
    }
}

impl MigrationStep {
    /// Renames an entity.
    pub fn rename_entity(from: &str, to: &str) -> Self {
        Self::RenameEntity {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Renames an attribute.
    pub fn rename_attribute(entity: &str, from: &str, to: &str) -> Self {
        Self::RenameAttribute {
            entity: entity.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Adds an attribute with a default for existing rows.
    pub fn add_attribute(entity: &str, attribute: &str, default: impl Into<Value>) -> Self {
        Self::AddAttribute {
            entity: entity.to_string(),
            attribute: attribute.to_string(),
            default: default.into(),
        }
    }

    /// Removes an attribute.
    pub fn remove_attribute(entity: &str, attribute: &str) -> Self {
        Self::RemoveAttribute {
            entity: entity.to_string(),
            attribute: attribute.to_string(),
        }
    }

    /// Rewrites rows with `apply`.
    pub fn transform<F>(entity: &str, apply: F) -> Self
    where
        F: Fn(&mut RowValues) -> CoreResult<()> + Send + Sync + 'static,
    {
        Self::Transform {
            entity: entity.to_string(),
            apply: Arc::new(apply),
        }
    }
}

/// Steps taking a store from `from_version` to `to_version`.
#[derive(Debug, Clone)]
pub struct MigrationMapping {
    /// Schema version the store must be at.
    pub from_version: u32,
    /// Schema version after the mapping.
    pub to_version: u32,
    /// Steps, applied in order.
    pub steps: Vec<MigrationStep>,
}

impl MigrationMapping {
    /// Creates an empty mapping.
    #[must_use]
    pub fn new(from_version: u32, to_version: u32) -> Self {
        Self {
            from_version,
            to_version,
            steps: Vec::new(),
        }
    }

    /// Appends a step.
    #[must_use]
    pub fn step(mut self, step: MigrationStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Applies the steps to an in-memory copy of the store.
    ///
    /// Entity renames update `manifest`; every other step rewrites `rows`.
    /// Returns the keys of the rows that changed.
    ///
    /// # Errors
    ///
    /// Returns `MigrationFailed` if a step names an unknown entity or a
    /// transform fails.
    pub fn apply(
        &self,
        manifest: &mut Manifest,
        rows: &mut BTreeMap<(KindId, u64), RowValues>,
    ) -> CoreResult<BTreeSet<(KindId, u64)>> {
        let mut changed = BTreeSet::new();
        for step in &self.steps {
            let entity = match step {
                MigrationStep::RenameEntity { from, to } => {
                    manifest.rename_kind(from, to)?;
                    continue;
                }
                MigrationStep::RenameAttribute { entity, .. }
                | MigrationStep::AddAttribute { entity, .. }
                | MigrationStep::RemoveAttribute { entity, .. }
                | MigrationStep::Transform { entity, .. } => entity,
            };
            let kind = manifest.kind(entity).ok_or_else(|| {
                CoreError::migration_failed(format!("{step:?} names unknown entity {entity}"))
            })?;

            for (&key, values) in rows.range_mut((kind, 0)..=(kind, u64::MAX)) {
                let touched = match step {
                    MigrationStep::RenameAttribute { from, to, .. } => match values.remove(from) {
                        Some(value) => {
                            values.insert(to.clone(), value);
                            true
                        }
                        None => false,
                    },
                    MigrationStep::AddAttribute {
                        attribute, default, ..
                    } => {
                        if values.contains_key(attribute) {
                            false
                        } else {
                            values.insert(attribute.clone(), default.clone());
                            true
                        }
                    }
                    MigrationStep::RemoveAttribute { attribute, .. } => {
                        values.remove(attribute).is_some()
                    }
                    MigrationStep::Transform { apply, .. } => {
                        let before = values.clone();
                        apply(values).map_err(|e| {
                            CoreError::migration_failed(format!("transform of {entity} failed: {e}"))
                        })?;
                        *values != before
                    }
                    MigrationStep::RenameEntity { .. } => false,
                };
                if touched {
                    changed.insert(key);
                }
            }
        }
        manifest.schema_version = self.to_version;
        Ok(changed)
    }
}

/// Orders mappings into a chain from `from` to `to`.
///
/// # Errors
///
/// Returns `SchemaMismatch` if no chain of mappings connects the versions.
pub fn plan(mappings: &[MigrationMapping], from: u32, to: u32) -> CoreResult<Vec<&MigrationMapping>> {
    let mut chain = Vec::new();
    let mut current = from;
    while current != to {
        let next = mappings
            .iter()
            .find(|m| m.from_version == current && m.to_version != current)
            .ok_or(CoreError::SchemaMismatch {
                store: from,
                model: to,
            })?;
        if chain.len() > mappings.len() {
            return Err(CoreError::SchemaMismatch {
                store: from,
                model: to,
            });
        }
        chain.push(next);
        current = next.to_version;
    }
    Ok(chain)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (Manifest, BTreeMap<(KindId, u64), RowValues>) {
        let mut manifest = Manifest::new((1, 0), 1);
        let nation = manifest.get_or_register_kind("Nation");
        let mut rows = BTreeMap::new();
        for (key, name) in [(1, "France"), (2, "Peru")] {
            let mut values = RowValues::new();
            values.insert("title".into(), Value::from(name));
            values.insert("legacy".into(), Value::Bool(true));
            rows.insert((nation, key), values);
        }
        (manifest, rows)
    }

    #[test]
    fn steps_apply_in_order() {
        let (mut manifest, mut rows) = store();
        let mapping = MigrationMapping::new(1, 2)
            .step(MigrationStep::rename_entity("Nation", "Country"))
            .step(MigrationStep::rename_attribute("Country", "title", "name"))
            .step(MigrationStep::remove_attribute("Country", "legacy"))
            .step(MigrationStep::add_attribute("Country", "code", 0))
            .step(MigrationStep::transform("Country", |values| {
                if values.get("name") == Some(&Value::from("France")) {
                    values.insert("code".into(), Value::Integer(250));
                }
                Ok(())
            }));

        let changed = mapping.apply(&mut manifest, &mut rows).unwrap();
        assert_eq!(changed.len(), 2);
        assert_eq!(manifest.schema_version, 2);
        let kind = manifest.kind("Country").unwrap();
        let france = &rows[&(kind, 1)];
        assert_eq!(france.get("code"), Some(&Value::Integer(250)));
        assert!(france.get("legacy").is_none());
        assert_eq!(rows[&(kind, 2)].get("code"), Some(&Value::Integer(0)));
    }

    #[test]
    fn unknown_entity_fails() {
        let (mut manifest, mut rows) = store();
        let mapping =
            MigrationMapping::new(1, 2).step(MigrationStep::remove_attribute("Planet", "x"));
        assert!(matches!(
            mapping.apply(&mut manifest, &mut rows),
            Err(CoreError::MigrationFailed { .. })
        ));
    }

    #[test]
    fn plan_chains_versions() {
        let mappings = vec![MigrationMapping::new(2, 3), MigrationMapping::new(1, 2)];
        let chain = plan(&mappings, 1, 3).unwrap();
        assert_eq!(
            chain.iter().map(|m| m.to_version).collect::<Vec<_>>(),
            vec![2, 3]
        );
        assert!(plan(&mappings, 1, 1).unwrap().is_empty());
        assert!(matches!(
            plan(&mappings, 1, 4),
            Err(CoreError::SchemaMismatch { store: 1, model: 4 })
        ));
    }
}
