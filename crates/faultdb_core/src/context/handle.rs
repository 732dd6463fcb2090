//! Entity handles and faulting.
//!
//! An [`EntityHandle`] starts out as a fault: it knows its identifier and
//! nothing else. The first property access fulfills it from the row cache,
//! or from the store when the cache has no fresh row. Every accessor goes
//! through [`Faultable::ensure_materialized`] first.
//!
//! ```text
//! Fault ──(property access)──> Materialized ──(delete)──> Deleted
//!   │                               │
//!   └──(row missing on access)──────┴──> Invalid
//! ```
//!
//! Relationships are kept as identifiers and resolved through the owning
//! context's registry on access, so handles never hold each other strongly.

use super::{Context, ContextInner};
use crate::config::InaccessibleFaultPolicy;
use crate::coordinator::StoreCoordinator;
use crate::error::{CoreError, CoreResult};
use crate::identifier::ObjectId;
use crate::model::{EntityDescription, Property};
use crate::row::{Row, RowValues};
use crate::types::VersionToken;
use faultdb_codec::Value;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

/// Lifecycle state of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Identity only; values load on first access.
    Fault,
    /// Values are loaded.
    Materialized,
    /// Deleted in this context, or treated as deleted after its row vanished.
    Deleted,
    /// The backing row is confirmed gone.
    Invalid,
}

/// In-memory value of one relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Relation {
    One(Option<ObjectId>),
    Many(Vec<ObjectId>),
}

impl Relation {
    pub(crate) fn ids(&self) -> Vec<ObjectId> {
        match self {
            Self::One(id) => id.iter().copied().collect(),
            Self::Many(ids) => ids.clone(),
        }
    }

    pub(crate) fn contains(&self, id: &ObjectId) -> bool {
        match self {
            Self::One(current) => current.as_ref() == Some(id),
            Self::Many(ids) => ids.contains(id),
        }
    }

    /// Copy with `from` replaced by `to`, if present.
    pub(crate) fn rekeyed(&self, from: &ObjectId, to: ObjectId) -> Option<Self> {
        if !self.contains(from) {
            return None;
        }
        Some(match self {
            Self::One(_) => Self::One(Some(to)),
            Self::Many(ids) => Self::Many(
                ids.iter()
                    .map(|id| if id == from { to } else { *id })
                    .collect(),
            ),
        })
    }

    /// Copy without `id`.
    pub(crate) fn without(&self, id: &ObjectId) -> Self {
        match self {
            Self::One(Some(current)) if current == id => Self::One(None),
            Self::One(current) => Self::One(*current),
            Self::Many(ids) => Self::Many(ids.iter().filter(|m| *m != id).copied().collect()),
        }
    }
}

#[derive(Debug)]
pub(crate) struct HandleData {
    pub(crate) state: HandleState,
    pub(crate) values: RowValues,
    pub(crate) relations: BTreeMap<String, Relation>,
    pub(crate) snapshot: Option<Row>,
    pub(crate) pinned: bool,
}

pub(crate) struct HandleInner {
    pub(crate) id: RwLock<ObjectId>,
    pub(crate) entity: Arc<EntityDescription>,
    pub(crate) coordinator: Arc<StoreCoordinator>,
    pub(crate) context: Weak<ContextInner>,
    pub(crate) owner: ThreadId,
    pub(crate) data: Mutex<HandleData>,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        if self.data.get_mut().pinned {
            self.coordinator.cache().release(self.id.get_mut());
        }
    }
}

/// Splits a stored row into attribute values and relationships.
pub(crate) fn split_row(
    coordinator: &StoreCoordinator,
    entity: &EntityDescription,
    values: &RowValues,
) -> (RowValues, BTreeMap<String, Relation>) {
    let attributes = entity
        .attributes
        .iter()
        .map(|a| {
            let value = values.get(&a.name).cloned().unwrap_or(Value::Null);
            (a.name.clone(), value)
        })
        .collect();

    let store = coordinator.store_id();
    let mut relations = BTreeMap::new();
    for relationship in &entity.relationships {
        let Ok(kind) = coordinator.kind_of(&relationship.destination) else {
            continue;
        };
        let to_id = |value: &Value| {
            value
                .as_integer()
                .and_then(|pk| u64::try_from(pk).ok())
                .map(|pk| ObjectId::permanent(store, kind, pk))
        };
        let column = values.get(&relationship.name).unwrap_or(&Value::Null);
        let relation = if relationship.to_many {
            Relation::Many(
                column
                    .as_array()
                    .unwrap_or_default()
                    .iter()
                    .filter_map(to_id)
                    .collect(),
            )
        } else {
            Relation::One(to_id(column))
        };
        relations.insert(relationship.name.clone(), relation);
    }
    (attributes, relations)
}

fn key_value(id: &ObjectId) -> Option<Value> {
    id.primary_key()
        .and_then(|pk| i64::try_from(pk).ok())
        .map(Value::Integer)
}

/// Renders attribute values and relationships as a storable row.
///
/// Relationship members without a permanent key are left out.
pub(crate) fn render_row(values: &RowValues, relations: &BTreeMap<String, Relation>) -> RowValues {
    let mut row = values.clone();
    for (name, relation) in relations {
        let column = match relation {
            Relation::One(id) => id.as_ref().and_then(key_value).unwrap_or(Value::Null),
            Relation::Many(ids) => Value::Array(ids.iter().filter_map(key_value).collect()),
        };
        row.insert(name.clone(), column);
    }
    row
}

/// Lazy materialization contract of an object.
pub trait Faultable {
    /// Returns true while the object holds identity only.
    fn is_fault(&self) -> bool;

    /// Loads the object's values if it is a fault.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle` if the backing row is gone and the context
    /// uses the strict inaccessible-fault policy.
    fn ensure_materialized(&self) -> CoreResult<()>;
}

/// A context's in-memory representation of one persisted or pending object.
///
/// Cloning yields another reference to the same object; within a context
/// there is at most one live handle per identifier.
#[derive(Clone)]
pub struct EntityHandle {
    pub(crate) inner: Arc<HandleInner>,
}

impl fmt::Debug for EntityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.data.try_lock().map(|d| d.state);
        f.debug_struct("EntityHandle")
            .field("entity", &self.inner.entity.name)
            .field("id", &*self.inner.id.read())
            .field("state", &state)
            .finish()
    }
}

impl EntityHandle {
    pub(crate) fn new(
        id: ObjectId,
        entity: Arc<EntityDescription>,
        coordinator: Arc<StoreCoordinator>,
        context: Weak<ContextInner>,
        data: HandleData,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id: RwLock::new(id),
                entity,
                coordinator,
                context,
                owner: thread::current().id(),
                data: Mutex::new(data),
            }),
        }
    }

    pub(crate) fn fault(
        id: ObjectId,
        entity: Arc<EntityDescription>,
        coordinator: Arc<StoreCoordinator>,
        context: Weak<ContextInner>,
    ) -> Self {
        Self::new(
            id,
            entity,
            coordinator,
            context,
            HandleData {
                state: HandleState::Fault,
                values: RowValues::new(),
                relations: BTreeMap::new(),
                snapshot: None,
                pinned: false,
            },
        )
    }

    /// Current identifier. Changes once, from temporary to permanent, when
    /// the object is first saved.
    #[must_use]
    pub fn id(&self) -> ObjectId {
        *self.inner.id.read()
    }

    pub(crate) fn set_id(&self, id: ObjectId) {
        *self.inner.id.write() = id;
    }

    /// Entity name.
    #[must_use]
    pub fn entity_name(&self) -> &str {
        &self.inner.entity.name
    }

    /// Entity description.
    #[must_use]
    pub fn entity(&self) -> &Arc<EntityDescription> {
        &self.inner.entity
    }

    /// Returns true if both handles are the same object.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn check_thread(&self) -> CoreResult<()> {
        if thread::current().id() == self.inner.owner {
            Ok(())
        } else {
            Err(CoreError::CrossThreadAccess {
                what: "entity handle",
            })
        }
    }

    pub(crate) fn context(&self) -> CoreResult<Context> {
        self.inner
            .context
            .upgrade()
            .map(|inner| Context { inner })
            .ok_or_else(|| CoreError::invalid_operation("the handle's context has been dropped"))
    }

    pub(crate) fn belongs_to(&self, context: &Arc<ContextInner>) -> bool {
        std::ptr::eq(self.inner.context.as_ptr(), Arc::as_ptr(context))
    }

    /// Lifecycle state.
    ///
    /// # Errors
    ///
    /// Returns `CrossThreadAccess` off the owning thread.
    pub fn state(&self) -> CoreResult<HandleState> {
        self.check_thread()?;
        Ok(self.raw_state())
    }

    pub(crate) fn raw_state(&self) -> HandleState {
        self.inner.data.lock().state
    }

    /// Returns true if the object is deleted in its context.
    ///
    /// # Errors
    ///
    /// Returns `CrossThreadAccess` off the owning thread.
    pub fn is_deleted(&self) -> CoreResult<bool> {
        Ok(self.state()? == HandleState::Deleted)
    }

    /// Version of the committed row the handle is based on.
    ///
    /// # Errors
    ///
    /// Returns `CrossThreadAccess` off the owning thread.
    pub fn version(&self) -> CoreResult<Option<VersionToken>> {
        self.check_thread()?;
        Ok(self.inner.data.lock().snapshot.as_ref().map(Row::version))
    }

    fn will_access(&self) -> CoreResult<()> {
        self.check_thread()?;
        self.ensure_materialized()
    }

    fn did_access(&self) {
        self.inner.coordinator.cache().touch(&self.id());
    }

    /// Value of an attribute.
    ///
    /// # Errors
    ///
    /// - `CrossThreadAccess` off the owning thread
    /// - `InvalidHandle` if the row is gone under the strict policy
    /// - `UnknownAttribute`, or `InvalidOperation` for a relationship name
    pub fn get(&self, name: &str) -> CoreResult<Value> {
        self.will_access()?;
        if let Property::Relationship(_) = self.inner.entity.property(name)? {
            return Err(CoreError::invalid_operation(format!(
                "{name} is a relationship; use to_one or to_many"
            )));
        }
        let value = self
            .inner
            .data
            .lock()
            .values
            .get(name)
            .cloned()
            .unwrap_or(Value::Null);
        self.did_access();
        Ok(value)
    }

    /// Every attribute value.
    ///
    /// # Errors
    ///
    /// As for [`EntityHandle::get`].
    pub fn values(&self) -> CoreResult<RowValues> {
        self.will_access()?;
        let values = self.inner.data.lock().values.clone();
        self.did_access();
        Ok(values)
    }

    /// Sets an attribute. Type and rule checks run at save.
    ///
    /// # Errors
    ///
    /// As for [`EntityHandle::get`], plus `InvalidOperation` on a deleted
    /// object.
    pub fn set(&self, name: &str, value: impl Into<Value>) -> CoreResult<()> {
        self.will_access()?;
        self.context()?.set_attribute(self, name, value.into())
    }

    pub(crate) fn relation(&self, name: &str) -> Option<Relation> {
        self.inner.data.lock().relations.get(name).cloned()
    }

    fn relationship_ids(&self, name: &str, to_many: bool) -> CoreResult<Vec<ObjectId>> {
        self.will_access()?;
        let relationship = self
            .inner
            .entity
            .relationship_named(name)
            .ok_or_else(|| CoreError::unknown_attribute(&self.inner.entity.name, name))?;
        if relationship.to_many != to_many {
            return Err(CoreError::invalid_operation(format!(
                "{}.{name} is a to-{} relationship",
                self.inner.entity.name,
                if relationship.to_many { "many" } else { "one" }
            )));
        }
        self.inner.coordinator.engine_stats().record_relationship_fault();
        let ids = self.relation(name).map(|r| r.ids()).unwrap_or_default();
        self.did_access();
        Ok(ids)
    }

    /// Destination of a to-one relationship, as a fault unless already
    /// registered in the context.
    ///
    /// # Errors
    ///
    /// As for [`EntityHandle::get`].
    pub fn to_one(&self, name: &str) -> CoreResult<Option<EntityHandle>> {
        let ids = self.relationship_ids(name, false)?;
        match ids.first() {
            Some(id) => Ok(Some(self.context()?.object_with_id(*id)?)),
            None => Ok(None),
        }
    }

    /// Identifiers of a to-many relationship, without touching the members.
    ///
    /// # Errors
    ///
    /// As for [`EntityHandle::get`].
    pub fn to_many_ids(&self, name: &str) -> CoreResult<Vec<ObjectId>> {
        self.relationship_ids(name, true)
    }

    /// Members of a to-many relationship. Members stay faults until accessed.
    ///
    /// # Errors
    ///
    /// As for [`EntityHandle::get`].
    pub fn to_many(&self, name: &str) -> CoreResult<Vec<EntityHandle>> {
        let ids = self.relationship_ids(name, true)?;
        let context = self.context()?;
        ids.into_iter().map(|id| context.object_with_id(id)).collect()
    }

    /// Sets a to-one relationship, keeping its inverse in step.
    ///
    /// # Errors
    ///
    /// As for [`EntityHandle::set`], plus `InvalidOperation` for a target of
    /// the wrong entity or from another context.
    pub fn set_to_one(&self, name: &str, target: Option<&EntityHandle>) -> CoreResult<()> {
        self.will_access()?;
        self.context()?.set_to_one(self, name, target)
    }

    /// Adds a member to a to-many relationship.
    ///
    /// # Errors
    ///
    /// As for [`EntityHandle::set_to_one`].
    pub fn add_to_many(&self, name: &str, member: &EntityHandle) -> CoreResult<()> {
        self.will_access()?;
        self.context()?.add_to_many(self, name, member)
    }

    /// Removes a member from a to-many relationship.
    ///
    /// # Errors
    ///
    /// As for [`EntityHandle::set_to_one`].
    pub fn remove_from_many(&self, name: &str, member: &EntityHandle) -> CoreResult<()> {
        self.will_access()?;
        self.context()?.remove_from_many(self, name, member)
    }

    /// The object as it would be written, relationships as primary keys.
    pub(crate) fn rendered(&self) -> RowValues {
        let data = self.inner.data.lock();
        render_row(&data.values, &data.relations)
    }

    /// Columns that differ from the committed row. New objects report every
    /// column.
    ///
    /// # Errors
    ///
    /// As for [`EntityHandle::get`].
    pub fn changed_values(&self) -> CoreResult<RowValues> {
        self.will_access()?;
        let data = self.inner.data.lock();
        let current = render_row(&data.values, &data.relations);
        Ok(match &data.snapshot {
            None => current,
            Some(snapshot) => current
                .into_iter()
                .filter(|(name, value)| snapshot.get(name).unwrap_or(&Value::Null) != value)
                .collect(),
        })
    }

    /// The committed row the handle is based on, `None` for new objects.
    ///
    /// # Errors
    ///
    /// As for [`EntityHandle::get`].
    pub fn committed_values(&self) -> CoreResult<Option<RowValues>> {
        self.will_access()?;
        Ok(self
            .inner
            .data
            .lock()
            .snapshot
            .as_ref()
            .map(|row| row.values().clone()))
    }

    /// Loads `row` into the handle and pins its cache entry.
    pub(crate) fn fill(&self, data: &mut HandleData, row: &Row) {
        let (values, relations) = split_row(&self.inner.coordinator, &self.inner.entity, row.values());
        data.values = values;
        data.relations = relations;
        data.snapshot = Some(row.clone());
        data.state = HandleState::Materialized;
        if !data.pinned {
            let id = self.id();
            let cache = self.inner.coordinator.cache();
            data.pinned = cache.retain(&id);
            if !data.pinned && !id.is_temporary() {
                tracing::debug!(id = %id, "row evicted before pinning, reinserting");
                cache.put_retained(id, row.clone());
                data.pinned = true;
            }
        }
    }

    pub(crate) fn unpin(&self, data: &mut HandleData) {
        if data.pinned {
            self.inner.coordinator.cache().release(&self.id());
            data.pinned = false;
        }
    }

    /// Turns the handle back into a fault, dropping loaded values.
    pub(crate) fn refault(&self) {
        let mut data = self.inner.data.lock();
        if matches!(data.state, HandleState::Materialized) {
            self.unpin(&mut data);
            data.state = HandleState::Fault;
            data.values.clear();
            data.relations.clear();
            data.snapshot = None;
        }
    }

    fn inaccessible(&self, data: &mut HandleData, policy: InaccessibleFaultPolicy) -> CoreResult<()> {
        match policy {
            InaccessibleFaultPolicy::Error => {
                data.state = HandleState::Invalid;
                Err(CoreError::InvalidHandle { id: self.id() })
            }
            InaccessibleFaultPolicy::TreatAsDeleted => {
                self.unpin(data);
                data.state = HandleState::Deleted;
                data.values = self
                    .inner
                    .entity
                    .attributes
                    .iter()
                    .map(|a| (a.name.clone(), a.attribute_type.empty_value()))
                    .collect();
                data.relations = self
                    .inner
                    .entity
                    .relationships
                    .iter()
                    .map(|r| {
                        let empty = if r.to_many {
                            Relation::Many(Vec::new())
                        } else {
                            Relation::One(None)
                        };
                        (r.name.clone(), empty)
                    })
                    .collect();
                Ok(())
            }
        }
    }
}

impl Faultable for EntityHandle {
    fn is_fault(&self) -> bool {
        self.raw_state() == HandleState::Fault
    }

    fn ensure_materialized(&self) -> CoreResult<()> {
        self.check_thread()?;
        let context = self.context()?;
        let (staleness, policy) = context.access_settings();

        match self.raw_state() {
            HandleState::Materialized | HandleState::Deleted => return Ok(()),
            HandleState::Invalid => return self.inaccessible(&mut self.inner.data.lock(), policy),
            HandleState::Fault => {}
        }

        let id = self.id();
        let row = self.inner.coordinator.row_for(&id, staleness)?;
        let mut data = self.inner.data.lock();
        if data.state != HandleState::Fault {
            return Ok(());
        }
        match row {
            Some(row) => {
                self.fill(&mut data, &row);
                self.inner.coordinator.engine_stats().record_fault_fulfilled();
                tracing::debug!(%id, "fault fulfilled");
                Ok(())
            }
            None => {
                tracing::debug!(%id, "fault target missing");
                self.inaccessible(&mut data, policy)
            }
        }
    }
}
