//! Contexts: thread-affine working sets of entity handles.
//!
//! A [`Context`] keeps one handle per identifier (uniquing), tracks inserted,
//! updated and deleted objects until they are saved, and merges the saves of
//! other contexts when asked to. It is bound to the thread that created it;
//! every entry point checks the calling thread and fails with
//! `CrossThreadAccess` elsewhere. To drive a context from other threads, use
//! a [`ContextQueue`].
//!
//! Unmodified handles are held weakly by the registry and disappear when the
//! caller drops them. Modified handles are held strongly until saved or
//! rolled back.
//!
//! Locking: the context state lock is taken before any handle lock, and at
//! most one handle lock is held at a time.

mod handle;
mod queue;

pub use handle::{EntityHandle, Faultable, HandleState};
pub use queue::ContextQueue;

use crate::config::{InaccessibleFaultPolicy, MergeTrump};
use crate::coordinator::{Changeset, PendingDelete, PendingUpdate, StoreCoordinator};
use crate::error::{CoreError, CoreResult, ValidationError, ValidationErrors};
use crate::identifier::ObjectId;
use crate::merge::{merge_properties, MergePolicy, PropertyLocalWins};
use crate::model::{DeleteRule, Property, RelationshipDescription};
use crate::notification::SaveNotification;
use crate::query::{compare_by, FetchRequest};
use crate::row::{Row, RowValues};
use crate::types::ContextId;
use faultdb_codec::Value;
use handle::{render_row, split_row, HandleData, HandleInner, Relation};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

#[derive(Debug, Clone)]
struct ContextSettings {
    staleness: Duration,
    merge_policy: Arc<dyn MergePolicy>,
    trump: MergeTrump,
    inaccessible: InaccessibleFaultPolicy,
}

enum Slot {
    Strong(EntityHandle),
    Weak(Weak<HandleInner>),
}

impl Slot {
    fn get(&self) -> Option<EntityHandle> {
        match self {
            Self::Strong(handle) => Some(handle.clone()),
            Self::Weak(weak) => weak.upgrade().map(|inner| EntityHandle { inner }),
        }
    }
}

enum UndoChange {
    Attribute { name: String, old: Value },
    Relation { name: String, old: Relation },
    Inserted,
    Deleted { prior: HandleState },
}

struct UndoEntry {
    handle: EntityHandle,
    change: UndoChange,
}

#[derive(Default)]
struct ContextState {
    registry: HashMap<ObjectId, Slot>,
    inserted: BTreeSet<ObjectId>,
    updated: BTreeSet<ObjectId>,
    deleted: BTreeSet<ObjectId>,
    undo: Vec<UndoEntry>,
}

impl ContextState {
    fn lookup(&mut self, id: &ObjectId) -> Option<EntityHandle> {
        let found = self.registry.get(id).and_then(Slot::get);
        if found.is_none() {
            self.registry.remove(id);
        }
        found
    }

    fn hold(&mut self, handle: &EntityHandle) {
        self.registry
            .insert(handle.id(), Slot::Strong(handle.clone()));
    }

    fn mark_updated(&mut self, handle: &EntityHandle) {
        let id = handle.id();
        if !self.inserted.contains(&id) && !self.deleted.contains(&id) {
            self.updated.insert(id);
        }
        self.hold(handle);
    }

    fn has_changes(&self) -> bool {
        !(self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty())
    }

    fn live_handles(&self) -> Vec<EntityHandle> {
        self.registry.values().filter_map(Slot::get).collect()
    }

    /// Drops strong references to every clean handle.
    fn release_clean(&mut self) {
        for slot in self.registry.values_mut() {
            if let Slot::Strong(handle) = slot {
                *slot = Slot::Weak(Arc::downgrade(&handle.inner));
            }
        }
        self.registry.retain(|_, slot| match slot {
            Slot::Strong(_) => true,
            Slot::Weak(weak) => weak.strong_count() > 0,
        });
    }

    /// Replaces one relationship value, recording undo and marking dirty.
    fn replace_relation(&mut self, handle: &EntityHandle, name: &str, new: Relation) {
        let old = {
            let mut data = handle.inner.data.lock();
            match data.relations.insert(name.to_string(), new.clone()) {
                Some(old) if old == new => return,
                Some(old) => old,
                None => Relation::One(None),
            }
        };
        self.undo.push(UndoEntry {
            handle: handle.clone(),
            change: UndoChange::Relation {
                name: name.to_string(),
                old,
            },
        });
        self.mark_updated(handle);
    }
}

pub(crate) struct ContextInner {
    id: ContextId,
    owner: ThreadId,
    coordinator: Arc<StoreCoordinator>,
    settings: RwLock<ContextSettings>,
    state: Mutex<ContextState>,
}

/// A thread-affine working set over a [`StoreCoordinator`].
///
/// # Example
///
/// ```rust,ignore
/// let context = coordinator.new_context();
/// let france = context.insert("Country")?;
/// france.set("name", "France")?;
/// france.set("code", 250)?;
/// context.save()?;
///
/// let found = context.fetch(&FetchRequest::new("Country").predicate(Predicate::eq("code", 250)))?;
/// assert!(found[0].ptr_eq(&france));
/// ```
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Creates a context bound to the calling thread.
    #[must_use]
    pub fn new(coordinator: Arc<StoreCoordinator>) -> Self {
        let config = coordinator.config();
        let settings = ContextSettings {
            staleness: config.staleness_interval,
            merge_policy: Arc::new(PropertyLocalWins),
            trump: config.merge_trump,
            inaccessible: config.inaccessible_fault_policy,
        };
        let id = ContextId::next();
        tracing::debug!(context = id.0, "context created");
        Self {
            inner: Arc::new(ContextInner {
                id,
                owner: thread::current().id(),
                coordinator,
                settings: RwLock::new(settings),
                state: Mutex::new(ContextState::default()),
            }),
        }
    }

    /// Identity of this context, as reported in save notifications.
    #[must_use]
    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    /// The coordinator this context works against.
    #[must_use]
    pub fn coordinator(&self) -> &Arc<StoreCoordinator> {
        &self.inner.coordinator
    }

    fn check_thread(&self) -> CoreResult<()> {
        if thread::current().id() == self.inner.owner {
            Ok(())
        } else {
            Err(CoreError::CrossThreadAccess { what: "context" })
        }
    }

    fn check_handle(&self, handle: &EntityHandle) -> CoreResult<()> {
        self.check_thread()?;
        handle.check_thread()?;
        if handle.belongs_to(&self.inner) {
            Ok(())
        } else {
            Err(CoreError::invalid_operation(format!(
                "{} belongs to another context",
                handle.id()
            )))
        }
    }

    /// Runs `work` against this context after checking the calling thread.
    ///
    /// # Errors
    ///
    /// Returns `CrossThreadAccess` off the owning thread.
    pub fn perform<R>(&self, work: impl FnOnce(&Self) -> R) -> CoreResult<R> {
        self.check_thread()?;
        Ok(work(self))
    }

    pub(crate) fn access_settings(&self) -> (Duration, InaccessibleFaultPolicy) {
        let settings = self.inner.settings.read();
        (settings.staleness, settings.inaccessible)
    }

    /// Sets the policy used for conflicts at save.
    ///
    /// # Errors
    ///
    /// Returns `CrossThreadAccess` off the owning thread.
    pub fn set_merge_policy(&self, policy: Arc<dyn MergePolicy>) -> CoreResult<()> {
        self.check_thread()?;
        self.inner.settings.write().merge_policy = policy;
        Ok(())
    }

    /// Sets how old a cached row may be before faults go to the store.
    ///
    /// # Errors
    ///
    /// Returns `CrossThreadAccess` off the owning thread.
    pub fn set_staleness_interval(&self, interval: Duration) -> CoreResult<()> {
        self.check_thread()?;
        self.inner.settings.write().staleness = interval;
        Ok(())
    }

    /// Sets which side wins when merging another context's save into
    /// unsaved changes.
    ///
    /// # Errors
    ///
    /// Returns `CrossThreadAccess` off the owning thread.
    pub fn set_merge_trump(&self, trump: MergeTrump) -> CoreResult<()> {
        self.check_thread()?;
        self.inner.settings.write().trump = trump;
        Ok(())
    }

    /// Sets what accessing a fault with a vanished row does.
    ///
    /// # Errors
    ///
    /// Returns `CrossThreadAccess` off the owning thread.
    pub fn set_inaccessible_fault_policy(&self, policy: InaccessibleFaultPolicy) -> CoreResult<()> {
        self.check_thread()?;
        self.inner.settings.write().inaccessible = policy;
        Ok(())
    }

    fn handle_for(&self, state: &mut ContextState, id: ObjectId) -> CoreResult<EntityHandle> {
        if let Some(handle) = state.lookup(&id) {
            return Ok(handle);
        }
        id.check_usable_in(self.inner.id)?;
        if id.is_temporary() {
            return Err(CoreError::InvalidHandle { id });
        }
        if id.store() != self.inner.coordinator.store_id() {
            return Err(CoreError::invalid_operation(format!(
                "{id} belongs to another store"
            )));
        }
        let entity = Arc::clone(self.inner.coordinator.entity(id.kind())?);
        let handle = EntityHandle::fault(
            id,
            entity,
            Arc::clone(&self.inner.coordinator),
            Arc::downgrade(&self.inner),
        );
        state
            .registry
            .insert(id, Slot::Weak(Arc::downgrade(&handle.inner)));
        Ok(handle)
    }

    /// Handle for `id`, as a fault unless already registered. Does not touch
    /// the store.
    ///
    /// # Errors
    ///
    /// - `TemporaryIdentifierShared` for another context's temporary id
    /// - `InvalidHandle` for a temporary id this context no longer knows
    /// - `UnknownEntity` for a kind outside the model
    pub fn object_with_id(&self, id: ObjectId) -> CoreResult<EntityHandle> {
        self.check_thread()?;
        let mut state = self.inner.state.lock();
        self.handle_for(&mut state, id)
    }

    /// Materialized handle for `id`.
    ///
    /// # Errors
    ///
    /// As for [`Context::object_with_id`], plus `InvalidHandle` if no row
    /// exists under the strict policy.
    pub fn existing_object(&self, id: ObjectId) -> CoreResult<EntityHandle> {
        let handle = self.object_with_id(id)?;
        handle.ensure_materialized()?;
        Ok(handle)
    }

    /// Creates a new object of `entity` with its default values.
    ///
    /// # Errors
    ///
    /// Returns `UnknownEntity` if the model has no such entity.
    pub fn insert(&self, entity: &str) -> CoreResult<EntityHandle> {
        self.check_thread()?;
        let coordinator = &self.inner.coordinator;
        let kind = coordinator.kind_of(entity)?;
        let description = Arc::clone(coordinator.entity(kind)?);
        let id = coordinator.allocate_identifier(kind, self.inner.id);

        let relations = description
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
        let data = HandleData {
            state: HandleState::Materialized,
            values: description.initial_values(),
            relations,
            snapshot: None,
            pinned: false,
        };
        let handle = EntityHandle::new(
            id,
            description,
            Arc::clone(coordinator),
            Arc::downgrade(&self.inner),
            data,
        );

        let mut state = self.inner.state.lock();
        state.inserted.insert(id);
        state.hold(&handle);
        state.undo.push(UndoEntry {
            handle: handle.clone(),
            change: UndoChange::Inserted,
        });
        Ok(handle)
    }

    pub(crate) fn set_attribute(&self, handle: &EntityHandle, name: &str, value: Value) -> CoreResult<()> {
        self.check_handle(handle)?;
        match handle.entity().property(name)? {
            Property::Attribute(_) => {}
            Property::Relationship(_) => {
                return Err(CoreError::invalid_operation(format!(
                    "{name} is a relationship; use set_to_one or add_to_many"
                )))
            }
        }

        let mut state = self.inner.state.lock();
        let old = {
            let mut data = handle.inner.data.lock();
            if data.state != HandleState::Materialized {
                return Err(CoreError::invalid_operation(format!(
                    "cannot modify {} in state {:?}",
                    handle.id(),
                    data.state
                )));
            }
            let old = data
                .values
                .insert(name.to_string(), value.clone())
                .unwrap_or(Value::Null);
            if old == value {
                return Ok(());
            }
            old
        };
        state.undo.push(UndoEntry {
            handle: handle.clone(),
            change: UndoChange::Attribute {
                name: name.to_string(),
                old,
            },
        });
        state.mark_updated(handle);
        Ok(())
    }

    fn relationship<'a>(
        handle: &'a EntityHandle,
        name: &str,
        to_many: bool,
    ) -> CoreResult<&'a RelationshipDescription> {
        let relationship = handle
            .entity()
            .relationship_named(name)
            .ok_or_else(|| CoreError::unknown_attribute(handle.entity_name(), name))?;
        if relationship.to_many != to_many {
            return Err(CoreError::invalid_operation(format!(
                "{}.{name} is not a to-{} relationship",
                handle.entity_name(),
                if to_many { "many" } else { "one" }
            )));
        }
        Ok(relationship)
    }

    fn check_target(
        &self,
        relationship: &RelationshipDescription,
        target: &EntityHandle,
    ) -> CoreResult<()> {
        self.check_handle(target)?;
        if target.entity_name() != relationship.destination {
            return Err(CoreError::invalid_operation(format!(
                "{} expects {}, got {}",
                relationship.name,
                relationship.destination,
                target.entity_name()
            )));
        }
        target.ensure_materialized()?;
        if target.raw_state() != HandleState::Materialized {
            return Err(CoreError::invalid_operation(format!(
                "cannot relate to {} in state {:?}",
                target.id(),
                target.raw_state()
            )));
        }
        Ok(())
    }

    fn check_source(handle: &EntityHandle) -> CoreResult<()> {
        match handle.raw_state() {
            HandleState::Materialized => Ok(()),
            other => Err(CoreError::invalid_operation(format!(
                "cannot modify {} in state {other:?}",
                handle.id()
            ))),
        }
    }

    pub(crate) fn set_to_one(
        &self,
        handle: &EntityHandle,
        name: &str,
        target: Option<&EntityHandle>,
    ) -> CoreResult<()> {
        self.check_handle(handle)?;
        Self::check_source(handle)?;
        let relationship = Self::relationship(handle, name, false)?;
        if let Some(target) = target {
            self.check_target(relationship, target)?;
        }

        let mut state = self.inner.state.lock();
        let old = match handle.relation(name) {
            Some(Relation::One(old)) => old,
            _ => None,
        };
        let new = target.map(EntityHandle::id);
        if old == new {
            return Ok(());
        }
        state.replace_relation(handle, name, Relation::One(new));
        if let Some(inverse) = &relationship.inverse {
            if let Some(old) = old {
                let previous = self.handle_for(&mut state, old)?;
                self.detach(&mut state, &previous, inverse, &handle.id())?;
            }
            if let Some(target) = target {
                self.attach(&mut state, target, inverse, handle)?;
            }
        }
        Ok(())
    }

    pub(crate) fn add_to_many(
        &self,
        handle: &EntityHandle,
        name: &str,
        member: &EntityHandle,
    ) -> CoreResult<()> {
        self.check_handle(handle)?;
        Self::check_source(handle)?;
        let relationship = Self::relationship(handle, name, true)?;
        self.check_target(relationship, member)?;

        let mut state = self.inner.state.lock();
        let mut members = match handle.relation(name) {
            Some(Relation::Many(ids)) => ids,
            _ => Vec::new(),
        };
        if members.contains(&member.id()) {
            return Ok(());
        }
        members.push(member.id());
        state.replace_relation(handle, name, Relation::Many(members));
        if let Some(inverse) = &relationship.inverse {
            self.attach(&mut state, member, inverse, handle)?;
        }
        Ok(())
    }

    pub(crate) fn remove_from_many(
        &self,
        handle: &EntityHandle,
        name: &str,
        member: &EntityHandle,
    ) -> CoreResult<()> {
        self.check_handle(handle)?;
        self.check_handle(member)?;
        Self::check_source(handle)?;
        let relationship = Self::relationship(handle, name, true)?;

        let mut state = self.inner.state.lock();
        let current = handle.relation(name).unwrap_or(Relation::Many(Vec::new()));
        if !current.contains(&member.id()) {
            return Ok(());
        }
        state.replace_relation(handle, name, current.without(&member.id()));
        if let Some(inverse) = &relationship.inverse {
            self.detach(&mut state, member, inverse, &handle.id())?;
        }
        Ok(())
    }

    /// Makes `target`'s relationship `name` include `source`, without
    /// touching `source`. A to-one that pointed elsewhere is unhooked from
    /// its previous owner.
    fn attach(
        &self,
        state: &mut ContextState,
        target: &EntityHandle,
        name: &str,
        source: &EntityHandle,
    ) -> CoreResult<()> {
        target.ensure_materialized()?;
        let Some(relationship) = target.entity().relationship_named(name) else {
            return Ok(());
        };
        let source_id = source.id();
        if relationship.to_many {
            let mut members = match target.relation(name) {
                Some(Relation::Many(ids)) => ids,
                _ => Vec::new(),
            };
            if !members.contains(&source_id) {
                members.push(source_id);
                state.replace_relation(target, name, Relation::Many(members));
            }
            return Ok(());
        }

        let previous = match target.relation(name) {
            Some(Relation::One(previous)) => previous,
            _ => None,
        };
        if previous == Some(source_id) {
            return Ok(());
        }
        state.replace_relation(target, name, Relation::One(Some(source_id)));
        if let (Some(previous), Some(forward)) = (previous, &relationship.inverse) {
            let owner = self.handle_for(state, previous)?;
            self.detach(state, &owner, forward, &target.id())?;
        }
        Ok(())
    }

    /// Removes `other` from `handle`'s relationship `name`, without touching
    /// `other`. Handles whose row is gone are skipped.
    fn detach(
        &self,
        state: &mut ContextState,
        handle: &EntityHandle,
        name: &str,
        other: &ObjectId,
    ) -> CoreResult<()> {
        match handle.ensure_materialized() {
            Ok(()) => {}
            Err(CoreError::InvalidHandle { .. }) => return Ok(()),
            Err(e) => return Err(e),
        }
        if handle.raw_state() != HandleState::Materialized {
            return Ok(());
        }
        if let Some(current) = handle.relation(name) {
            if current.contains(other) {
                state.replace_relation(handle, name, current.without(other));
            }
        }
        Ok(())
    }

    /// Marks an object for deletion, applying its relationships' delete
    /// rules. `Deny` is checked at save.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle` if the object's row is already gone, or an
    /// error from a cascaded deletion.
    pub fn delete(&self, handle: &EntityHandle) -> CoreResult<()> {
        self.check_handle(handle)?;
        handle.ensure_materialized()?;
        let mut state = self.inner.state.lock();
        self.delete_locked(&mut state, handle)
    }

    fn delete_locked(&self, state: &mut ContextState, handle: &EntityHandle) -> CoreResult<()> {
        let prior = handle.raw_state();
        if prior != HandleState::Materialized {
            return Ok(());
        }
        let id = handle.id();
        handle.inner.data.lock().state = HandleState::Deleted;
        state.undo.push(UndoEntry {
            handle: handle.clone(),
            change: UndoChange::Deleted { prior },
        });
        if !state.inserted.remove(&id) {
            state.deleted.insert(id);
        }
        state.hold(handle);

        for relationship in &handle.entity().relationships {
            let members = handle
                .relation(&relationship.name)
                .map(|r| r.ids())
                .unwrap_or_default();
            match relationship.delete_rule {
                DeleteRule::Nullify => {
                    if let Some(inverse) = &relationship.inverse {
                        for member in members {
                            let other = self.handle_for(state, member)?;
                            self.detach(state, &other, inverse, &id)?;
                        }
                    }
                }
                DeleteRule::Cascade => {
                    for member in members {
                        let other = self.handle_for(state, member)?;
                        match other.ensure_materialized() {
                            Ok(()) => self.delete_locked(state, &other)?,
                            Err(CoreError::InvalidHandle { .. }) => {}
                            Err(e) => return Err(e),
                        }
                    }
                }
                DeleteRule::Deny | DeleteRule::NoAction => {}
            }
        }
        Ok(())
    }

    /// Returns true if there are unsaved changes.
    ///
    /// # Errors
    ///
    /// Returns `CrossThreadAccess` off the owning thread.
    pub fn has_changes(&self) -> CoreResult<bool> {
        self.check_thread()?;
        Ok(self.inner.state.lock().has_changes())
    }

    fn handles_in(&self, pick: impl Fn(&ContextState) -> &BTreeSet<ObjectId>) -> CoreResult<Vec<EntityHandle>> {
        self.check_thread()?;
        let mut state = self.inner.state.lock();
        let ids: Vec<ObjectId> = pick(&*state).iter().copied().collect();
        Ok(ids.iter().filter_map(|id| state.lookup(id)).collect())
    }

    /// Objects inserted since the last save.
    ///
    /// # Errors
    ///
    /// Returns `CrossThreadAccess` off the owning thread.
    pub fn inserted_objects(&self) -> CoreResult<Vec<EntityHandle>> {
        self.handles_in(|s| &s.inserted)
    }

    /// Objects updated since the last save.
    ///
    /// # Errors
    ///
    /// Returns `CrossThreadAccess` off the owning thread.
    pub fn updated_objects(&self) -> CoreResult<Vec<EntityHandle>> {
        self.handles_in(|s| &s.updated)
    }

    /// Objects deleted since the last save.
    ///
    /// # Errors
    ///
    /// Returns `CrossThreadAccess` off the owning thread.
    pub fn deleted_objects(&self) -> CoreResult<Vec<EntityHandle>> {
        self.handles_in(|s| &s.deleted)
    }

    /// Number of live handles registered in this context.
    ///
    /// # Errors
    ///
    /// Returns `CrossThreadAccess` off the owning thread.
    pub fn registered_count(&self) -> CoreResult<usize> {
        self.check_thread()?;
        let mut state = self.inner.state.lock();
        state.release_dead();
        Ok(state.registry.len())
    }

    /// Matching objects with their rows, after overlaying unsaved changes,
    /// sorting and paging.
    fn matching(
        &self,
        state: &mut ContextState,
        request: &FetchRequest,
        populate_cache: bool,
    ) -> CoreResult<Vec<(ObjectId, Option<Arc<Row>>)>> {
        let coordinator = &self.inner.coordinator;
        let kind = coordinator.kind_of(&request.entity)?;
        let rows = coordinator.fetch(request, populate_cache)?;

        let mut candidates: Vec<(ObjectId, RowValues, Option<Arc<Row>>)> = Vec::with_capacity(rows.len());
        if request.include_pending_changes {
            let mut seen = HashSet::with_capacity(rows.len());
            for (id, row) in rows {
                seen.insert(id);
                if state.deleted.contains(&id) {
                    continue;
                }
                if state.updated.contains(&id) {
                    if let Some(handle) = state.lookup(&id) {
                        let values = handle.rendered();
                        if request.predicate.evaluate(&values) {
                            candidates.push((id, values, Some(row)));
                        }
                        continue;
                    }
                }
                candidates.push((id, row.values().clone(), Some(row)));
            }

            let pending: Vec<ObjectId> = state
                .inserted
                .iter()
                .chain(&state.updated)
                .filter(|id| id.kind() == kind && !seen.contains(*id) && !state.deleted.contains(*id))
                .copied()
                .collect();
            for id in pending {
                if let Some(handle) = state.lookup(&id) {
                    let values = handle.rendered();
                    if request.predicate.evaluate(&values) {
                        candidates.push((id, values, None));
                    }
                }
            }
        } else {
            candidates.extend(rows.into_iter().map(|(id, row)| (id, row.values().clone(), Some(row))));
        }

        request.check_cancelled()?;
        if !request.sort.is_empty() {
            candidates.sort_by(|a, b| compare_by(&request.sort, &a.1, &b.1));
        }
        Ok(request
            .page(candidates)
            .into_iter()
            .map(|(id, _, row)| (id, row))
            .collect())
    }

    /// Runs a fetch and returns handles.
    ///
    /// Unsaved inserts, updates and deletes of this context are reflected
    /// unless the request turns that off. Handles are faults unless the
    /// request asks otherwise; fetched rows land in the row cache either way.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if the request's token fires, `UnknownEntity`, or
    /// a store error.
    pub fn fetch(&self, request: &FetchRequest) -> CoreResult<Vec<EntityHandle>> {
        self.check_thread()?;
        let handles = {
            let mut state = self.inner.state.lock();
            let matches = self.matching(&mut state, request, true)?;
            let mut handles = Vec::with_capacity(matches.len());
            for (id, row) in matches {
                let handle = self.handle_for(&mut state, id)?;
                if !request.returns_faults {
                    if let Some(row) = row {
                        let mut data = handle.inner.data.lock();
                        if data.state == HandleState::Fault {
                            handle.fill(&mut data, &row);
                        }
                    }
                }
                handles.push(handle);
            }
            handles
        };
        for relationship in &request.prefetch {
            self.prefetch_relationship(&handles, relationship)?;
        }
        tracing::debug!(
            context = self.inner.id.0,
            entity = %request.entity,
            results = handles.len(),
            "context fetch"
        );
        Ok(handles)
    }

    /// Runs a fetch and returns identifiers only. Nothing is cached.
    ///
    /// # Errors
    ///
    /// As for [`Context::fetch`].
    pub fn fetch_ids(&self, request: &FetchRequest) -> CoreResult<Vec<ObjectId>> {
        self.check_thread()?;
        let mut state = self.inner.state.lock();
        Ok(self
            .matching(&mut state, request, false)?
            .into_iter()
            .map(|(id, _)| id)
            .collect())
    }

    /// Number of objects a fetch would return.
    ///
    /// # Errors
    ///
    /// As for [`Context::fetch`].
    pub fn count(&self, request: &FetchRequest) -> CoreResult<usize> {
        Ok(self.fetch_ids(request)?.len())
    }

    /// Fulfills every fault among `handles` with at most one store query.
    ///
    /// Faults whose row is gone become invalid; the error surfaces when they
    /// are accessed.
    ///
    /// # Errors
    ///
    /// Returns a store error, or an ownership error for a foreign handle.
    pub fn prefetch(&self, handles: &[EntityHandle]) -> CoreResult<()> {
        self.check_thread()?;
        let mut faults = Vec::new();
        for handle in handles {
            self.check_handle(handle)?;
            if handle.raw_state() == HandleState::Fault {
                faults.push(handle);
            }
        }
        if faults.is_empty() {
            return Ok(());
        }

        let (staleness, _) = self.access_settings();
        let ids: Vec<ObjectId> = faults.iter().map(|h| h.id()).collect();
        let rows = self.inner.coordinator.materialize(&ids, staleness)?;
        for handle in faults {
            let mut data = handle.inner.data.lock();
            if data.state != HandleState::Fault {
                continue;
            }
            match rows.get(&handle.id()) {
                Some(row) => handle.fill(&mut data, row),
                None => data.state = HandleState::Invalid,
            }
        }
        tracing::debug!(context = self.inner.id.0, objects = ids.len(), "prefetch");
        Ok(())
    }

    /// Loads the destinations of `relationship` for every handle, with one
    /// store query for the sources and one for the destinations at most.
    ///
    /// # Errors
    ///
    /// As for [`Context::prefetch`], plus `UnknownAttribute`.
    pub fn prefetch_relationship(&self, handles: &[EntityHandle], relationship: &str) -> CoreResult<()> {
        self.prefetch(handles)?;
        let mut destinations = Vec::new();
        {
            let mut state = self.inner.state.lock();
            for handle in handles {
                if handle.entity().relationship_named(relationship).is_none() {
                    return Err(CoreError::unknown_attribute(handle.entity_name(), relationship));
                }
                for id in handle.relation(relationship).map(|r| r.ids()).unwrap_or_default() {
                    if !id.is_temporary() {
                        destinations.push(self.handle_for(&mut state, id)?);
                    }
                }
            }
        }
        self.prefetch(&destinations)
    }

    /// Saves every pending change as one transaction.
    ///
    /// Runs validation over all changed objects first and reports every
    /// failure together. Inserted objects get permanent identifiers before
    /// the commit; they keep them even if the commit then fails. On conflict
    /// or I/O failure nothing is written and the pending changes stay.
    ///
    /// # Errors
    ///
    /// - `Validation` with every failure found
    /// - `Conflict` when the merge policy rejects a divergence
    /// - a store error
    pub fn save(&self) -> CoreResult<()> {
        self.check_thread()?;
        let span = tracing::info_span!("save", context = self.inner.id.0);
        let _enter = span.enter();

        let mut state = self.inner.state.lock();
        if !state.has_changes() {
            return Ok(());
        }

        self.validate(&mut state)?;

        let temporaries: Vec<ObjectId> = state
            .inserted
            .iter()
            .filter(|id| id.is_temporary())
            .copied()
            .collect();
        if !temporaries.is_empty() {
            let permanent = self.inner.coordinator.obtain_permanent_ids(&temporaries);
            self.rekey(&mut state, &temporaries, &permanent);
        }

        let mut changes = Changeset::new(self.inner.id);
        for id in &state.inserted.clone() {
            if let Some(handle) = state.lookup(id) {
                changes.inserts.push((*id, handle.rendered()));
            }
        }
        for id in &state.updated.clone() {
            if state.deleted.contains(id) {
                continue;
            }
            if let Some(handle) = state.lookup(id) {
                let snapshot = handle.inner.data.lock().snapshot.clone();
                if let Some(snapshot) = snapshot {
                    changes.updates.push(PendingUpdate {
                        id: *id,
                        values: handle.rendered(),
                        snapshot,
                    });
                }
            }
        }
        for id in &state.deleted.clone() {
            if let Some(handle) = state.lookup(id) {
                let snapshot = handle.inner.data.lock().snapshot.clone();
                if let Some(snapshot) = snapshot {
                    changes.deletes.push(PendingDelete { id: *id, snapshot });
                }
            }
        }

        let policy = Arc::clone(&self.inner.settings.read().merge_policy);
        let receipt = self.inner.coordinator.save(changes, policy.as_ref())?;

        for (id, row) in &receipt.rows {
            if let Some(handle) = state.lookup(id) {
                let mut data = handle.inner.data.lock();
                handle.fill(&mut data, row);
            }
        }
        for id in receipt.dropped.iter().chain(&receipt.deleted) {
            if let Some(handle) = state.lookup(id) {
                let mut data = handle.inner.data.lock();
                handle.unpin(&mut data);
                if receipt.dropped.contains(id) {
                    data.state = HandleState::Invalid;
                }
            }
            state.registry.remove(id);
        }
        state.registry.retain(|_, slot| match slot {
            Slot::Strong(handle) => handle.raw_state() != HandleState::Deleted,
            Slot::Weak(_) => true,
        });
        state.inserted.clear();
        state.updated.clear();
        state.deleted.clear();
        state.undo.clear();
        state.release_clean();

        tracing::debug!(sequence = ?receipt.sequence, "context saved");
        Ok(())
    }

    fn validate(&self, state: &mut ContextState) -> CoreResult<()> {
        let mut errors = Vec::new();
        let changed: Vec<ObjectId> = state
            .inserted
            .iter()
            .chain(state.updated.iter().filter(|id| !state.deleted.contains(*id)))
            .copied()
            .collect();
        for id in changed {
            let Some(handle) = state.lookup(&id) else {
                continue;
            };
            let entity = handle.entity();
            let data = handle.inner.data.lock();
            for (attribute, message) in entity.validate_values(&data.values) {
                errors.push(ValidationError {
                    id,
                    entity: entity.name.clone(),
                    attribute,
                    message,
                });
            }
            for relationship in entity.relationships.iter().filter(|r| !r.to_many && !r.optional) {
                if matches!(data.relations.get(&relationship.name), None | Some(Relation::One(None))) {
                    errors.push(ValidationError {
                        id,
                        entity: entity.name.clone(),
                        attribute: Some(relationship.name.clone()),
                        message: "is required".to_string(),
                    });
                }
            }
        }

        let deleted: Vec<ObjectId> = state.deleted.iter().copied().collect();
        for id in deleted {
            let Some(handle) = state.lookup(&id) else {
                continue;
            };
            for relationship in handle
                .entity()
                .relationships
                .iter()
                .filter(|r| r.delete_rule == DeleteRule::Deny)
            {
                let remaining = handle
                    .relation(&relationship.name)
                    .map(|r| r.ids())
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|member| {
                        !state.deleted.contains(member)
                            && state
                                .lookup(member)
                                .map_or(true, |h| h.raw_state() != HandleState::Deleted)
                    })
                    .count();
                if remaining > 0 {
                    errors.push(ValidationError {
                        id,
                        entity: handle.entity_name().to_string(),
                        attribute: Some(relationship.name.clone()),
                        message: format!("delete denied while {remaining} related object(s) remain"),
                    });
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            tracing::debug!(failures = errors.len(), "save failed validation");
            Err(CoreError::Validation(ValidationErrors(errors)))
        }
    }

    fn rekey(&self, state: &mut ContextState, from: &[ObjectId], to: &[ObjectId]) {
        let mapping: BTreeMap<ObjectId, ObjectId> = from.iter().copied().zip(to.iter().copied()).collect();
        for (temporary, permanent) in &mapping {
            if let Some(slot) = state.registry.remove(temporary) {
                if let Some(handle) = slot.get() {
                    handle.set_id(*permanent);
                }
                state.registry.insert(*permanent, slot);
            }
            if state.inserted.remove(temporary) {
                state.inserted.insert(*permanent);
            }
        }
        for handle in state.live_handles() {
            let mut data = handle.inner.data.lock();
            for relation in data.relations.values_mut() {
                for (temporary, permanent) in &mapping {
                    if let Some(rekeyed) = relation.rekeyed(temporary, *permanent) {
                        *relation = rekeyed;
                    }
                }
            }
        }
    }

    /// Folds another context's save into this one.
    ///
    /// Clean objects take the committed rows from the row cache. Objects with
    /// unsaved changes are merged property by property; the configured trump
    /// decides attributes changed on both sides. Deleted objects become
    /// invalid, unsaved changes or not. Notifications from this context are
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns `CrossThreadAccess` off the owning thread, or a store error.
    pub fn merge_external_save(&self, notification: &SaveNotification) -> CoreResult<()> {
        self.check_thread()?;
        if notification.source == self.inner.id {
            return Ok(());
        }
        let prefer_local = self.inner.settings.read().trump == MergeTrump::LocalTrumps;
        let coordinator = &self.inner.coordinator;
        let mut state = self.inner.state.lock();

        let mut refreshed = 0usize;
        for id in &notification.updated {
            let Some(handle) = state.lookup(id) else {
                continue;
            };
            if matches!(handle.raw_state(), HandleState::Fault | HandleState::Invalid) {
                continue;
            }
            let Some(row) = coordinator.row_for(id, Duration::ZERO)? else {
                continue;
            };
            let dirty = state.updated.contains(id) || state.deleted.contains(id);
            let mut data = handle.inner.data.lock();
            if dirty {
                let base = data.snapshot.clone().unwrap_or_default();
                let local = Row::new(render_row(&data.values, &data.relations), base.version());
                let merged = merge_properties(&local, &row, &base, prefer_local);
                let (values, relations) = split_row(coordinator, handle.entity(), &merged);
                data.values = values;
                data.relations = relations;
                data.snapshot = Some((*row).clone());
            } else {
                handle.fill(&mut data, &row);
            }
            refreshed += 1;
        }

        let gone: Vec<ObjectId> = notification.deleted.iter().copied().collect();
        for id in &gone {
            if let Some(handle) = state.lookup(id) {
                let mut data = handle.inner.data.lock();
                handle.unpin(&mut data);
                data.state = HandleState::Invalid;
            }
            state.registry.remove(id);
            state.updated.remove(id);
            state.deleted.remove(id);
            state.undo.retain(|entry| entry.handle.id() != *id);
        }
        if !gone.is_empty() {
            for handle in state.live_handles() {
                let mut data = handle.inner.data.lock();
                for relation in data.relations.values_mut() {
                    for id in &gone {
                        if relation.contains(id) {
                            *relation = relation.without(id);
                        }
                    }
                }
            }
        }

        tracing::debug!(
            context = self.inner.id.0,
            source = notification.source.0,
            refreshed,
            invalidated = gone.len(),
            "merged external save"
        );
        Ok(())
    }

    /// Refreshes one object.
    ///
    /// With `merge_changes` false, unsaved changes are discarded and the
    /// handle turns back into a fault. With `merge_changes` true the
    /// committed row is reloaded and unsaved changes are laid over it.
    ///
    /// # Errors
    ///
    /// Returns an ownership error, or a store error.
    pub fn refresh(&self, handle: &EntityHandle, merge_changes: bool) -> CoreResult<()> {
        self.check_handle(handle)?;
        let id = handle.id();
        if id.is_temporary() {
            return Ok(());
        }
        let mut state = self.inner.state.lock();
        if state.deleted.contains(&id) {
            return Ok(());
        }

        if !merge_changes {
            state.updated.remove(&id);
            state.undo.retain(|entry| !entry.handle.ptr_eq(handle));
            handle.refault();
            state
                .registry
                .insert(id, Slot::Weak(Arc::downgrade(&handle.inner)));
            return Ok(());
        }

        if handle.raw_state() != HandleState::Materialized {
            return Ok(());
        }
        let (staleness, policy) = self.access_settings();
        let row = self.inner.coordinator.row_for(&id, staleness)?;
        let dirty = state.updated.contains(&id);
        let mut data = handle.inner.data.lock();
        match row {
            Some(row) if dirty => {
                let base = data.snapshot.clone().unwrap_or_default();
                let local = Row::new(render_row(&data.values, &data.relations), base.version());
                let merged = merge_properties(&local, &row, &base, true);
                let (values, relations) = split_row(&self.inner.coordinator, handle.entity(), &merged);
                data.values = values;
                data.relations = relations;
                data.snapshot = Some((*row).clone());
            }
            Some(row) => handle.fill(&mut data, &row),
            None => {
                handle.unpin(&mut data);
                data.state = match policy {
                    InaccessibleFaultPolicy::Error => HandleState::Invalid,
                    InaccessibleFaultPolicy::TreatAsDeleted => HandleState::Deleted,
                };
            }
        }
        Ok(())
    }

    /// Discards every unsaved change by replaying the undo log backwards.
    ///
    /// Inserted objects end up deleted and unregistered.
    ///
    /// # Errors
    ///
    /// Returns `CrossThreadAccess` off the owning thread.
    pub fn rollback(&self) -> CoreResult<()> {
        self.check_thread()?;
        let mut state = self.inner.state.lock();
        Self::rollback_locked(&mut state);
        Ok(())
    }

    fn rollback_locked(state: &mut ContextState) {
        let entries = std::mem::take(&mut state.undo);
        let undone = entries.len();
        for entry in entries.into_iter().rev() {
            let mut data = entry.handle.inner.data.lock();
            if data.state == HandleState::Invalid {
                continue;
            }
            match entry.change {
                UndoChange::Attribute { name, old } => {
                    data.values.insert(name, old);
                }
                UndoChange::Relation { name, old } => {
                    data.relations.insert(name, old);
                }
                UndoChange::Inserted => {
                    data.state = HandleState::Deleted;
                    drop(data);
                    state.registry.remove(&entry.handle.id());
                }
                UndoChange::Deleted { prior } => data.state = prior,
            }
        }
        state.inserted.clear();
        state.updated.clear();
        state.deleted.clear();
        state.release_clean();
        tracing::debug!(undone, "rolled back");
    }

    /// Rolls back and forgets every registered object.
    ///
    /// Handles obtained earlier revert to faults and are no longer the
    /// registered handle for their identifier.
    ///
    /// # Errors
    ///
    /// Returns `CrossThreadAccess` off the owning thread.
    pub fn reset(&self) -> CoreResult<()> {
        self.check_thread()?;
        let mut state = self.inner.state.lock();
        Self::rollback_locked(&mut state);
        for handle in state.live_handles() {
            handle.refault();
        }
        state.registry.clear();
        Ok(())
    }
}

impl ContextState {
    fn release_dead(&mut self) {
        self.registry.retain(|_, slot| match slot {
            Slot::Strong(_) => true,
            Slot::Weak(weak) => weak.strong_count() > 0,
        });
    }
}
