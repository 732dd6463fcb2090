//! Store coordinator.
//!
//! The coordinator is the one object every context of a store shares. It owns
//! the [`RowStore`], the [`RowCache`] and the [`NotificationCenter`], hands out
//! identifiers and runs saves:
//!
//! ```text
//!   Context A ─┐                       ┌─> RowCache (shared, sharded)
//!   Context B ─┼─> StoreCoordinator ───┼─> RowStore (one writer, many readers)
//!   Context C ─┘                       └─> NotificationCenter
//! ```
//!
//! Saves are serialized; fetches and fault fulfillment read through store
//! snapshots and never wait for a save's disk I/O.

use crate::cache::RowCache;
use crate::config::Config;
use crate::context::Context;
use crate::dir::StoreDir;
use crate::error::{ConflictRecord, CoreError, CoreResult};
use crate::identifier::{ObjectId, ObjectKey};
use crate::manifest::Manifest;
use crate::merge::MergePolicy;
use crate::migration::{self, MigrationMapping};
use crate::model::{EntityDescription, Model};
use crate::notification::{NotificationCenter, SaveNotification};
use crate::query::FetchRequest;
use crate::row::{Row, RowValues};
use crate::stats::{EngineStats, StatsSnapshot};
use crate::store::{AppliedOp, CompactionStats, RowStore, WriteOp};
use crate::types::{ContextId, KindId, SequenceNumber, StoreId};
use faultdb_storage::{FileBackend, InMemoryBackend, StorageBackend};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;

/// A pending update of one object.
#[derive(Debug, Clone)]
pub struct PendingUpdate {
    /// The object.
    pub id: ObjectId,
    /// Values the context wants to write.
    pub values: RowValues,
    /// Committed row the changes are based on.
    pub snapshot: Row,
}

/// A pending deletion of one object.
#[derive(Debug, Clone)]
pub struct PendingDelete {
    /// The object.
    pub id: ObjectId,
    /// Committed row the context last saw.
    pub snapshot: Row,
}

/// Everything one context asks to commit.
#[derive(Debug, Clone)]
pub struct Changeset {
    /// The saving context.
    pub context: ContextId,
    /// New objects. Identifiers must already be permanent.
    pub inserts: Vec<(ObjectId, RowValues)>,
    /// Updated objects.
    pub updates: Vec<PendingUpdate>,
    /// Deleted objects.
    pub deletes: Vec<PendingDelete>,
}

impl Changeset {
    /// Creates an empty changeset for `context`.
    #[must_use]
    pub fn new(context: ContextId) -> Self {
        Self {
            context,
            inserts: Vec::new(),
            updates: Vec::new(),
            deletes: Vec::new(),
        }
    }

    /// Returns true if there is nothing to commit.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}

/// Outcome of a successful save.
#[derive(Debug, Clone, Default)]
pub struct CommitReceipt {
    /// Sequence of the commit, `None` if nothing was written.
    pub sequence: Option<SequenceNumber>,
    /// Commit time, milliseconds since the epoch.
    pub timestamp: i64,
    /// Inserted objects.
    pub inserted: Vec<ObjectId>,
    /// Updated objects.
    pub updated: Vec<ObjectId>,
    /// Deleted objects, including ones already gone from the store.
    pub deleted: Vec<ObjectId>,
    /// Committed rows of inserted and updated objects, and the adopted store
    /// row of updates the merge policy resolved to the store's values.
    pub rows: HashMap<ObjectId, Row>,
    /// Updates dropped because the store deleted the object meanwhile.
    pub dropped: Vec<ObjectId>,
}

/// Shared entry point to one store.
pub struct StoreCoordinator {
    model: Arc<Model>,
    kinds: HashMap<String, KindId>,
    entities: HashMap<KindId, Arc<EntityDescription>>,
    store: RowStore,
    cache: RowCache,
    notifications: NotificationCenter,
    stats: Arc<EngineStats>,
    config: Config,
    save_lock: Mutex<()>,
    temp_serial: AtomicU64,
}

impl std::fmt::Debug for StoreCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreCoordinator")
            .field("store", &self.store)
            .field("schema_version", &self.model.version())
            .field("cached_rows", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl StoreCoordinator {
    /// Opens or creates a store directory with the default configuration.
    ///
    /// # Errors
    ///
    /// See [`StoreCoordinator::open_with_migrations`].
    pub fn open<P: AsRef<Path>>(path: P, model: Model) -> CoreResult<Arc<Self>> {
        Self::open_with_config(path, model, Config::default())
    }

    /// Opens or creates a store directory.
    ///
    /// # Errors
    ///
    /// See [`StoreCoordinator::open_with_migrations`].
    pub fn open_with_config<P: AsRef<Path>>(
        path: P,
        model: Model,
        config: Config,
    ) -> CoreResult<Arc<Self>> {
        Self::open_with_migrations(path, model, config, &[])
    }

    /// Opens a store directory, migrating it to the model's version.
    ///
    /// # Errors
    ///
    /// - `DatabaseLocked` if another process has the store open
    /// - `SchemaMismatch` if the stored version differs from the model and
    ///   `migrations` holds no chain between them
    /// - `StoreCorruption` if the journal is damaged
    /// - an I/O error
    pub fn open_with_migrations<P: AsRef<Path>>(
        path: P,
        model: Model,
        config: Config,
        migrations: &[MigrationMapping],
    ) -> CoreResult<Arc<Self>> {
        let path = path.as_ref();
        let span = tracing::info_span!("open", path = %path.display());
        let _enter = span.enter();

        model.check()?;
        let dir = StoreDir::open(path, config.create_if_missing)?;
        let manifest = match dir.load_manifest()? {
            Some(_) if config.error_if_exists => {
                return Err(CoreError::invalid_operation(format!(
                    "store already exists: {}",
                    path.display()
                )));
            }
            Some(manifest) => manifest,
            None => {
                let manifest = Manifest::new(config.format_version, model.version());
                dir.save_manifest(&manifest)?;
                tracing::info!(store = %manifest.store_id, "created store");
                manifest
            }
        };
        let backend = FileBackend::open(&dir.journal_path())?;
        Self::assemble(Box::new(backend), Some(dir), manifest, model, config, migrations)
    }

    /// Opens a fresh store held in memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the model is inconsistent.
    pub fn open_in_memory(model: Model) -> CoreResult<Arc<Self>> {
        Self::open_in_memory_with_config(model, Config::default())
    }

    /// Opens a fresh in-memory store with `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the model is inconsistent.
    pub fn open_in_memory_with_config(model: Model, config: Config) -> CoreResult<Arc<Self>> {
        Self::open_with_backend(Box::new(InMemoryBackend::new()), model, config)
    }

    /// Opens a store over an arbitrary backend.
    ///
    /// Kind ids are assigned in model order, so reopening the same backend
    /// with the same model finds its rows again.
    ///
    /// # Errors
    ///
    /// Returns an error if the model is inconsistent or the journal cannot
    /// be replayed.
    pub fn open_with_backend(
        backend: Box<dyn StorageBackend>,
        model: Model,
        config: Config,
    ) -> CoreResult<Arc<Self>> {
        model.check()?;
        let manifest = Manifest::new(config.format_version, model.version());
        Self::assemble(backend, None, manifest, model, config, &[])
    }

    fn assemble(
        backend: Box<dyn StorageBackend>,
        dir: Option<StoreDir>,
        manifest: Manifest,
        model: Model,
        config: Config,
        migrations: &[MigrationMapping],
    ) -> CoreResult<Arc<Self>> {
        let stats = Arc::new(EngineStats::new());
        let store = RowStore::open(
            backend,
            dir,
            manifest,
            config.sync_on_commit,
            Arc::clone(&stats),
        )?;

        let stored = store.current_schema_version();
        if stored != model.version() {
            for mapping in migration::plan(migrations, stored, model.version())? {
                store.apply_migration(mapping)?;
            }
        }

        let names: Vec<&str> = model.entities().map(|e| e.name.as_str()).collect();
        let ids = store.register_kinds(names.iter().copied())?;
        let mut kinds = HashMap::new();
        let mut entities = HashMap::new();
        for (entity, kind) in model.entities().zip(ids) {
            kinds.insert(entity.name.clone(), kind);
            entities.insert(kind, Arc::clone(entity));
        }

        tracing::info!(
            store = %store.store_id(),
            schema_version = model.version(),
            entities = kinds.len(),
            rows = store.row_count(),
            "store coordinator ready"
        );
        Ok(Arc::new(Self {
            model: Arc::new(model),
            kinds,
            entities,
            store,
            cache: RowCache::new(config.row_cache_capacity, Arc::clone(&stats)),
            notifications: NotificationCenter::new(config.notification_history),
            stats,
            config,
            save_lock: Mutex::new(()),
            temp_serial: AtomicU64::new(1),
        }))
    }

    /// Creates a context bound to the calling thread.
    pub fn new_context(self: &Arc<Self>) -> Context {
        Context::new(Arc::clone(self))
    }

    /// Stable identity of the store.
    #[must_use]
    pub fn store_id(&self) -> StoreId {
        self.store.store_id()
    }

    /// The in-process model.
    #[must_use]
    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    /// Configuration the store was opened with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Schema version of the stored rows.
    #[must_use]
    pub fn schema_version(&self) -> u32 {
        self.store.current_schema_version()
    }

    /// Sequence of the last commit.
    #[must_use]
    pub fn sequence(&self) -> SequenceNumber {
        self.store.sequence()
    }

    /// The shared row cache.
    #[must_use]
    pub fn cache(&self) -> &RowCache {
        &self.cache
    }

    /// Copy of the engine counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn engine_stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Kind id of an entity.
    ///
    /// # Errors
    ///
    /// Returns `UnknownEntity` if the model has no such entity.
    pub fn kind_of(&self, entity: &str) -> CoreResult<KindId> {
        self.kinds
            .get(entity)
            .copied()
            .ok_or_else(|| CoreError::unknown_entity(entity))
    }

    /// Description of a kind.
    ///
    /// # Errors
    ///
    /// Returns `UnknownEntity` for a kind outside the model.
    pub fn entity(&self, kind: KindId) -> CoreResult<&Arc<EntityDescription>> {
        self.entities
            .get(&kind)
            .ok_or_else(|| CoreError::unknown_entity(format!("kind {}", kind.0)))
    }

    /// Subscribes to save notifications.
    pub fn subscribe(&self) -> Receiver<SaveNotification> {
        self.notifications.subscribe()
    }

    /// Notifications after `cursor` still held in history.
    #[must_use]
    pub fn poll_notifications(&self, cursor: SequenceNumber, limit: usize) -> Vec<SaveNotification> {
        self.notifications.poll(cursor, limit)
    }

    /// Rewrites the journal with only live rows.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the rewrite fails.
    pub fn compact(&self) -> CoreResult<CompactionStats> {
        let _save = self.save_lock.lock();
        self.store.compact()
    }

    /// Runs a fetch against the store.
    ///
    /// Returns matching rows in primary key order. With `populate_cache` the
    /// rows are put into the row cache in batches of the request's batch size
    /// (or the configured default), and the cancel token is checked before
    /// each batch.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if the token fires, or a store error.
    pub fn fetch(
        &self,
        request: &FetchRequest,
        populate_cache: bool,
    ) -> CoreResult<Vec<(ObjectId, Arc<Row>)>> {
        request.check_cancelled()?;
        let kind = self.kind_of(&request.entity)?;
        let store = self.store_id();

        let snapshot = self.store.snapshot();
        let rows = snapshot.scan(kind, &request.predicate)?;
        let batch = match request.batch_size.unwrap_or(self.config.fetch_batch_size) {
            0 => rows.len().max(1),
            n => n,
        };

        let mut out = Vec::with_capacity(rows.len());
        let mut remaining = rows.into_iter().peekable();
        while remaining.peek().is_some() {
            request.check_cancelled()?;
            for (key, row) in remaining.by_ref().take(batch) {
                let id = ObjectId::permanent(store, kind, key);
                let row = if populate_cache {
                    self.cache.put(id, row)
                } else {
                    Arc::new(row)
                };
                out.push((id, row));
            }
        }
        drop(snapshot);

        tracing::debug!(entity = %request.entity, rows = out.len(), "fetch");
        Ok(out)
    }

    /// Rows for `ids`, from the cache where fresh and otherwise from the store
    /// in a single query.
    ///
    /// Objects missing from the store are absent from the result. Temporary
    /// identifiers are skipped.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub fn materialize(
        &self,
        ids: &[ObjectId],
        staleness: Duration,
    ) -> CoreResult<HashMap<ObjectId, Arc<Row>>> {
        let mut found = HashMap::with_capacity(ids.len());
        let mut misses = Vec::new();
        for id in ids {
            if id.is_temporary() || found.contains_key(id) {
                continue;
            }
            match self.cache.get_fresh(id, staleness) {
                Some(row) => {
                    found.insert(*id, row);
                }
                None => misses.push(*id),
            }
        }
        if misses.is_empty() {
            return Ok(found);
        }

        let keys: Vec<(KindId, u64)> = misses
            .iter()
            .filter_map(|id| id.primary_key().map(|pk| (id.kind(), pk)))
            .collect();
        let store = self.store_id();
        let snapshot = self.store.snapshot();
        for ((kind, key), row) in snapshot.get_many(&keys)? {
            let id = ObjectId::permanent(store, kind, key);
            found.insert(id, self.cache.put(id, row));
        }
        drop(snapshot);
        tracing::debug!(requested = ids.len(), loaded = keys.len(), "materialize");
        Ok(found)
    }

    /// Row for one object, from the cache if fresh.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub fn row_for(&self, id: &ObjectId, staleness: Duration) -> CoreResult<Option<Arc<Row>>> {
        Ok(self.materialize(std::slice::from_ref(id), staleness)?.remove(id))
    }

    /// Hands out a temporary identifier for a new object of `kind`.
    #[must_use]
    pub fn allocate_identifier(&self, kind: KindId, context: ContextId) -> ObjectId {
        let serial = self.temp_serial.fetch_add(1, Ordering::Relaxed);
        ObjectId::new(
            self.store_id(),
            kind,
            ObjectKey::Temporary { context, serial },
        )
    }

    /// Replaces temporary identifiers with permanent ones, preserving order.
    ///
    /// Permanent identifiers pass through unchanged.
    pub fn obtain_permanent_ids(&self, ids: &[ObjectId]) -> Vec<ObjectId> {
        let mut needed: HashMap<KindId, u64> = HashMap::new();
        for id in ids.iter().filter(|id| id.is_temporary()) {
            *needed.entry(id.kind()).or_default() += 1;
        }
        let mut ranges: HashMap<KindId, std::ops::Range<u64>> = needed
            .into_iter()
            .map(|(kind, count)| (kind, self.store.reserve_keys(kind, count)))
            .collect();

        ids.iter()
            .map(|id| {
                if !id.is_temporary() {
                    return *id;
                }
                match ranges.get_mut(&id.kind()).and_then(Iterator::next) {
                    Some(pk) => ObjectId::permanent(id.store(), id.kind(), pk),
                    None => *id,
                }
            })
            .collect()
    }

    /// Commits a changeset as one transaction.
    ///
    /// Updates and deletes whose store version moved since their snapshot go
    /// through `policy`. Every unresolved divergence is collected; if there is
    /// any, nothing is written and `Conflict` lists them all.
    ///
    /// # Errors
    ///
    /// - `Conflict` when the policy rejects at least one divergence
    /// - `InvalidOperation` when an insert still has a temporary identifier
    /// - a storage error if the commit fails
    pub fn save(&self, changes: Changeset, policy: &dyn MergePolicy) -> CoreResult<CommitReceipt> {
        let _save = self.save_lock.lock();
        let result = self.save_locked(changes, policy);
        if result.is_err() {
            self.stats.record_save_failure();
        }
        result
    }

    fn save_locked(&self, changes: Changeset, policy: &dyn MergePolicy) -> CoreResult<CommitReceipt> {
        let temporary = changes
            .inserts
            .iter()
            .map(|(id, _)| id)
            .chain(changes.updates.iter().map(|u| &u.id))
            .chain(changes.deletes.iter().map(|d| &d.id))
            .find(|id| id.is_temporary());
        if let Some(id) = temporary {
            return Err(CoreError::invalid_operation(format!(
                "save of {id} has no permanent identifier"
            )));
        }

        let mut receipt = CommitReceipt::default();
        let mut ops = Vec::new();
        let mut conflicts = Vec::new();

        for (id, values) in changes.inserts {
            if let Some(pk) = id.primary_key() {
                ops.push(WriteOp::Put {
                    kind: id.kind(),
                    key: pk,
                    values,
                });
                receipt.inserted.push(id);
            }
        }

        {
            let snapshot = self.store.snapshot();
            let version_of = |id: &ObjectId| {
                id.primary_key()
                    .and_then(|pk| snapshot.version_of(id.kind(), pk))
            };

            let diverged: Vec<(KindId, u64)> = changes
                .updates
                .iter()
                .filter_map(|update| {
                    let pk = update.id.primary_key()?;
                    let current = version_of(&update.id)?;
                    (current != update.snapshot.version()).then_some((update.id.kind(), pk))
                })
                .collect();
            let store_rows: HashMap<(KindId, u64), Row> = if diverged.is_empty() {
                HashMap::new()
            } else {
                snapshot.get_many(&diverged)?.into_iter().collect()
            };

            for update in changes.updates {
                let Some(pk) = update.id.primary_key() else {
                    continue;
                };
                match version_of(&update.id) {
                    None if policy.deletion_wins() => {
                        tracing::debug!(id = %update.id, "update dropped, object deleted in store");
                        receipt.dropped.push(update.id);
                    }
                    None => {
                        conflicts.push(ConflictRecord {
                            id: update.id,
                            local: Some(Row::new(update.values, update.snapshot.version())),
                            store: None,
                            snapshot: Some(update.snapshot),
                            reason: "object was deleted in the store".to_string(),
                        });
                    }
                    Some(v) if v == update.snapshot.version() => {
                        ops.push(WriteOp::Put {
                            kind: update.id.kind(),
                            key: pk,
                            values: update.values,
                        });
                        receipt.updated.push(update.id);
                    }
                    Some(_) => {
                        let Some(store_row) = store_rows.get(&(update.id.kind(), pk)) else {
                            continue;
                        };
                        let local = Row::new(update.values, update.snapshot.version());
                        match policy.resolve(&local, store_row, &update.snapshot) {
                            Ok(merged) if &merged == store_row.values() => {
                                self.stats.record_conflict(true);
                                receipt.rows.insert(update.id, store_row.clone());
                            }
                            Ok(merged) => {
                                self.stats.record_conflict(true);
                                ops.push(WriteOp::Put {
                                    kind: update.id.kind(),
                                    key: pk,
                                    values: merged,
                                });
                                receipt.updated.push(update.id);
                            }
                            Err(rejection) => {
                                self.stats.record_conflict(false);
                                conflicts.push(ConflictRecord {
                                    id: update.id,
                                    local: Some(local),
                                    store: Some(store_row.clone()),
                                    snapshot: Some(update.snapshot),
                                    reason: rejection.reason,
                                });
                            }
                        }
                    }
                }
            }

            for delete in changes.deletes {
                let Some(pk) = delete.id.primary_key() else {
                    continue;
                };
                match version_of(&delete.id) {
                    None => receipt.deleted.push(delete.id),
                    Some(v) if v == delete.snapshot.version() || policy.deletion_wins() => {
                        ops.push(WriteOp::Delete {
                            kind: delete.id.kind(),
                            key: pk,
                        });
                        receipt.deleted.push(delete.id);
                    }
                    Some(_) => {
                        self.stats.record_conflict(false);
                        conflicts.push(ConflictRecord {
                            id: delete.id,
                            local: None,
                            store: snapshot.get(delete.id.kind(), pk)?,
                            snapshot: Some(delete.snapshot),
                            reason: "object was updated in the store".to_string(),
                        });
                    }
                }
            }
        }

        if !conflicts.is_empty() {
            tracing::warn!(
                context = changes.context.0,
                conflicts = conflicts.len(),
                "save rejected by merge policy"
            );
            return Err(CoreError::Conflict { conflicts });
        }
        if ops.is_empty() {
            receipt.sequence = None;
            return Ok(receipt);
        }

        let store = self.store_id();
        let outcome = self.store.commit(ops, |applied| {
            for op in applied {
                match op {
                    AppliedOp::Put { kind, key, row } => {
                        self.cache
                            .put(ObjectId::permanent(store, *kind, *key), row.clone());
                    }
                    AppliedOp::Delete { kind, key } => {
                        self.cache
                            .invalidate(&ObjectId::permanent(store, *kind, *key));
                    }
                }
            }
        })?;
        for op in outcome.applied {
            if let AppliedOp::Put { kind, key, row } = op {
                receipt.rows.insert(ObjectId::permanent(store, kind, key), row);
            }
        }
        receipt.sequence = Some(outcome.sequence);
        receipt.timestamp = outcome.timestamp;

        let notification = SaveNotification {
            sequence: outcome.sequence,
            source: changes.context,
            timestamp: outcome.timestamp,
            inserted: receipt.inserted.iter().copied().collect(),
            updated: receipt.updated.iter().copied().collect(),
            deleted: receipt.deleted.iter().copied().collect::<BTreeSet<_>>(),
        };
        self.notifications.emit(notification);
        self.stats.record_notification();

        tracing::info!(
            context = changes.context.0,
            sequence = outcome.sequence.as_u64(),
            inserted = receipt.inserted.len(),
            updated = receipt.updated.len(),
            deleted = receipt.deleted.len(),
            "save committed"
        );
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::{Fail, PropertyLocalWins, StoreWins};
    use crate::model::{AttributeDescription, AttributeType};
    use crate::query::{CancelToken, Predicate};
    use faultdb_codec::Value;
    use tempfile::tempdir;

    fn model(version: u32) -> Model {
        Model::new(version).entity(
            EntityDescription::new("Country")
                .attribute(AttributeDescription::new("name", AttributeType::Text))
                .attribute(AttributeDescription::new("code", AttributeType::Integer)),
        )
    }

    fn country(name: &str, code: i64) -> RowValues {
        let mut values = RowValues::new();
        values.insert("name".into(), Value::from(name));
        values.insert("code".into(), Value::Integer(code));
        values
    }

    fn insert(coordinator: &StoreCoordinator, name: &str, code: i64) -> ObjectId {
        let kind = coordinator.kind_of("Country").unwrap();
        let temp = coordinator.allocate_identifier(kind, ContextId(1));
        let id = coordinator.obtain_permanent_ids(&[temp])[0];
        let mut changes = Changeset::new(ContextId(1));
        changes.inserts.push((id, country(name, code)));
        coordinator.save(changes, &Fail).unwrap();
        id
    }

    #[test]
    fn temporary_ids_cannot_be_saved() {
        let coordinator = StoreCoordinator::open_in_memory(model(1)).unwrap();
        let kind = coordinator.kind_of("Country").unwrap();
        let temp = coordinator.allocate_identifier(kind, ContextId(1));
        let before = coordinator.stats();

        let mut changes = Changeset::new(ContextId(1));
        changes.updates.push(PendingUpdate {
            id: temp,
            values: country("Ghost", 1),
            snapshot: Row::default(),
        });
        assert!(matches!(
            coordinator.save(changes, &Fail),
            Err(CoreError::InvalidOperation { .. })
        ));
        assert_eq!(coordinator.stats().store_queries, before.store_queries);
        assert_eq!(coordinator.stats().rows_written, before.rows_written);
    }

    #[test]
    fn permanent_ids_are_unique_and_ordered() {
        let coordinator = StoreCoordinator::open_in_memory(model(1)).unwrap();
        let kind = coordinator.kind_of("Country").unwrap();
        let temps: Vec<_> = (0..3)
            .map(|_| coordinator.allocate_identifier(kind, ContextId(7)))
            .collect();
        assert!(temps.iter().all(ObjectId::is_temporary));
        let permanent = coordinator.obtain_permanent_ids(&temps);
        let keys: Vec<_> = permanent.iter().filter_map(ObjectId::primary_key).collect();
        assert_eq!(keys, vec![1, 2, 3]);
        assert_eq!(coordinator.obtain_permanent_ids(&permanent), permanent);
    }

    #[test]
    fn save_populates_cache_and_notifies() {
        let coordinator = StoreCoordinator::open_in_memory(model(1)).unwrap();
        let rx = coordinator.subscribe();
        let id = insert(&coordinator, "France", 250);

        assert!(coordinator.cache().contains(&id));
        let note = rx.try_recv().unwrap();
        assert!(note.inserted.contains(&id));
        assert_eq!(note.source, ContextId(1));
    }

    #[test]
    fn temporary_insert_is_rejected() {
        let coordinator = StoreCoordinator::open_in_memory(model(1)).unwrap();
        let kind = coordinator.kind_of("Country").unwrap();
        let mut changes = Changeset::new(ContextId(1));
        changes.inserts.push((
            coordinator.allocate_identifier(kind, ContextId(1)),
            country("France", 250),
        ));
        assert!(matches!(
            coordinator.save(changes, &Fail),
            Err(CoreError::InvalidOperation { .. })
        ));
        assert_eq!(coordinator.stats().saves_failed, 1);
    }

    #[test]
    fn materialize_uses_one_query_for_all_misses() {
        let coordinator = StoreCoordinator::open_in_memory(model(1)).unwrap();
        let ids: Vec<_> = (0..10)
            .map(|i| insert(&coordinator, &format!("C{i}"), i))
            .collect();
        for id in &ids {
            coordinator.cache().invalidate(id);
        }

        let before = coordinator.stats().store_queries;
        let rows = coordinator.materialize(&ids, Duration::ZERO).unwrap();
        assert_eq!(rows.len(), 10);
        assert_eq!(coordinator.stats().store_queries - before, 1);

        let rows = coordinator.materialize(&ids, Duration::ZERO).unwrap();
        assert_eq!(rows.len(), 10);
        assert_eq!(coordinator.stats().store_queries - before, 1);
    }

    #[test]
    fn fetch_filters_and_honours_cancellation() {
        let coordinator = StoreCoordinator::open_in_memory(model(1)).unwrap();
        insert(&coordinator, "France", 250);
        insert(&coordinator, "Peru", 604);

        let request = FetchRequest::new("Country").predicate(Predicate::eq("code", 250));
        let rows = coordinator.fetch(&request, true).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1.get("name"), Some(&Value::from("France")));

        let token = CancelToken::new();
        token.cancel();
        let cancelled = FetchRequest::new("Country").batch_size(1).cancel_token(token);
        assert!(matches!(
            coordinator.fetch(&cancelled, true),
            Err(CoreError::Cancelled)
        ));
        assert!(matches!(
            coordinator.fetch(&FetchRequest::new("Planet"), true),
            Err(CoreError::UnknownEntity { .. })
        ));
    }

    #[test]
    fn diverged_update_goes_through_policy() {
        let coordinator = StoreCoordinator::open_in_memory(model(1)).unwrap();
        let id = insert(&coordinator, "France", 250);
        let snapshot = (*coordinator.row_for(&id, Duration::ZERO).unwrap().unwrap()).clone();

        let mut first = Changeset::new(ContextId(1));
        first.updates.push(PendingUpdate {
            id,
            values: country("République", 250),
            snapshot: snapshot.clone(),
        });
        coordinator.save(first, &Fail).unwrap();

        let stale = PendingUpdate {
            id,
            values: country("France", 251),
            snapshot: snapshot.clone(),
        };
        let mut rejected = Changeset::new(ContextId(2));
        rejected.updates.push(stale.clone());
        match coordinator.save(rejected, &Fail) {
            Err(CoreError::Conflict { conflicts }) => {
                assert_eq!(conflicts.len(), 1);
                assert!(conflicts[0].store.is_some());
            }
            other => panic!("expected conflict, got {other:?}"),
        }

        let mut merged = Changeset::new(ContextId(2));
        merged.updates.push(stale);
        let receipt = coordinator.save(merged, &PropertyLocalWins).unwrap();
        let row = &receipt.rows[&id];
        assert_eq!(row.get("name"), Some(&Value::from("République")));
        assert_eq!(row.get("code"), Some(&Value::Integer(251)));
        assert_eq!(coordinator.stats().conflicts_resolved, 1);
    }

    #[test]
    fn store_wins_writes_nothing() {
        let coordinator = StoreCoordinator::open_in_memory(model(1)).unwrap();
        let id = insert(&coordinator, "France", 250);
        let snapshot = (*coordinator.row_for(&id, Duration::ZERO).unwrap().unwrap()).clone();
        let mut first = Changeset::new(ContextId(1));
        first.updates.push(PendingUpdate {
            id,
            values: country("République", 250),
            snapshot: snapshot.clone(),
        });
        coordinator.save(first, &Fail).unwrap();
        let sequence = coordinator.sequence();

        let mut second = Changeset::new(ContextId(2));
        second.updates.push(PendingUpdate {
            id,
            values: country("Gaul", 250),
            snapshot,
        });
        let receipt = coordinator.save(second, &StoreWins).unwrap();
        assert!(receipt.sequence.is_none());
        assert_eq!(coordinator.sequence(), sequence);
        assert_eq!(receipt.rows[&id].get("name"), Some(&Value::from("République")));
    }

    #[test]
    fn update_of_deleted_row_is_dropped_unless_policy_fails() {
        let coordinator = StoreCoordinator::open_in_memory(model(1)).unwrap();
        let id = insert(&coordinator, "France", 250);
        let snapshot = (*coordinator.row_for(&id, Duration::ZERO).unwrap().unwrap()).clone();

        let mut delete = Changeset::new(ContextId(1));
        delete.deletes.push(PendingDelete {
            id,
            snapshot: snapshot.clone(),
        });
        coordinator.save(delete, &Fail).unwrap();
        assert!(!coordinator.cache().contains(&id));

        let update = PendingUpdate {
            id,
            values: country("France", 251),
            snapshot,
        };
        let mut lenient = Changeset::new(ContextId(2));
        lenient.updates.push(update.clone());
        let receipt = coordinator.save(lenient, &PropertyLocalWins).unwrap();
        assert_eq!(receipt.dropped, vec![id]);

        let mut strict = Changeset::new(ContextId(2));
        strict.updates.push(update);
        assert!(matches!(
            coordinator.save(strict, &Fail),
            Err(CoreError::Conflict { .. })
        ));
    }

    #[test]
    fn reopen_finds_rows_and_checks_schema() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");
        let id = {
            let coordinator = StoreCoordinator::open(&path, model(1)).unwrap();
            insert(&coordinator, "France", 250)
        };

        let coordinator = StoreCoordinator::open(&path, model(1)).unwrap();
        assert_eq!(coordinator.store_id(), id.store());
        let row = coordinator.row_for(&id, Duration::ZERO).unwrap().unwrap();
        assert_eq!(row.get("code"), Some(&Value::Integer(250)));
        drop(coordinator);

        assert!(matches!(
            StoreCoordinator::open(&path, model(2)),
            Err(CoreError::SchemaMismatch { store: 1, model: 2 })
        ));

        let mapping = MigrationMapping::new(1, 2);
        let migrated =
            StoreCoordinator::open_with_migrations(&path, model(2), Config::default(), &[mapping])
                .unwrap();
        assert_eq!(migrated.schema_version(), 2);
    }

    #[test]
    fn second_open_is_locked_out() {
        let dir = tempdir().unwrap();
        let _first = StoreCoordinator::open(dir.path(), model(1)).unwrap();
        assert!(matches!(
            StoreCoordinator::open(dir.path(), model(1)),
            Err(CoreError::DatabaseLocked)
        ));
    }
}
