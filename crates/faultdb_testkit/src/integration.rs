//! Cross-crate integration test helpers.
//!
//! Provides utilities for testing contexts, the coordinator and the journal
//! together.

use crate::fixtures::{insert_country, TestStore};
use faultdb_core::{Context, CoreError, EntityHandle, Faultable, FetchRequest, ObjectId, Predicate, Value};
use faultdb_storage::StorageBackend;
use std::collections::HashMap;

/// A test harness that saves countries through one context and checks them
/// through fresh ones.
pub struct IntegrationHarness {
    /// The store.
    pub store: TestStore,
    context: Context,
    /// Committed `(name, code)` per country.
    countries: HashMap<ObjectId, (String, i64)>,
}

impl IntegrationHarness {
    /// Creates a new integration harness over an in-memory store.
    pub fn new() -> Self {
        Self::over(TestStore::memory())
    }

    /// Creates a harness over `store`.
    pub fn over(store: TestStore) -> Self {
        let context = store.context();
        Self {
            store,
            context,
            countries: HashMap::new(),
        }
    }

    /// The harness's writing context.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Inserts and saves a country, tracking it for later verification.
    pub fn put(&mut self, name: &str, code: i64) -> ObjectId {
        let country = insert_country(&self.context, name, code);
        self.context.save().expect("Failed to save country");
        let id = country.id();
        self.countries.insert(id, (name.to_string(), code));
        id
    }

    /// Changes a saved country's code and saves.
    pub fn recode(&mut self, id: ObjectId, code: i64) {
        let country = self.context.existing_object(id).expect("Country should exist");
        country.set("code", code).expect("Failed to set code");
        self.context.save().expect("Failed to save code");
        if let Some(entry) = self.countries.get_mut(&id) {
            entry.1 = code;
        }
    }

    /// Deletes a saved country and stops tracking it.
    pub fn delete(&mut self, id: ObjectId) {
        let country = self.context.existing_object(id).expect("Country should exist");
        self.context.delete(&country).expect("Failed to delete");
        self.context.save().expect("Failed to save delete");
        self.countries.remove(&id);
    }

    /// Verifies every tracked country through a new context, and that no
    /// untracked country is visible.
    pub fn verify_all(&self) {
        let reader = self.store.context();
        let found = reader
            .fetch(&FetchRequest::new("Country"))
            .expect("Failed to fetch countries");
        assert_eq!(found.len(), self.countries.len(), "Country count mismatch");
        for country in &found {
            let (name, code) = self
                .countries
                .get(&country.id())
                .unwrap_or_else(|| panic!("Untracked country {}", country.id()));
            assert_eq!(country.get("name").unwrap(), Value::from(name.as_str()));
            assert_eq!(country.get("code").unwrap(), Value::Integer(*code));
        }
    }

    /// Returns the count of tracked countries.
    pub fn tracked_count(&self) -> usize {
        self.countries.len()
    }
}

impl Default for IntegrationHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Journal and backend checks.
pub mod journal {
    use super::*;

    /// Checks that a backend returns appended bytes at the reported offset.
    pub fn check_append_read(backend: &dyn StorageBackend, data: &[u8]) {
        let offset = backend.append(data).expect("Failed to append");
        backend.flush().expect("Failed to flush");

        let retrieved = backend.read_at(offset, data.len()).expect("Failed to read");
        assert_eq!(data, &retrieved[..], "Retrieved data should match");
    }

    /// Saves through one store, reopens it, and checks the countries survived.
    pub fn check_reopen_preserves_countries() {
        let mut harness = IntegrationHarness::over(TestStore::file());
        let france = harness.put("France", 250);
        harness.put("Peru", 604);
        harness.recode(france, 251);

        let IntegrationHarness {
            store,
            context,
            countries,
        } = harness;
        drop(context);
        let harness = IntegrationHarness::over(store.reopen());
        let harness = IntegrationHarness {
            countries,
            ..harness
        };
        harness.verify_all();
    }
}

/// Context isolation checks.
pub mod isolation {
    use super::*;

    /// Unsaved changes stay invisible to other contexts.
    pub fn check_unsaved_changes_are_private(store: &TestStore) {
        let writer = store.context();
        let reader = store.context();
        let country = insert_country(&writer, "France", 250);
        writer.save().expect("Failed to save");

        country.set("code", 999).expect("Failed to set code");
        let seen = reader
            .existing_object(country.id())
            .expect("Saved country should be visible");
        assert_eq!(seen.get("code").unwrap(), Value::Integer(250));

        let pending = reader
            .count(&FetchRequest::new("Country").predicate(Predicate::eq("code", 999)))
            .expect("Failed to count");
        assert_eq!(pending, 0);
    }

    /// Rolled back changes never reach the store.
    pub fn check_rollback_discards(store: &TestStore) {
        let context = store.context();
        let country = insert_country(&context, "France", 250);
        context.save().expect("Failed to save");

        country.set("code", 1).expect("Failed to set code");
        insert_country(&context, "Peru", 604);
        context.rollback().expect("Failed to roll back");

        assert!(!context.has_changes().unwrap());
        assert_eq!(country.get("code").unwrap(), Value::Integer(250));
        let reader = store.context();
        assert_eq!(reader.count(&FetchRequest::new("Country")).unwrap(), 1);
    }

    /// A handle from another context is rejected.
    pub fn check_foreign_handles_rejected(store: &TestStore) {
        let first = store.context();
        let second = store.context();
        let country: EntityHandle = insert_country(&first, "France", 250);
        let result = second.delete(&country);
        assert!(
            matches!(result, Err(CoreError::InvalidOperation { .. })),
            "{result:?}"
        );
        assert!(!country.is_fault());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faultdb_storage::InMemoryBackend;

    #[test]
    fn harness_tracks_saves_recodes_and_deletes() {
        let mut harness = IntegrationHarness::new();
        let france = harness.put("France", 250);
        let peru = harness.put("Peru", 604);
        harness.recode(france, 251);
        harness.delete(peru);
        assert_eq!(harness.tracked_count(), 1);
        harness.verify_all();
    }

    #[test]
    fn memory_backend_reads_back_appends() {
        let backend = InMemoryBackend::new();
        journal::check_append_read(&backend, b"hello");
        journal::check_append_read(&backend, b"world");
    }

    #[test]
    fn reopened_store_keeps_countries() {
        journal::check_reopen_preserves_countries();
    }

    #[test]
    fn contexts_are_isolated() {
        let store = TestStore::memory();
        isolation::check_unsaved_changes_are_private(&store);
    }

    #[test]
    fn rollback_discards_changes() {
        let store = TestStore::memory();
        isolation::check_rollback_discards(&store);
    }

    #[test]
    fn foreign_handles_are_rejected() {
        let store = TestStore::memory();
        isolation::check_foreign_handles_rejected(&store);
    }
}
