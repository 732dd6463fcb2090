//! Test fixtures and store helpers.
//!
//! Provides a small geography model (countries, cities, people) and
//! convenience functions for opening throwaway stores over it.

use faultdb_core::{
    AttributeDescription, AttributeType, Config, Context, DeleteRule, EntityDescription,
    EntityHandle, Model, RelationshipDescription, StoreCoordinator, ValidationRule,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Schema version of [`world_model`].
pub const WORLD_MODEL_VERSION: u32 = 1;

/// A model with `Country`, `City` and `Person`.
///
/// - `Country { name: text (min 2), code: integer 1..=999, motto: text? }`
/// - `City { name: text, population: integer? }`
/// - `Person { name: text, born: timestamp? }`
/// - `Country.cities <-> City.country`, cascading from the country
/// - `City.residents <-> Person.city`, nullified from the city
pub fn world_model() -> Model {
    world_model_at(WORLD_MODEL_VERSION)
}

/// [`world_model`] stamped with another schema version.
pub fn world_model_at(version: u32) -> Model {
    Model::new(version)
        .entity(
            EntityDescription::new("Country")
                .attribute(
                    AttributeDescription::new("name", AttributeType::Text)
                        .rule(ValidationRule::MinLength(2)),
                )
                .attribute(
                    AttributeDescription::new("code", AttributeType::Integer).rule(
                        ValidationRule::Range {
                            min: Some(1.into()),
                            max: Some(999.into()),
                        },
                    ),
                )
                .attribute(AttributeDescription::new("motto", AttributeType::Text).optional())
                .relationship(
                    RelationshipDescription::to_many("cities", "City")
                        .inverse("country")
                        .delete_rule(DeleteRule::Cascade),
                ),
        )
        .entity(
            EntityDescription::new("City")
                .attribute(AttributeDescription::new("name", AttributeType::Text))
                .attribute(
                    AttributeDescription::new("population", AttributeType::Integer).optional(),
                )
                .relationship(RelationshipDescription::to_one("country", "Country").inverse("cities"))
                .relationship(
                    RelationshipDescription::to_many("residents", "Person")
                        .inverse("city")
                        .ordered(),
                ),
        )
        .entity(
            EntityDescription::new("Person")
                .attribute(AttributeDescription::new("name", AttributeType::Text))
                .attribute(AttributeDescription::new("born", AttributeType::Timestamp).optional())
                .relationship(RelationshipDescription::to_one("city", "City").inverse("residents")),
        )
}

/// A test store with automatic cleanup.
pub struct TestStore {
    /// The coordinator.
    pub coordinator: Arc<StoreCoordinator>,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: Option<TempDir>,
    path: Option<PathBuf>,
}

impl TestStore {
    /// Opens an in-memory store over [`world_model`].
    pub fn memory() -> Self {
        Self::memory_with_config(Config::default())
    }

    /// Opens an in-memory store with `config`.
    pub fn memory_with_config(config: Config) -> Self {
        Self {
            coordinator: StoreCoordinator::open_in_memory_with_config(world_model(), config)
                .expect("Failed to open in-memory store"),
            _temp_dir: None,
            path: None,
        }
    }

    /// Opens a store in a fresh temporary directory.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("world.faultdb");
        let coordinator =
            StoreCoordinator::open(&path, world_model()).expect("Failed to open file store");
        Self {
            coordinator,
            _temp_dir: Some(temp_dir),
            path: Some(path),
        }
    }

    /// Returns the store directory if file-based, None if in-memory.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Closes the store and opens the same directory again.
    ///
    /// Panics for in-memory stores, or if contexts still hold the coordinator.
    pub fn reopen(self) -> Self {
        let Self {
            coordinator,
            _temp_dir,
            path,
        } = self;
        let path = path.expect("Only file stores can be reopened");
        assert_eq!(
            Arc::strong_count(&coordinator),
            1,
            "Drop every context before reopening"
        );
        drop(coordinator);
        Self {
            coordinator: StoreCoordinator::open(&path, world_model())
                .expect("Failed to reopen file store"),
            _temp_dir,
            path: Some(path),
        }
    }

    /// A new context on the calling thread.
    pub fn context(&self) -> Context {
        self.coordinator.new_context()
    }
}

impl std::ops::Deref for TestStore {
    type Target = Arc<StoreCoordinator>;

    fn deref(&self) -> &Self::Target {
        &self.coordinator
    }
}

/// Runs a test with a temporary in-memory store.
///
/// # Example
///
/// ```rust,ignore
/// use faultdb_testkit::with_temp_store;
///
/// #[test]
/// fn my_test() {
///     with_temp_store(|store| {
///         let context = store.new_context();
///         // ... test operations
///     });
/// }
/// ```
pub fn with_temp_store<F, R>(f: F) -> R
where
    F: FnOnce(&Arc<StoreCoordinator>) -> R,
{
    let store = TestStore::memory();
    f(&store.coordinator)
}

/// Runs a test with a temporary file-based store.
pub fn with_file_store<F, R>(f: F) -> R
where
    F: FnOnce(&Arc<StoreCoordinator>, &Path) -> R,
{
    let store = TestStore::file();
    let path = store.path().expect("File store should have a path").to_path_buf();
    f(&store.coordinator, &path)
}

/// Inserts a country without saving.
pub fn insert_country(context: &Context, name: &str, code: i64) -> EntityHandle {
    let country = context.insert("Country").expect("Failed to insert country");
    country.set("name", name).expect("Failed to set name");
    country.set("code", code).expect("Failed to set code");
    country
}

/// Inserts a city of `country` without saving.
pub fn insert_city(context: &Context, country: &EntityHandle, name: &str) -> EntityHandle {
    let city = context.insert("City").expect("Failed to insert city");
    city.set("name", name).expect("Failed to set name");
    city.set_to_one("country", Some(country))
        .expect("Failed to set country");
    city
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// Commits `count` countries named `Country 0`.. with codes `1..`.
    pub fn populated_countries(count: usize) -> TestStore {
        let store = TestStore::memory();
        let context = store.context();
        for i in 0..count {
            let code = i64::try_from(i % 999 + 1).expect("code fits");
            insert_country(&context, &format!("Country {i}"), code);
        }
        context.save().expect("Failed to save countries");
        store
    }

    /// Commits France with Paris and Lyon, and Peru with Lima.
    ///
    /// Returns the store and the permanent ids `[france, paris, lyon, peru, lima]`.
    pub fn two_countries() -> (TestStore, Vec<faultdb_core::ObjectId>) {
        let store = TestStore::memory();
        let context = store.context();
        let france = insert_country(&context, "France", 250);
        let paris = insert_city(&context, &france, "Paris");
        let lyon = insert_city(&context, &france, "Lyon");
        let peru = insert_country(&context, "Peru", 604);
        let lima = insert_city(&context, &peru, "Lima");
        context.save().expect("Failed to save scenario");
        let ids = [&france, &paris, &lyon, &peru, &lima]
            .iter()
            .map(|h| h.id())
            .collect();
        drop(context);
        (store, ids)
    }
}
