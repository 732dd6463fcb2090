//! End-to-end tests for contexts, faulting, merging and migration.

use faultdb_core::{
    CancelToken, Config, ContextQueue, CoreError, EntityHandle, Faultable, FetchRequest,
    HandleState, InaccessibleFaultPolicy, MergeTrump, MigrationMapping, MigrationStep, Predicate,
    PropertyLocalWins, SortDescriptor, StoreCoordinator, Value,
};
use faultdb_testkit::fixtures::{insert_city, insert_country, scenarios, world_model_at, TestStore};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn repeated_fetches_return_the_same_handles() {
    let store = scenarios::populated_countries(10);
    let context = store.context();
    let request = FetchRequest::new("Country").sort(SortDescriptor::ascending("code"));

    let first = context.fetch(&request).unwrap();
    let second = context.fetch(&request).unwrap();
    assert_eq!(first.len(), 10);
    for (a, b) in first.iter().zip(&second) {
        assert!(a.ptr_eq(b));
    }
}

#[test]
fn materialized_access_never_queries_again() {
    let store = scenarios::populated_countries(3);
    let context = store.context();
    let countries = context.fetch(&FetchRequest::new("Country")).unwrap();
    countries[0].ensure_materialized().unwrap();

    let before = store.stats().store_queries;
    for _ in 0..5 {
        countries[0].get("name").unwrap();
        countries[0].ensure_materialized().unwrap();
    }
    assert_eq!(store.stats().store_queries, before);
}

#[test]
fn unsaved_inserts_are_fetched() {
    let store = TestStore::memory();
    let context = store.context();
    let france = insert_country(&context, "France", 250);

    let found = context
        .fetch(&FetchRequest::new("Country").predicate(Predicate::eq("code", 250)))
        .unwrap();
    assert_eq!(found.len(), 1);
    assert!(found[0].ptr_eq(&france));
}

#[test]
fn property_merge_keeps_both_changes() {
    let store = scenarios::populated_countries(1);
    let a = store.context();
    let b = store.context();
    b.set_merge_policy(Arc::new(PropertyLocalWins)).unwrap();

    let request = FetchRequest::new("Country");
    let in_a = a.fetch(&request).unwrap().remove(0);
    let in_b = b.fetch(&request).unwrap().remove(0);
    in_a.ensure_materialized().unwrap();
    in_b.ensure_materialized().unwrap();

    in_a.set("name", "Renamed").unwrap();
    a.save().unwrap();
    in_b.set("code", 42).unwrap();
    b.save().unwrap();

    let reader = store.context();
    let row = reader.existing_object(in_a.id()).unwrap();
    assert_eq!(row.get("name").unwrap(), Value::from("Renamed"));
    assert_eq!(row.get("code").unwrap(), Value::Integer(42));
}

#[test]
fn external_delete_invalidates_unmodified_handles() {
    let store = scenarios::populated_countries(1);
    let notes = store.subscribe();
    let a = store.context();
    let b = store.context();

    let request = FetchRequest::new("Country");
    let in_a = a.fetch(&request).unwrap().remove(0);
    let in_b = b.fetch(&request).unwrap().remove(0);
    in_b.ensure_materialized().unwrap();

    a.delete(&in_a).unwrap();
    a.save().unwrap();
    let note = notes.try_iter().last().unwrap();
    assert!(note.deleted.contains(&in_b.id()));
    b.merge_external_save(&note).unwrap();

    let result = in_b.get("name");
    assert!(matches!(result, Err(CoreError::InvalidHandle { .. })), "{result:?}");

    b.set_inaccessible_fault_policy(InaccessibleFaultPolicy::TreatAsDeleted)
        .unwrap();
    assert_eq!(in_b.get("name").unwrap(), Value::from(""));
}

#[test]
fn rollback_keeps_externally_deleted_handles_invalid() {
    let store = scenarios::populated_countries(1);
    let notes = store.subscribe();
    let a = store.context();
    let b = store.context();

    let request = FetchRequest::new("Country");
    let ours = a.fetch(&request).unwrap().remove(0);
    let theirs = b.fetch(&request).unwrap().remove(0);
    theirs.ensure_materialized().unwrap();
    b.delete(&theirs).unwrap();

    a.delete(&ours).unwrap();
    a.save().unwrap();
    let note = notes.try_iter().last().unwrap();
    b.merge_external_save(&note).unwrap();
    b.rollback().unwrap();

    assert_eq!(theirs.state().unwrap(), HandleState::Invalid);
    let result = theirs.get("name");
    assert!(matches!(result, Err(CoreError::InvalidHandle { .. })), "{result:?}");
    assert!(!b.has_changes().unwrap());
}

fn edit_both_sides(trump: MergeTrump) -> (TestStore, EntityHandle) {
    let store = scenarios::populated_countries(1);
    let notes = store.subscribe();
    let a = store.context();
    let b = store.context();
    b.set_merge_trump(trump).unwrap();

    let request = FetchRequest::new("Country");
    let remote = a.fetch(&request).unwrap().remove(0);
    let local = b.fetch(&request).unwrap().remove(0);
    remote.ensure_materialized().unwrap();
    local.ensure_materialized().unwrap();

    local.set("name", "Local").unwrap();
    local.set("motto", "Ours").unwrap();
    remote.set("name", "Remote").unwrap();
    remote.set("code", 7).unwrap();
    a.save().unwrap();

    let note = notes.try_iter().last().unwrap();
    b.merge_external_save(&note).unwrap();
    assert!(b.has_changes().unwrap());
    assert_eq!(local.get("code").unwrap(), Value::Integer(7));
    assert_eq!(local.get("motto").unwrap(), Value::from("Ours"));

    b.save().unwrap();
    (store, local)
}

#[test]
fn external_save_merges_into_dirty_handle_local_trumps() {
    let (store, local) = edit_both_sides(MergeTrump::LocalTrumps);
    let row = store.context().existing_object(local.id()).unwrap();
    assert_eq!(row.get("name").unwrap(), Value::from("Local"));
    assert_eq!(row.get("code").unwrap(), Value::Integer(7));
    assert_eq!(row.get("motto").unwrap(), Value::from("Ours"));
}

#[test]
fn external_save_merges_into_dirty_handle_store_trumps() {
    let (store, local) = edit_both_sides(MergeTrump::StoreTrumps);
    let row = store.context().existing_object(local.id()).unwrap();
    assert_eq!(row.get("name").unwrap(), Value::from("Remote"));
    assert_eq!(row.get("code").unwrap(), Value::Integer(7));
    assert_eq!(row.get("motto").unwrap(), Value::from("Ours"));
}

#[test]
fn stale_cache_rows_go_back_to_the_store() {
    let store = scenarios::populated_countries(1);
    let id = store.context().fetch_ids(&FetchRequest::new("Country")).unwrap()[0];

    let fresh = store.context();
    let before = store.stats().store_queries;
    fresh.object_with_id(id).unwrap().get("name").unwrap();
    assert_eq!(store.stats().store_queries, before);

    let strict = store.context();
    strict
        .set_staleness_interval(Duration::from_millis(1))
        .unwrap();
    let handle = strict.object_with_id(id).unwrap();
    thread::sleep(Duration::from_millis(20));
    let stale_before = store.stats().cache_stale;
    handle.get("name").unwrap();
    assert_eq!(store.stats().store_queries, before + 1);
    assert!(store.stats().cache_stale > stale_before);
}

#[test]
fn prefetching_fifty_faults_costs_one_query() {
    let store = scenarios::populated_countries(50);
    let ids = store.context().fetch_ids(&FetchRequest::new("Country")).unwrap();
    store.cache().purge_unpinned();

    let context = store.context();
    let handles: Vec<_> = ids
        .iter()
        .map(|id| context.object_with_id(*id).unwrap())
        .collect();
    assert!(handles.iter().all(Faultable::is_fault));

    let before = store.stats().store_queries;
    context.prefetch(&handles).unwrap();
    assert_eq!(store.stats().store_queries, before + 1);

    for handle in &handles {
        assert!(!handle.is_fault());
        handle.get("code").unwrap();
    }
    assert_eq!(store.stats().store_queries, before + 1);
}

#[test]
fn france_appears_after_merging_the_notification() {
    let store = TestStore::memory();
    let notes = store.subscribe();
    let a = store.context();
    let b = store.context();
    let request = FetchRequest::new("Country").predicate(Predicate::eq("code", 250));

    assert!(b.fetch(&request).unwrap().is_empty());

    insert_country(&a, "France", 250);
    a.save().unwrap();
    let note = notes.recv().unwrap();
    b.merge_external_save(&note).unwrap();

    let found = b.fetch(&request).unwrap();
    assert_eq!(found.len(), 1);
    assert!(found[0].is_fault());
    assert_eq!(found[0].get("name").unwrap(), Value::from("France"));
    assert!(!found[0].is_fault());
}

#[test]
fn relationship_prefetch_loads_every_city() {
    let (store, ids) = scenarios::two_countries();
    store.cache().purge_unpinned();
    let context = store.context();
    let countries = context
        .fetch(&FetchRequest::new("Country").sort(SortDescriptor::ascending("name")))
        .unwrap();
    context.prefetch_relationship(&countries, "cities").unwrap();

    let before = store.stats().store_queries;
    let france_cities = countries[0].to_many("cities").unwrap();
    let mut names: Vec<Value> = france_cities
        .iter()
        .map(|c| c.get("name").unwrap())
        .collect();
    names.sort_by(Value::cmp_total);
    assert_eq!(names, vec![Value::from("Lyon"), Value::from("Paris")]);
    assert_eq!(countries[1].to_many_ids("cities").unwrap(), vec![ids[4]]);
    assert_eq!(store.stats().store_queries, before);
}

#[test]
fn cascade_delete_removes_cities_on_save() {
    let (store, ids) = scenarios::two_countries();
    let context = store.context();
    let france = context.existing_object(ids[0]).unwrap();
    context.delete(&france).unwrap();
    context.save().unwrap();

    let reader = store.context();
    assert_eq!(reader.count(&FetchRequest::new("City")).unwrap(), 1);
    assert_eq!(reader.count(&FetchRequest::new("Country")).unwrap(), 1);
}

#[test]
fn cancelled_fetch_returns_no_rows() {
    let store = scenarios::populated_countries(5);
    let context = store.context();
    let token = CancelToken::new();
    token.cancel();

    let result = context.fetch(&FetchRequest::new("Country").cancel_token(token));
    assert!(matches!(result, Err(CoreError::Cancelled)), "{result:?}");
}

#[test]
fn contexts_reject_other_threads() {
    let store = TestStore::memory();
    let context = store.context();
    let france = insert_country(&context, "France", 250);

    let (context_result, handle_result) = thread::spawn(move || {
        (
            context.fetch(&FetchRequest::new("Country")).map(|v| v.len()),
            france.get("name"),
        )
    })
    .join()
    .unwrap();
    assert!(matches!(context_result, Err(CoreError::CrossThreadAccess { .. })));
    assert!(matches!(handle_result, Err(CoreError::CrossThreadAccess { .. })));
}

#[test]
fn queued_context_does_work_off_the_calling_thread() {
    let store = TestStore::memory();
    let queue = ContextQueue::spawn(Arc::clone(&store.coordinator)).unwrap();
    let saved = queue
        .perform_and_wait(|context| {
            insert_country(context, "France", 250);
            context.save()
        })
        .unwrap();
    assert!(saved.is_ok(), "{saved:?}");

    let reader = store.context();
    assert_eq!(reader.count(&FetchRequest::new("Country")).unwrap(), 1);
}

#[test]
fn temporary_ids_stay_in_their_context() {
    let store = TestStore::memory();
    let a = store.context();
    let b = store.context();
    let france = insert_country(&a, "France", 250);
    let temporary = france.id();
    assert!(temporary.is_temporary());

    let result = b.object_with_id(temporary);
    assert!(
        matches!(result, Err(CoreError::TemporaryIdentifierShared { .. })),
        "{result:?}"
    );

    a.save().unwrap();
    assert!(!france.id().is_temporary());
    assert!(b.existing_object(france.id()).is_ok());
}

#[test]
fn validation_reports_every_problem() {
    let store = TestStore::memory();
    let context = store.context();
    let country = context.insert("Country").unwrap();
    country.set("name", "F").unwrap();
    country.set("code", 0).unwrap();
    let paris = insert_city(&context, &country, "Paris");

    match context.save() {
        Err(CoreError::Validation(errors)) => assert_eq!(errors.len(), 2),
        other => panic!("expected validation errors, got {other:?}"),
    }
    assert!(paris.id().is_temporary());

    country.set("name", "France").unwrap();
    country.set("code", 250).unwrap();
    context.save().unwrap();
}

#[test]
fn store_opens_only_with_a_migration_chain() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("world.faultdb");
    {
        let coordinator = StoreCoordinator::open(&path, world_model_at(1)).unwrap();
        let context = coordinator.new_context();
        insert_country(&context, "France", 250);
        context.save().unwrap();
    }

    let refused = StoreCoordinator::open(&path, world_model_at(2));
    assert!(matches!(refused, Err(CoreError::SchemaMismatch { .. })), "{refused:?}");

    let mapping = MigrationMapping::new(1, 2).step(MigrationStep::transform("Country", |values| {
        if let Some(Value::Text(name)) = values.get_mut("name") {
            *name = name.to_uppercase();
        }
        Ok(())
    }));
    let coordinator =
        StoreCoordinator::open_with_migrations(&path, world_model_at(2), Config::default(), &[mapping])
            .unwrap();
    assert_eq!(coordinator.schema_version(), 2);
    let context = coordinator.new_context();
    let france = context.fetch(&FetchRequest::new("Country")).unwrap().remove(0);
    assert_eq!(france.get("name").unwrap(), Value::from("FRANCE"));
}

#[test]
fn saved_graph_survives_reopen() {
    let store = TestStore::file();
    let context = store.context();
    let france = insert_country(&context, "France", 250);
    insert_city(&context, &france, "Paris");
    context.save().unwrap();
    let france_id = france.id();
    drop((france, context));

    let store = store.reopen();
    let context = store.context();
    let france = context.existing_object(france_id).unwrap();
    let cities = france.to_many("cities").unwrap();
    assert_eq!(cities.len(), 1);
    assert_eq!(cities[0].get("name").unwrap(), Value::from("Paris"));
    assert!(cities[0].to_one("country").unwrap().unwrap().ptr_eq(&france));
}
