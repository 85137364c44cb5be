//! End-to-end tests across the connection lifecycle, reconciliation,
//! CRUD, filtering, and events, driven through the in-memory engine.

use clientdb_core::{
    Callbacks, ClientDb, DbError, Document, IndexSpec, Options, StoreSchema, Trigger,
};
use clientdb_engine::MemoryEngine;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn doc(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        other => panic!("expected object, got {other}"),
    }
}

fn queries(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected object, got {other}"),
    }
}

fn people_options(name: &str) -> Options {
    Options::new().name(name).store(
        StoreSchema::new("people")
            .key("name", IndexSpec::plain())
            .key("age", IndexSpec::plain()),
    )
}

fn open_people(name: &str) -> ClientDb {
    ClientDb::open(Arc::new(MemoryEngine::new()), people_options(name)).unwrap()
}

#[test]
fn filter_by_equality_finds_inserted_record() {
    let db = open_people("eq");
    let people = db.collect("people").unwrap();
    people
        .insert_one(doc(json!({"_id": "a", "name": "x"})))
        .unwrap();

    let outcome = people.filter(queries(json!({"name": "x"}))).run().unwrap();

    assert_eq!(outcome.items.len(), 1);
    assert_eq!(outcome.items[0].get("_id"), Some(&json!("a")));
    assert!(outcome.errors.is_empty());
}

#[test]
fn range_is_closed_and_gt_excludes_its_bound() {
    let db = open_people("range");
    let people = db.collect("people").unwrap();
    people
        .insert(vec![
            doc(json!({"_id": "a", "age": 20})),
            doc(json!({"_id": "b", "age": 30})),
            doc(json!({"_id": "c", "age": 50})),
        ])
        .unwrap();

    let closed = people
        .filter(queries(json!({"age": [20, 50]})))
        .run()
        .unwrap();
    assert_eq!(closed.items.len(), 3);

    let exclusive = people
        .filter(queries(json!({"age": {"gt": 20}})))
        .run()
        .unwrap();
    let ages: Vec<i64> = exclusive
        .items
        .iter()
        .map(|item| item.get("age").unwrap().as_i64().unwrap())
        .collect();
    assert_eq!(ages, vec![30, 50]);
}

#[test]
fn multi_field_filter_ors_predicates_and_dedupes_by_primary_key() {
    let db = open_people("or");
    let people = db.collect("people").unwrap();
    people
        .insert(vec![
            doc(json!({"_id": "a", "name": "x", "age": 30})),
            doc(json!({"_id": "b", "name": "y", "age": 99})),
            doc(json!({"_id": "c", "name": "z", "age": 10})),
        ])
        .unwrap();

    // OR semantics: "b" matches only the age predicate, "a" matches both
    // but appears once.
    let outcome = people
        .filter(queries(json!({"name": "x", "age": {"gte": 30}})))
        .run()
        .unwrap();

    let mut ids: Vec<&str> = outcome
        .items
        .iter()
        .map(|item| item.get("_id").unwrap().as_str().unwrap())
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, vec!["a", "b"]);
    assert!(outcome.errors.is_empty());
}

#[test]
fn every_predicate_is_attempted_and_failures_are_partial() {
    let db = open_people("partial");
    let people = db.collect("people").unwrap();
    people
        .insert_one(doc(json!({"_id": "a", "name": "x", "height": 1.9})))
        .unwrap();

    // "height" has no index: that predicate fails, the sibling completes.
    let outcome = people
        .filter(queries(json!({"name": "x", "height": {"gt": 1.5}})))
        .run()
        .unwrap();

    assert_eq!(outcome.items.len(), 1);
    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(outcome.errors[0].property, "height");
}

#[test]
fn empty_filter_yields_empty_result_without_error() {
    let db = open_people("empty");
    let people = db.collect("people").unwrap();
    people.insert_one(doc(json!({"_id": "a"}))).unwrap();

    let outcome = people.filter(Map::new()).run().unwrap();
    assert!(outcome.items.is_empty());
    assert!(outcome.errors.is_empty());
}

#[test]
fn malformed_predicate_preempts_the_whole_run() {
    let db = open_people("malformed");
    let people = db.collect("people").unwrap();

    let result = people
        .filter(queries(json!({"name": "x", "age": [1, 2, 3]})))
        .run();
    assert!(matches!(result, Err(DbError::Parse { .. })));
}

#[test]
fn sort_and_paging_record_intent_but_do_not_shape_results() {
    let db = open_people("inert");
    let people = db.collect("people").unwrap();
    for (id, age) in [("a", 3), ("b", 1), ("c", 2)] {
        people.insert_one(doc(json!({"_id": id, "age": age}))).unwrap();
    }

    let filter = people
        .filter(queries(json!({"age": [0, 10]})))
        .sort(&["age"])
        .paging(1, 2);
    assert_eq!(filter.orders().to_vec(), vec!["age"]);
    assert_eq!(filter.limit(), Some(2));

    // run() ignores the recorded intent: all three come back, in index
    // scan order.
    let outcome = filter.run().unwrap();
    assert_eq!(outcome.items.len(), 3);
}

#[test]
fn remove_accepts_every_documented_shape() {
    let db = open_people("remove-shapes");
    let people = db.collect("people").unwrap();

    for form in 0..4 {
        people
            .insert_one(doc(json!({"_id": "victim", "name": "v"})))
            .unwrap();
        let outcome = match form {
            0 => people.remove("victim").unwrap(),
            1 => people.remove(doc(json!({"_id": "victim"}))).unwrap(),
            2 => people.remove(vec!["victim"]).unwrap(),
            _ => people
                .remove(vec![doc(json!({"_id": "victim"}))])
                .unwrap(),
        };
        assert_eq!(outcome.changes.removed, 1, "form {form}");
        assert!(people.get("victim").unwrap().is_none(), "form {form}");
    }
}

#[test]
fn concurrent_checkouts_close_the_handle_exactly_once() {
    let db = Arc::new(open_people("refcount"));
    let connection = db.connection();

    let first = connection.acquire().unwrap();
    let second = connection.acquire().unwrap();

    first.release();
    assert!(
        connection.is_open(),
        "handle must stay open after one of two releases"
    );

    second.release();
    assert!(!connection.is_open(), "last release closes the handle");

    // Threaded variant: many checkouts, one eventual close.
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                let checkout = db.connection().acquire().unwrap();
                thread::sleep(Duration::from_millis(10));
                checkout.release();
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert!(!db.connection().is_open());
}

#[test]
fn once_subscription_fires_once_across_three_mutations() {
    let db = open_people("once");
    let people = db.collect("people").unwrap();

    let once_fires = Arc::new(AtomicUsize::new(0));
    let every_fires = Arc::new(AtomicUsize::new(0));
    {
        let once_fires = Arc::clone(&once_fires);
        people.events().subscribe(
            "insert",
            Trigger::new(move |_, _| {
                once_fires.fetch_add(1, Ordering::SeqCst);
            })
            .once(),
            false,
        );
    }
    {
        let every_fires = Arc::clone(&every_fires);
        people.subscribe("insert", move |_, _| {
            every_fires.fetch_add(1, Ordering::SeqCst);
        });
    }

    for id in ["a", "b", "c"] {
        people.insert_one(doc(json!({"_id": id}))).unwrap();
    }

    assert_eq!(once_fires.load(Ordering::SeqCst), 1);
    assert_eq!(every_fires.load(Ordering::SeqCst), 3);
}

#[test]
fn reopening_a_matching_schema_performs_no_structural_mutations() {
    let engine: Arc<MemoryEngine> = Arc::new(MemoryEngine::new());

    {
        let db = ClientDb::open(
            Arc::clone(&engine) as Arc<dyn clientdb_engine::Engine>,
            people_options("rematch"),
        )
        .unwrap();
        let people = db.collect("people").unwrap();
        people.insert_one(doc(json!({"_id": "a", "name": "x"}))).unwrap();
    }

    // Same layout, bumped version: reconciliation must be a no-op (no
    // duplicate-index errors) and data must survive.
    let db = ClientDb::open(
        Arc::clone(&engine) as Arc<dyn clientdb_engine::Engine>,
        people_options("rematch").version(2),
    )
    .unwrap();
    assert_eq!(db.version(), 2);

    let people = db.collect("people").unwrap();
    assert_eq!(people.count().unwrap(), 1);
    let outcome = people.filter(queries(json!({"name": "x"}))).run().unwrap();
    assert_eq!(outcome.items.len(), 1);
}

#[test]
fn schema_evolution_bumps_versions_and_reshapes_indexes() {
    let db = ClientDb::open(
        Arc::new(MemoryEngine::new()),
        people_options("evolve").allow_schema_update(true),
    )
    .unwrap();
    assert_eq!(db.version(), 1);

    // New collection at version 2.
    let mut keys = std::collections::BTreeMap::new();
    keys.insert("title".to_string(), IndexSpec::plain());
    assert_eq!(db.create_store("posts", keys).unwrap(), 2);

    let posts = db.collect("posts").unwrap();
    posts
        .insert_one(doc(json!({"_id": "p1", "title": "hello", "tag": "t"})))
        .unwrap();

    // Swap the index set at version 3: "title" goes away, "tag" arrives.
    let mut keys = std::collections::BTreeMap::new();
    keys.insert("tag".to_string(), IndexSpec::plain());
    assert_eq!(db.update_keys("posts", keys).unwrap(), 3);

    let by_tag = posts.filter(queries(json!({"tag": "t"}))).run().unwrap();
    assert_eq!(by_tag.items.len(), 1);

    let by_title = posts.filter(queries(json!({"title": "hello"}))).run().unwrap();
    assert!(by_title.items.is_empty());
    assert_eq!(by_title.errors.len(), 1, "deleted index must fail its predicate");

    // Collection removal at version 4.
    assert_eq!(db.remove_store("posts").unwrap(), 4);
    assert!(db.collect("posts").is_none());
}

#[test]
fn upgrade_blocked_by_another_instance_waits_then_completes() {
    let engine: Arc<MemoryEngine> = Arc::new(MemoryEngine::new());

    let holder = ClientDb::open(
        Arc::clone(&engine) as Arc<dyn clientdb_engine::Engine>,
        people_options("blocked"),
    )
    .unwrap();
    let held = holder.connection().acquire().unwrap();

    let upgrader = {
        let engine = Arc::clone(&engine) as Arc<dyn clientdb_engine::Engine>;
        thread::spawn(move || {
            let db = ClientDb::open(engine, people_options("blocked").version(2)).unwrap();
            db.version()
        })
    };

    // The upgrader is blocked behind the held version-1 handle; it waits
    // with no timeout until the holder releases.
    thread::sleep(Duration::from_millis(50));
    held.release();

    assert_eq!(upgrader.join().unwrap(), 2);
}

#[test]
fn destroy_ends_every_surface() {
    let db = open_people("doomed");
    let people = db.collect("people").unwrap();
    people.insert_one(doc(json!({"_id": "a"}))).unwrap();

    db.destroy().unwrap();

    assert!(matches!(people.records(), Err(DbError::Closed { .. })));
    assert!(matches!(
        people.filter(queries(json!({"name": "x"}))).run(),
        Err(DbError::Closed { .. })
    ));
}

#[test]
fn open_waiter_form_serves_consumers_on_the_open_event() {
    let db = open_people("waiters");
    let served = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
        let served = Arc::clone(&served);
        db.connection().open(move |connection| {
            assert_eq!(connection.version(), 1);
            served.fetch_add(1, Ordering::SeqCst);
        });
    }

    assert_eq!(served.load(Ordering::SeqCst), 2);
}

#[test]
fn open_callbacks_observe_outcomes() {
    let successes = Arc::new(AtomicUsize::new(0));
    let successes_in_cb = Arc::clone(&successes);

    let db = ClientDb::open_with_callbacks(
        Arc::new(MemoryEngine::new()),
        people_options("callbacks"),
        Callbacks::new().on_success(move |version| {
            assert!(version >= 1);
            successes_in_cb.fetch_add(1, Ordering::SeqCst);
        }),
    )
    .unwrap();

    assert_eq!(successes.load(Ordering::SeqCst), 1);
    db.collect("people").unwrap().count().unwrap();
    assert_eq!(successes.load(Ordering::SeqCst), 2);
}

#[test]
fn unique_index_violations_are_per_record_errors() {
    let db = ClientDb::open(
        Arc::new(MemoryEngine::new()),
        Options::new().name("unique").store(
            StoreSchema::new("accounts").key("email", IndexSpec::unique()),
        ),
    )
    .unwrap();
    let accounts = db.collect("accounts").unwrap();

    let outcome = accounts
        .insert(vec![
            doc(json!({"_id": "a", "email": "x@y"})),
            doc(json!({"_id": "b", "email": "x@y"})),
        ])
        .unwrap();

    assert_eq!(outcome.changes.inserted, 1);
    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(outcome.errors[0].property, "email");
    assert_eq!(accounts.count().unwrap(), 1);
}
