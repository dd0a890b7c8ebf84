//! Integration tests for store replication.
//!
//! Stores exchange deltas directly, without any transport, and must
//! converge whatever the merge order.

use std::sync::{Arc, Mutex};

use evcat_core::{CatalogueDraft, Db, Event, EventDraft, Origin};
use uuid::Uuid;

fn event(db: &Db, start: &str, author: &str) -> Event {
    db.create_event(EventDraft::new(start, "2030-01-01", author)).unwrap()
}

#[test]
fn test_sync_both_ways_converges() {
    let db0 = Db::new();
    let db1 = Db::new();
    for i in 0..5 {
        event(&db0, &format!("2025-01-0{}", i + 1), "Paul");
        event(&db1, &format!("2026-01-0{}", i + 1), "Mike");
    }
    db0.create_catalogue(CatalogueDraft::new("cat0", "John")).unwrap();
    db1.create_catalogue(CatalogueDraft::new("cat1", "Jeane")).unwrap();

    db0.sync(&db1).unwrap();
    db1.sync(&db0).unwrap();

    assert_eq!(db0.events().len(), 10);
    assert_eq!(db0.events(), db1.events());
    assert_eq!(db0.catalogues(), db1.catalogues());
    assert_eq!(db0.to_json().unwrap(), db1.to_json().unwrap());
}

#[test]
fn test_add_events_after_sync() {
    let db0 = Db::new();
    let db1 = Db::new();
    db0.sync(&db1).unwrap();
    let cat = db0.create_catalogue(CatalogueDraft::new("cat", "John")).unwrap();
    let e = event(&db0, "2025-01-31", "John");
    let cat = db0.add_events(&cat, [&e]).unwrap();

    db1.sync(&db0).unwrap();
    assert_eq!(db1.catalogues(), vec![cat]);
    assert_eq!(db1.events(), vec![e]);
}

#[test]
fn test_merge_order_and_duplication_do_not_matter() {
    let a = Db::new();
    let b = Db::new();
    let deltas = Arc::new(Mutex::new(Vec::new()));
    for db in [&a, &b] {
        let deltas = deltas.clone();
        db.on_update(move |delta, origin| {
            if origin == Origin::Local {
                deltas.lock().unwrap().push(delta.to_vec());
            }
        });
    }
    let ea = event(&a, "2025-01-01", "a");
    let cat = a.create_catalogue(CatalogueDraft::new("cat", "a")).unwrap();
    a.add_events(&cat, [&ea]).unwrap();
    event(&b, "2025-02-01", "b");
    event(&b, "2025-03-01", "b");

    let deltas = deltas.lock().unwrap().clone();
    assert_eq!(deltas.len(), 5);

    let forward = Db::new();
    for delta in &deltas {
        forward.merge_delta(delta).unwrap();
    }
    let backward = Db::new();
    for delta in deltas.iter().rev().chain(deltas.iter()) {
        backward.merge_delta(delta).unwrap();
    }

    assert_eq!(forward.events().len(), 3);
    assert_eq!(forward.events(), backward.events());
    assert_eq!(forward.catalogues(), backward.catalogues());
    assert_eq!(forward.catalogues()[0].events, vec![ea.uuid]);
}

#[test]
fn test_transaction_is_atomic_for_peers() {
    let origin = Db::new();
    let deltas = Arc::new(Mutex::new(Vec::new()));
    let sink = deltas.clone();
    origin.on_update(move |delta, _| sink.lock().unwrap().push(delta.to_vec()));

    let (e, cat) = {
        let _tx = origin.transaction();
        let e = event(&origin, "2025-01-31", "John");
        let cat = origin.create_catalogue(CatalogueDraft::new("cat", "John")).unwrap();
        let cat = origin.add_events(&cat, [&e]).unwrap();
        (e, cat)
    };

    let deltas = deltas.lock().unwrap();
    assert_eq!(deltas.len(), 1);

    let peer = Db::new();
    assert!(peer.catalogues().is_empty());
    peer.merge_delta(&deltas[0]).unwrap();
    let seen = peer.get_catalogue(cat.uuid).unwrap();
    assert_eq!(seen.events, vec![e.uuid]);
    assert_eq!(peer.catalogue_events(&seen).unwrap(), vec![e]);
}

#[test]
fn test_on_create_event_fires_only_for_remote_events() {
    let db0 = Db::new();
    let db1 = Db::new();
    let seen0 = Arc::new(Mutex::new(Vec::<Uuid>::new()));
    let seen1 = Arc::new(Mutex::new(Vec::<Uuid>::new()));
    let s0 = seen0.clone();
    db0.on_create_event(move |e| s0.lock().unwrap().push(e.uuid));
    let s1 = seen1.clone();
    db1.on_create_event(move |e| s1.lock().unwrap().push(e.uuid));

    let e = event(&db0, "2025-01-31", "John");
    assert!(seen0.lock().unwrap().is_empty());

    db1.sync(&db0).unwrap();
    assert!(seen0.lock().unwrap().is_empty());
    assert_eq!(*seen1.lock().unwrap(), vec![e.uuid]);

    // Merging the same state again announces nothing new.
    db1.sync(&db0).unwrap();
    assert_eq!(seen1.lock().unwrap().len(), 1);
}

#[test]
fn test_dangling_reference_resolves_after_merge() {
    let observer = Db::new();
    let curator = Db::new();
    let reader = Db::new();

    let e = event(&observer, "2025-01-31", "Paul");
    let cat = curator.create_catalogue(CatalogueDraft::new("cat", "John").event(e.uuid)).unwrap();

    reader.pull_from(&curator).unwrap();
    let partial = reader.get_catalogue("cat").unwrap();
    assert_eq!(partial.events, vec![e.uuid]);
    assert!(reader.catalogue_events(&partial).unwrap().is_empty());

    reader.pull_from(&observer).unwrap();
    assert_eq!(reader.catalogue_events(&cat).unwrap(), vec![e]);
}

#[test]
fn test_dump_load_is_byte_identical() {
    let db0 = Db::new();
    let e = event(&db0, "2025-01-31", "Paul");
    let cat = db0.create_catalogue(CatalogueDraft::new("cat", "John").tags(["a", "b"])).unwrap();
    db0.add_events(&cat, [&e]).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path0 = dir.path().join("db0.json");
    std::fs::write(&path0, db0.to_json().unwrap()).unwrap();

    let db1 = Db::from_json(&std::fs::read_to_string(&path0).unwrap()).unwrap();
    assert_eq!(db1.events(), vec![e]);
    assert_eq!(db1.catalogues(), db0.catalogues());

    let path1 = dir.path().join("db1.json");
    std::fs::write(&path1, db1.to_json().unwrap()).unwrap();
    assert_eq!(std::fs::read(&path0).unwrap(), std::fs::read(&path1).unwrap());
}

#[test]
fn test_missing_catalogue_message() {
    let db = Db::new();
    let err = db.get_catalogue(Uuid::new_v4()).unwrap_err();
    assert!(err.to_string().starts_with("No catalogue found with name or UUID"));
}
