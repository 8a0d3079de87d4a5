//! End-to-end scenarios exercising the full stack through the `Engine`
//! facade: one open database file, real pages, a real WAL, and real B+ tree
//! indexes.

use embeddb::document::{DocValue, Document, IndexKey, ObjectId};
use embeddb::index::BTreeIndex;
use embeddb::storage::pager::PageManager;
use embeddb::{DbError, Engine, EngineOptions};

fn open(dir: &std::path::Path) -> Engine {
    Engine::open(dir.join("scenario.tinydb"), EngineOptions::new()).unwrap()
}

#[test]
fn scenario_insert_then_find_by_id() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open(dir.path());

    let id = ObjectId::from_hex("000000010000000000000001").unwrap();
    let doc = Document::new(id, "users")
        .with_field("Name", DocValue::Str("Alice".into()))
        .with_field("Age", DocValue::Int64(30));
    engine.insert("users", doc).unwrap();

    let found = engine.find_by_id("users", id).unwrap().unwrap();
    assert_eq!(found.get("Name"), Some(&DocValue::Str("Alice".into())));
    assert_eq!(found.get("Age"), Some(&DocValue::Int64(30)));
    assert_eq!(engine.count("users").unwrap(), 1);
}

#[test]
fn scenario_unique_violation_on_duplicate_email() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open(dir.path());
    engine.create_index("users", "Email", true).unwrap();

    let a = ObjectId::new();
    let b = ObjectId::new();
    engine.insert("users", Document::new(a, "users").with_field("Email", DocValue::Str("x@y".into()))).unwrap();
    let result = engine.insert("users", Document::new(b, "users").with_field("Email", DocValue::Str("x@y".into())));

    assert!(matches!(result, Err(DbError::UniqueViolation { .. })));
    assert_eq!(engine.count("users").unwrap(), 1);

    let matches = engine.find_many("users", &embeddb::engine::DocFilter::eq("Email", DocValue::Str("x@y".into()))).unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].id, a);
}

#[test]
fn scenario_update_grows_then_shrinks_to_single_live_slot() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open(dir.path());

    let id = ObjectId::new();
    engine.insert("blobs", Document::new(id, "blobs").with_field("data", DocValue::Str("a".repeat(100)))).unwrap();
    engine.update("blobs", id, |doc| doc.set("data", DocValue::Str("b".repeat(200)))).unwrap();
    engine.update("blobs", id, |doc| doc.set("data", DocValue::Str("c".repeat(50)))).unwrap();

    let found = engine.find_by_id("blobs", id).unwrap().unwrap();
    assert_eq!(found.get("data"), Some(&DocValue::Str("c".repeat(50))));
    assert_eq!(engine.count("blobs").unwrap(), 1);
    assert_eq!(engine.find_all("blobs").unwrap().len(), 1);
}

#[test]
fn scenario_transactional_rollback_restores_prior_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scenario.tinydb");
    let pre_existing = ObjectId::new();
    {
        let engine = Engine::open(&path, EngineOptions::new()).unwrap();
        engine.insert("people", Document::new(pre_existing, "people").with_field("Age", DocValue::Int64(50))).unwrap();

        let txn_id = engine.begin_transaction().unwrap();
        for _ in 0..3 {
            engine.insert_in(txn_id, "people", Document::new(ObjectId::new(), "people")).unwrap();
        }
        engine.update_in(txn_id, "people", pre_existing, |doc| doc.set("Age", DocValue::Int64(999))).unwrap();
        engine.rollback(txn_id).unwrap();

        assert_eq!(engine.count("people").unwrap(), 1);
        let found = engine.find_by_id("people", pre_existing).unwrap().unwrap();
        assert_eq!(found.get("Age"), Some(&DocValue::Int64(50)));
        engine.close().unwrap();
    }

    let engine = Engine::open(&path, EngineOptions::new()).unwrap();
    assert_eq!(engine.count("people").unwrap(), 1);
    let found = engine.find_by_id("people", pre_existing).unwrap().unwrap();
    assert_eq!(found.get("Age"), Some(&DocValue::Int64(50)));
}

/// The default `Journaled` write concern only fsyncs the WAL record itself
/// at commit time — dirty data pages are left for the background flush to
/// pick up later. A reopen after a hard kill (no clean `close`, no
/// intervening background flush) must still see every committed row by
/// redoing each committed transaction's logged page images from the WAL.
#[test]
fn scenario_synced_commit_survives_reopen_without_clean_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scenario.tinydb");
    {
        let engine = Engine::open(&path, EngineOptions::new().background_flush_interval_ms(60_000)).unwrap();
        for i in 0..10i64 {
            engine.insert("events", Document::new(ObjectId::new(), "events").with_field("n", DocValue::Int64(i))).unwrap();
        }
        // No `close()` here: this stands in for the process being killed
        // right after the tenth commit returns.
    }

    let engine = Engine::open(&path, EngineOptions::new()).unwrap();
    assert_eq!(engine.count("events").unwrap(), 10);
}

#[test]
fn scenario_btree_range_covers_extreme_keys() {
    let dir = tempfile::tempdir().unwrap();
    let pager = PageManager::open(dir.path().join("idx.db"), 4096, 64).unwrap();
    let idx = BTreeIndex::new(&pager, false);

    let keys = [i32::MIN, -1, 0, 1, i32::MAX];
    let ids: Vec<ObjectId> = (0..keys.len()).map(|_| ObjectId::new()).collect();
    let mut root = 0;
    for (key, id) in keys.iter().zip(&ids) {
        let (_inserted, new_root) = idx.insert(root, IndexKey::single(DocValue::Int32(*key)), *id).unwrap();
        root = new_root;
    }

    let all = idx.find_range(root, &IndexKey::MinValue, &IndexKey::MaxValue, true, true).unwrap();
    assert_eq!(all, ids);

    let zero_hits = idx.find(root, &IndexKey::single(DocValue::Int32(0))).unwrap();
    assert_eq!(zero_hits, vec![ids[2]]);

    let (removed, root) = idx.delete(root, &IndexKey::single(DocValue::Int32(0)), ids[2]).unwrap();
    assert!(removed);
    let remaining = idx.find_range(root, &IndexKey::MinValue, &IndexKey::MaxValue, true, true).unwrap();
    assert_eq!(remaining.len(), 4);
    idx.validate(root).unwrap();
}
