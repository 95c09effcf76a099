// Integration tests for knndb-core: storage, indexing, query and cursor
// behavior end to end.

use std::collections::HashSet;
use std::sync::Arc;

use knndb_core::collection::Collection;
use knndb_core::config::Config;
use knndb_core::crud;
use knndb_core::cursor::{get_cursor, reap_expired_cursors, Cursor};
use knndb_core::database::Database;
use knndb_core::index::Index;
use knndb_core::query::QueryExecutor;
use knndb_core::storage::EMPTY_ROW_SEQUENCE;
use serde_json::{json, Value};
use tempfile::TempDir;

fn open_db(dir: &TempDir) -> Arc<Database> {
    Database::load(Config::with_data_path(dir.path())).unwrap()
}

fn key_value_index(name: &str, key: &str) -> Index {
    Index::from_metadata(&json!({
        "name": name, "type": 0, "keyName": key, "isHashedIndex": false
    }))
    .unwrap()
}

// ============================================================================
// PROPERTY 1: INSERT ROUND-TRIP
// ============================================================================

#[test]
fn test_insert_round_trip() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    let docs: Vec<Value> = (0..20).map(|i| json!({"n": i})).collect();
    let response = crud::create(&db, &json!({ "things": docs }));
    assert_eq!(response["status"], "ok");
    let new_ids: HashSet<u64> = response["newIds"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_u64().unwrap())
        .collect();
    assert_eq!(new_ids.len(), 20);

    db.save();

    let selected = crud::select(&db, &json!({"collection": "things", "query": {}}));
    assert_eq!(selected["status"], "ok");
    assert_eq!(selected["count"], 20);

    let selected_ids: HashSet<u64> = selected["result"]
        .as_array()
        .unwrap()
        .iter()
        .map(|item| item[2]["id"].as_u64().unwrap())
        .collect();
    assert_eq!(selected_ids, new_ids);
}

// ============================================================================
// PROPERTY 2: EQUALITY SINGLE-HIT
// ============================================================================

#[test]
fn test_equality_single_hit_scores_one() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    let col = db.create_collection("things").unwrap();

    col.insert_documents(vec![
        json!({"id": 42, "color": "red"}),
        json!({"id": 43, "color": "blue"}),
    ])
    .unwrap();
    col.add_index(key_value_index("by_color", "color"));
    col.build_indexes();

    let response = crud::select(&db, &json!({"collection": "things", "query": {"color": "red"}}));
    assert_eq!(response["count"], 1);
    let hit = &response["result"][0];
    assert_eq!(hit[1], 1.0);
    assert_eq!(hit[2]["id"], 42);
}

// ============================================================================
// PROPERTY 3: MULTI-KEY AND SEMANTICS
// ============================================================================

#[test]
fn test_multi_key_and_semantics() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    let col = db.create_collection("shirts").unwrap();

    col.insert_documents(vec![
        json!({"id": 1, "color": "red", "size": "L"}),
        json!({"id": 2, "color": "red", "size": "S"}),
        json!({"id": 3, "color": "blue", "size": "L"}),
        json!({"id": 4, "color": "blue", "size": "S"}),
    ])
    .unwrap();
    col.add_index(
        Index::from_metadata(&json!({
            "name": "by_color_size", "type": 1, "keyNames": ["color", "size"],
            "isFullHashedIndex": false, "isHashedIndex": []
        }))
        .unwrap(),
    );
    col.build_indexes();

    let response = crud::select(
        &db,
        &json!({"collection": "shirts", "query": {"color": "red", "size": "L"}}),
    );
    assert_eq!(response["count"], 1);
    assert_eq!(response["result"][0][2]["id"], 1);
}

// ============================================================================
// PROPERTY 4: RANGE BOUNDS INCLUSIVE
// ============================================================================

#[test]
fn test_range_bounds_inclusive() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    let col = db.create_collection("numbers").unwrap();

    let docs: Vec<Value> = (4..=9).map(|n| json!({"id": n, "n": n})).collect();
    col.insert_documents(docs).unwrap();
    col.add_index(Index::from_metadata(&json!({"name": "by_n", "type": 3, "keyName": "n"})).unwrap());
    col.build_indexes();

    let response = crud::select(
        &db,
        &json!({
            "collection": "numbers",
            "query": {"#range": {"fieldName": "n", "lower": 5, "higher": 8}}
        }),
    );

    let mut ids: Vec<u64> = response["result"]
        .as_array()
        .unwrap()
        .iter()
        .map(|item| item[2]["id"].as_u64().unwrap())
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![5, 6, 7, 8]);
}

// ============================================================================
// PROPERTY 5: KNN ORDERING AND CONTRIBUTION BOUND
// ============================================================================

#[test]
fn test_knn_ordering_and_contribution_bound() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    let col = db.create_collection("vectors").unwrap();

    col.insert_documents(vec![
        json!({"id": 1, "vec": [0.0, 0.0, 0.0]}),
        json!({"id": 2, "vec": [1.0, 0.0, 0.0]}),
        json!({"id": 3, "vec": [3.0, 0.0, 0.0]}),
        json!({"id": 4, "vec": [10.0, 0.0, 0.0]}),
    ])
    .unwrap();
    col.add_index(
        Index::from_metadata(&json!({"name": "ann", "type": 2, "keyName": "vec", "space": 3}))
            .unwrap(),
    );
    col.build_indexes();

    let response = crud::select(
        &db,
        &json!({
            "collection": "vectors",
            "query": {"#similar": {"fieldName": "vec", "value": [0.0, 0.0, 0.0], "k": 4}}
        }),
    );
    let result = response["result"].as_array().unwrap();
    assert_eq!(result.len(), 4);

    // Ascending L2 distance means descending score.
    let ids: Vec<u64> = result.iter().map(|i| i[2]["id"].as_u64().unwrap()).collect();
    assert_eq!(ids, vec![1, 2, 3, 4]);

    let scores: Vec<f64> = result.iter().map(|i| i[1].as_f64().unwrap()).collect();
    for pair in scores.windows(2) {
        assert!(pair[0] > pair[1]);
    }

    // The spread of KNN-only contributions stays within the ceiling.
    let spread = scores.first().unwrap() - scores.last().unwrap();
    assert!(spread <= 850.0 + 1e-3, "spread was {}", spread);
}

// ============================================================================
// PROPERTY 6: REBUILD UNDER CONCURRENT READS
// ============================================================================

#[test]
fn test_rebuild_under_concurrent_reads() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    let col = db.create_collection("things").unwrap();

    let docs: Vec<Value> = (0..200)
        .map(|i| json!({"id": i, "color": if i % 2 == 0 { "red" } else { "blue" }}))
        .collect();
    col.insert_documents(docs).unwrap();
    col.add_index(key_value_index("by_color", "color"));
    col.build_indexes();

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let db = Arc::clone(&db);
            std::thread::spawn(move || {
                for _ in 0..50 {
                    let response = crud::select(
                        &db,
                        &json!({"collection": "things", "query": {"color": "red"}}),
                    );
                    assert_eq!(response["status"], "ok");
                    // Old or new catalog generation, never an empty one.
                    let col = db.collection("things").unwrap();
                    assert!(!col.catalog().is_empty());
                }
            })
        })
        .collect();

    for _ in 0..10 {
        col.build_indexes();
    }
    for reader in readers {
        reader.join().unwrap();
    }

    let response = crud::select(&db, &json!({"collection": "things", "query": {"color": "red"}}));
    assert_eq!(response["count"], 100);
}

// ============================================================================
// PROPERTY 7: CURSOR DRAIN
// ============================================================================

#[test]
fn test_cursor_drains_each_id_once_in_rank_order() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    let col = db.create_collection("paged").unwrap();

    let docs: Vec<Value> = (1..=125u64).map(|i| json!({"id": i})).collect();
    col.insert_documents(docs).unwrap();

    let response = crud::select(
        &db,
        &json!({"collection": "paged", "query": {}, "cursor": true}),
    );
    assert_eq!(response["count"], 125);
    let uuid = response["cursor_uuid"].as_str().unwrap().to_string();

    let mut seen = Vec::new();
    let mut batch_sizes = Vec::new();
    loop {
        let batch = crud::fetch_cursor(&json!({ "cursor_uuid": uuid }));
        assert_eq!(batch["status"], "ok");
        let items = batch["items"].as_array().unwrap();
        batch_sizes.push(items.len());
        for item in items {
            seen.push(item[2]["id"].as_u64().unwrap());
        }
        if batch["finished"].as_bool().unwrap() {
            break;
        }
    }

    assert_eq!(batch_sizes, vec![50, 50, 25]);
    assert_eq!(seen.len(), 125);
    let unique: HashSet<u64> = seen.iter().copied().collect();
    assert_eq!(unique.len(), 125);

    // A finished cursor killed itself.
    assert!(get_cursor(&uuid).is_none());
}

// ============================================================================
// PROPERTY 8: CURSOR TIMEOUT
// ============================================================================

#[test]
fn test_cursor_timeout_reclamation() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    let col = db.create_collection("idle").unwrap();
    col.insert_documents(vec![json!({"id": 1})]).unwrap();

    let cursor = Cursor::create(
        col,
        vec![(1, 1.0)],
        Default::default(),
        50,
        0, // expires immediately
    );
    assert!(get_cursor(&cursor.id).is_some());

    reap_expired_cursors();
    assert!(get_cursor(&cursor.id).is_none());
}

// ============================================================================
// PROPERTY 9: TTL SWEEP
// ============================================================================

#[test]
fn test_ttl_sweep_removes_and_tombstones() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    let col = db.create_collection("mortal").unwrap();

    let now = chrono::Utc::now().timestamp();
    col.insert_documents(vec![
        json!({"id": 1, "&ttl": now - 1}),
        json!({"id": 2}),
    ])
    .unwrap();

    col.ttl_sweep();

    let response = crud::select(&db, &json!({"collection": "mortal", "query": {}}));
    let ids: Vec<u64> = response["result"]
        .as_array()
        .unwrap()
        .iter()
        .map(|i| i[2]["id"].as_u64().unwrap())
        .collect();
    assert_eq!(ids, vec![2]);

    // The sweep saved: the expired slot is a sentinel row now.
    let segment = &col.segments()[0];
    let content = std::fs::read_to_string(segment.path()).unwrap();
    let sentinels = content.lines().filter(|l| *l == EMPTY_ROW_SEQUENCE).count();
    assert_eq!(sentinels, 1);
}

// ============================================================================
// PROPERTY 10: CRASH-LEFTOVER TOLERANCE
// ============================================================================

#[test]
fn test_crash_leftover_tolerance() {
    let dir = TempDir::new().unwrap();
    {
        let db = open_db(&dir);
        let col = db.create_collection("survivors").unwrap();
        col.insert_documents(vec![json!({"id": 1}), json!({"id": 2})])
            .unwrap();
        db.save();
    }

    let leftover = dir.path().join("col_survivors").join("torn.knndb");
    std::fs::write(&leftover, "{\"id\": 3, \"partial").unwrap();

    let db = open_db(&dir);
    let col = db.collection("survivors").unwrap();
    assert_eq!(col.count_documents(), 2);
    assert!(!leftover.exists());
}

// ============================================================================
// SEGMENT COMPACTION (remove + save + reload)
// ============================================================================

#[test]
fn test_remove_save_reload_compacts() {
    let dir = TempDir::new().unwrap();
    let col = Collection::new("c".to_string(), dir.path().to_path_buf(), 50_000);
    col.insert_documents(vec![
        json!({"id": 1}),
        json!({"id": 2}),
        json!({"id": 3}),
    ])
    .unwrap();
    // Everything sits in one segment so the tombstone count is observable.
    assert_eq!(col.segments().len(), 1);
    let segment = &col.segments()[0];
    segment.save().unwrap();

    assert!(segment.remove(2));
    segment.save().unwrap();

    let reloaded = knndb_core::storage::StorageSegment::open(segment.path()).unwrap();
    assert_eq!(reloaded.count_documents(), 2);

    let content = std::fs::read_to_string(segment.path()).unwrap();
    let sentinels = content.lines().filter(|l| *l == EMPTY_ROW_SEQUENCE).count();
    assert_eq!(sentinels, 1);
}

// ============================================================================
// SELECT-ALL FALLBACK AND LIMIT
// ============================================================================

#[test]
fn test_limit_truncates_ranked_results() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    let col = db.create_collection("limited").unwrap();

    let docs: Vec<Value> = (1..=30u64).map(|i| json!({"id": i})).collect();
    col.insert_documents(docs).unwrap();

    let mut executor = QueryExecutor::new(col);
    executor.run(&json!({"#limit": 10})).unwrap();
    assert_eq!(executor.export().len(), 10);
}
