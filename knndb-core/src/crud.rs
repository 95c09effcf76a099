// knndb-core/src/crud.rs
// The CRUD surface: create/select/update/remove plus cursor retrieval,
// speaking the JSON envelope contract. The HTTP layer embedding this crate
// maps routes onto these functions one to one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};

use crate::collection::Collection;
use crate::config::is_truthy;
use crate::cursor::{
    get_cursor, kill_cursor, Cursor, DEFAULT_BATCH_SIZE, DEFAULT_TIMEOUT_SECS,
};
use crate::database::Database;
use crate::document::parse_projection;
use crate::error::{KnnDbError, Result};
use crate::log_error;
use crate::query::QueryExecutor;
use crate::update::validate_update;

/// Truthiness for request parameters: booleans pass through, strings go
/// through the configured truthy set, numbers over 0 are true.
fn truthy_param(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => is_truthy(s),
        Value::Number(n) => n.as_f64().map(|v| v > 0.0).unwrap_or(false),
        _ => false,
    }
}

fn respond(result: Result<Value>, operation: &str) -> Value {
    match result {
        Ok(response) => response,
        Err(e) => {
            log_error!("error raised while {}: {}", operation, e);
            e.to_response()
        }
    }
}

// ============================================================================
// CREATE
// ============================================================================

/// Insert documents: `{ "<collection>": [docs...], ... }`.
///
/// Missing collections are created on the fly (directory plus metadata).
/// Returns every assigned id across all collections, and schedules an index
/// rebuild per touched collection.
pub fn create(db: &Arc<Database>, body: &Value) -> Value {
    respond(create_inner(db, body), "creating")
}

fn create_inner(db: &Arc<Database>, body: &Value) -> Result<Value> {
    let entries = body
        .as_object()
        .ok_or_else(|| KnnDbError::WrongType("create body has to be an object".to_string()))?;

    let mut new_ids: Vec<u64> = Vec::new();
    let mut touched: Vec<Arc<Collection>> = Vec::new();

    for (collection_name, documents) in entries {
        let Some(documents) = documents.as_array() else {
            continue;
        };
        for document in documents {
            if !document.is_object() {
                return Err(KnnDbError::WrongType(
                    "documents have to be objects".to_string(),
                ));
            }
        }

        let collection = db.create_collection(collection_name)?;
        let ids = collection.insert_documents(documents.clone())?;
        new_ids.extend(ids);
        touched.push(collection);
    }

    for collection in touched {
        std::thread::spawn(move || collection.build_indexes());
    }

    Ok(json!({ "status": "ok", "newIds": new_ids }))
}

// ============================================================================
// SELECT
// ============================================================================

/// Run a query: `{ collection, query, projection?, cursor? }`.
///
/// Direct mode answers `{result: [[i, score, doc], ...], count}`. With a
/// truthy `cursor` the ranked ids go into a registered cursor instead and
/// the answer is `{cursor_uuid, count}`.
pub fn select(db: &Arc<Database>, request: &Value) -> Value {
    respond(select_inner(db, request), "selecting")
}

fn select_inner(db: &Arc<Database>, request: &Value) -> Result<Value> {
    let query = request
        .get("query")
        .ok_or_else(|| KnnDbError::MissingKeys("query/collection is not send".to_string()))?;
    let collection_name = request
        .get("collection")
        .and_then(Value::as_str)
        .ok_or_else(|| KnnDbError::MissingKeys("query/collection is not send".to_string()))?;

    let projection = match request.get("projection") {
        Some(spec) => parse_projection(spec)?,
        None => HashMap::new(),
    };

    let Some(collection) = db.collection(collection_name) else {
        // Unknown collections select nothing.
        return Ok(json!({ "status": "ok", "result": [], "count": 0 }));
    };

    let mut executor = QueryExecutor::new(Arc::clone(&collection));
    executor.run(query)?;
    let results = executor.export();

    if request.get("cursor").map(truthy_param).unwrap_or(false) {
        let count = results.len();
        let cursor = Cursor::create(
            collection,
            results,
            projection,
            DEFAULT_BATCH_SIZE,
            DEFAULT_TIMEOUT_SECS,
        );
        return Ok(json!({ "status": "ok", "cursor_uuid": cursor.id, "count": count }));
    }

    let items = fetch_ranked(&collection, &results, &projection);
    Ok(json!({ "status": "ok", "count": items.len(), "result": items }))
}

/// Materialize `[index, score, document]` triples for ranked ids.
fn fetch_ranked(
    collection: &Arc<Collection>,
    results: &[(u64, f32)],
    projection: &HashMap<String, bool>,
) -> Vec<Value> {
    let segments = collection.segments();
    let mut items = Vec::with_capacity(results.len());

    for (id, score) in results {
        for segment in &segments {
            if !segment.saved_here(*id) {
                continue;
            }
            if let Ok(docs) = segment.get(&[*id], projection, false) {
                if let Some(document) = docs.into_iter().next() {
                    let rank = items.len();
                    items.push(json!([rank, *score, document]));
                }
            }
            break;
        }
    }
    items
}

// ============================================================================
// UPDATE
// ============================================================================

/// Update matching documents: `{ collection, query, update }`.
///
/// The selector runs first; the validated update document is then buffered
/// into every segment holding a matched id, one worker per segment, and a
/// background save performs the edits.
pub fn update(db: &Arc<Database>, request: &Value) -> Value {
    respond(update_inner(db, request), "updating")
}

fn update_inner(db: &Arc<Database>, request: &Value) -> Result<Value> {
    for key in ["query", "update", "collection"] {
        if request.get(key).is_none() {
            return Err(KnnDbError::MissingKeys(
                "query/update/collection is not send".to_string(),
            ));
        }
    }
    let collection_name = request["collection"].as_str().ok_or_else(|| {
        KnnDbError::WrongType("collection has to be a string".to_string())
    })?;
    let update_doc = &request["update"];
    validate_update(update_doc)?;

    let Some(collection) = db.collection(collection_name) else {
        return Ok(json!({ "status": "ok", "effectedDocuments": 0 }));
    };

    let mut executor = QueryExecutor::new(Arc::clone(&collection));
    executor.run(&request["query"])?;
    let doc_ids: Vec<u64> = executor.export().into_iter().map(|(id, _)| id).collect();

    let effected = AtomicUsize::new(0);
    let segments = collection.segments();
    let scope_result = crossbeam::thread::scope(|scope| {
        for segment in &segments {
            let segment = Arc::clone(segment);
            let doc_ids = &doc_ids;
            let effected = &effected;
            scope.spawn(move |_| {
                for id in doc_ids {
                    if segment.saved_here(*id) && segment.edit(*id, update_doc) {
                        effected.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
        }
    });
    if scope_result.is_err() {
        return Err(KnnDbError::Internal(
            "update worker panicked".to_string(),
        ));
    }

    schedule_save(db);
    Ok(json!({
        "status": "ok",
        "effectedDocuments": effected.load(Ordering::Relaxed)
    }))
}

// ============================================================================
// REMOVE
// ============================================================================

/// Remove matching documents: `{ collection, query }`. Rows tombstone on
/// the background save that follows.
pub fn remove(db: &Arc<Database>, request: &Value) -> Value {
    respond(remove_inner(db, request), "removing")
}

fn remove_inner(db: &Arc<Database>, request: &Value) -> Result<Value> {
    for key in ["query", "collection"] {
        if request.get(key).is_none() {
            return Err(KnnDbError::MissingKeys(
                "query/collection is not send".to_string(),
            ));
        }
    }
    let collection_name = request["collection"].as_str().ok_or_else(|| {
        KnnDbError::WrongType("collection has to be a string".to_string())
    })?;

    let Some(collection) = db.collection(collection_name) else {
        return Ok(json!({ "status": "ok", "effectedDocuments": 0 }));
    };

    let mut executor = QueryExecutor::new(Arc::clone(&collection));
    executor.run(&request["query"])?;
    let doc_ids: Vec<u64> = executor.export().into_iter().map(|(id, _)| id).collect();

    let mut effected = 0usize;
    for segment in collection.segments() {
        for id in &doc_ids {
            if segment.remove(*id) {
                effected += 1;
            }
        }
    }

    schedule_save(db);
    Ok(json!({ "status": "ok", "effectedDocuments": effected }))
}

// ============================================================================
// CURSOR RETRIEVAL
// ============================================================================

/// Pull the next batch from a registered cursor:
/// `{ cursor_uuid, all? }` -> `{count, items, finished}`.
///
/// A truthy `all` (string spellings included) drains everything in one
/// batch. A finished cursor destroys itself.
pub fn fetch_cursor(request: &Value) -> Value {
    respond(fetch_cursor_inner(request), "retrieving batch")
}

fn fetch_cursor_inner(request: &Value) -> Result<Value> {
    let uuid = request
        .get("cursor_uuid")
        .and_then(Value::as_str)
        .ok_or_else(|| KnnDbError::MissingKeys("cursor_uuid is missing".to_string()))?;

    let cursor = get_cursor(uuid)
        .ok_or_else(|| KnnDbError::CursorNotFound(uuid.to_string()))?;

    if request.get("all").map(truthy_param).unwrap_or(false) {
        cursor.set_all();
    }

    let (items, finished) = cursor.retrieve_batch();
    if finished {
        kill_cursor(uuid);
    }

    Ok(json!({
        "status": "ok",
        "count": items.len(),
        "items": items,
        "finished": finished
    }))
}

// ============================================================================
// INDEX DEFINITION
// ============================================================================

/// Define indexes on live collections:
/// `{ "<indexName>": {collection, definition: {type, ...}}, ... }`.
///
/// Existing names are left untouched. Affected collections rebuild in the
/// background.
pub fn define_indexes(db: &Arc<Database>, body: &Value) -> Value {
    respond(define_indexes_inner(db, body), "defining indexes")
}

fn define_indexes_inner(db: &Arc<Database>, body: &Value) -> Result<Value> {
    let entries = body
        .as_object()
        .ok_or_else(|| KnnDbError::WrongType("index body has to be an object".to_string()))?;

    let mut rebuild: Vec<Arc<Collection>> = Vec::new();

    for (index_name, spec) in entries {
        let collection_name = spec
            .get("collection")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                KnnDbError::MissingKeys("index definition needs 'collection'".to_string())
            })?;
        let collection = db
            .collection(collection_name)
            .ok_or_else(|| KnnDbError::CollectionNotFound(collection_name.to_string()))?;

        let Some(definition) = spec.get("definition").filter(|d| d.is_object()) else {
            continue;
        };
        let mut definition = definition.clone();
        definition["name"] = json!(index_name);

        let index = crate::index::Index::from_metadata(&definition)?;
        if collection.add_index(index) {
            rebuild.push(collection);
        }
    }

    for collection in rebuild {
        std::thread::spawn(move || collection.build_indexes());
    }

    Ok(json!({ "status": "ok" }))
}

fn schedule_save(db: &Arc<Database>) {
    let db = Arc::clone(db);
    std::thread::spawn(move || db.save());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::TempDir;

    fn open_db(dir: &TempDir) -> Arc<Database> {
        Database::load(Config::with_data_path(dir.path())).unwrap()
    }

    #[test]
    fn test_create_returns_new_ids() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);

        let response = create(
            &db,
            &json!({"books": [{"id": 1, "title": "A"}, {"title": "B"}]}),
        );

        assert_eq!(response["status"], "ok");
        let ids = response["newIds"].as_array().unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], 1);
        assert!(db.collection("books").is_some());
    }

    #[test]
    fn test_create_rejects_non_object_documents() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);

        let response = create(&db, &json!({"books": [42]}));
        assert_eq!(response["status"], "failed");
        assert!(response["error"]["WrongType"].is_string());
    }

    #[test]
    fn test_select_missing_keys() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);

        let response = select(&db, &json!({"collection": "books"}));
        assert_eq!(response["status"], "failed");
        assert!(response["error"]["MissingKeys"].is_string());
    }

    #[test]
    fn test_select_unknown_collection_is_empty_ok() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);

        let response = select(&db, &json!({"collection": "ghost", "query": {}}));
        assert_eq!(response["status"], "ok");
        assert_eq!(response["count"], 0);
    }

    #[test]
    fn test_update_missing_keys() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);

        let response = update(&db, &json!({"collection": "books", "query": {}}));
        assert_eq!(response["status"], "failed");
        assert!(response["error"]["MissingKeys"].is_string());
    }

    #[test]
    fn test_update_rejects_unknown_operator() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        create(&db, &json!({"books": [{"id": 1}]}));

        let response = update(
            &db,
            &json!({
                "collection": "books",
                "query": {},
                "update": {"#pop": {"key": "x"}}
            }),
        );
        assert_eq!(response["status"], "failed");
        assert!(response["error"]["OperatorError"].is_string());
    }

    #[test]
    fn test_fetch_cursor_unknown_uuid() {
        let response = fetch_cursor(&json!({"cursor_uuid": "nope"}));
        assert_eq!(response["status"], "failed");
        assert!(response["error"]["CannotFind"].is_string());
    }

    #[test]
    fn test_define_indexes_requires_collection() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);

        let response = define_indexes(
            &db,
            &json!({"by_title": {"collection": "ghost", "definition": {"type": 0, "keyName": "t"}}}),
        );
        assert_eq!(response["status"], "failed");
    }
}
