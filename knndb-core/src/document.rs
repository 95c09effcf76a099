// knndb-core/src/document.rs
// Document helpers: ids, TTL, projection

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::error::{KnnDbError, Result};

/// Field carrying the document id. Every persisted document has one.
pub const ID_FIELD: &str = "id";

/// Optional field carrying the expiry instant in epoch seconds.
pub const TTL_FIELD: &str = "&ttl";

/// Extract the numeric document id, if present.
pub fn doc_id(doc: &Value) -> Option<u64> {
    doc.get(ID_FIELD).and_then(Value::as_u64)
}

/// Extract the TTL instant (epoch seconds), if present.
pub fn doc_ttl(doc: &Value) -> Option<i64> {
    doc.get(TTL_FIELD).and_then(Value::as_i64)
}

/// Parse a `projection` request value into `field -> keep?`.
///
/// Booleans pass through; numbers over 0 are true, 0 and negatives false.
pub fn parse_projection(value: &Value) -> Result<HashMap<String, bool>> {
    let obj = value.as_object().ok_or_else(|| {
        KnnDbError::WrongType("projection has to be an object".to_string())
    })?;

    let mut projection = HashMap::with_capacity(obj.len());
    for (name, item) in obj {
        let keep = match item {
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_f64().map(|v| v > 0.0).unwrap_or(false),
            _ => {
                return Err(KnnDbError::WrongType(format!(
                    "projection item '{}' should be a boolean",
                    name
                )))
            }
        };
        projection.insert(name.clone(), keep);
    }
    Ok(projection)
}

/// Reduce a document to a projection.
///
/// An empty projection returns the document unchanged. Otherwise the result
/// always keeps `id`, plus every projected-true field that exists.
pub fn reduce(doc: &Value, projection: &HashMap<String, bool>) -> Value {
    if projection.is_empty() {
        return doc.clone();
    }

    let Some(fields) = doc.as_object() else {
        return doc.clone();
    };

    let mut reduced = Map::new();
    if let Some(id) = fields.get(ID_FIELD) {
        reduced.insert(ID_FIELD.to_string(), id.clone());
    }
    for (name, keep) in projection {
        if !keep {
            continue;
        }
        if let Some(value) = fields.get(name) {
            reduced.insert(name.clone(), value.clone());
        }
    }
    Value::Object(reduced)
}
