// knndb-core/src/update.rs
// The update language: field replacement plus #-operators

use serde_json::{json, Value};

use crate::error::{KnnDbError, Result};

/// Validate an update document before it is buffered anywhere.
///
/// Unknown `#` operators are rejected here; `perform_update` runs inside
/// segment rewrites where failing would poison an unrelated flush, so by
/// the time an update reaches a segment it must be known-valid.
pub fn validate_update(update: &Value) -> Result<()> {
    let obj = update.as_object().ok_or_else(|| {
        KnnDbError::WrongType("update has to be an object".to_string())
    })?;

    for (key, value) in obj {
        if !key.starts_with('#') {
            continue;
        }
        match key.as_str() {
            "#inc" => {
                let spec = value.as_object().ok_or_else(|| {
                    KnnDbError::WrongType("#inc has to be an object".to_string())
                })?;
                if !spec.contains_key("key") || !spec.contains_key("value") {
                    return Err(KnnDbError::MissingKeys(
                        "#inc needs 'key' and 'value'".to_string(),
                    ));
                }
                if !spec["key"].is_string() {
                    return Err(KnnDbError::WrongType(
                        "#inc key has to be a string".to_string(),
                    ));
                }
                if !spec["value"].is_number() {
                    return Err(KnnDbError::WrongType(
                        "#inc value has to be a number".to_string(),
                    ));
                }
            }
            other => {
                return Err(KnnDbError::OperatorError(format!(
                    "given update operator does not exist: {}",
                    other
                )))
            }
        }
    }
    Ok(())
}

/// Apply an update document to `old`, producing the new document.
///
/// Non-`#` keys overwrite the field. `#inc {key, value}` adds to the
/// previous numeric value (0 when absent or non-numeric). Operators the
/// validator does not know are skipped.
pub fn perform_update(old: &Value, update: &Value) -> Value {
    let mut output = old.clone();

    let Some(entries) = update.as_object() else {
        return output;
    };

    for (key, value) in entries {
        if let Some(op) = key.strip_prefix('#') {
            if op == "inc" {
                apply_increase(&mut output, value);
            }
        } else if let Some(target) = output.as_object_mut() {
            target.insert(key.clone(), value.clone());
        }
    }
    output
}

fn apply_increase(document: &mut Value, spec: &Value) {
    let Some(key) = spec.get("key").and_then(Value::as_str) else {
        return;
    };
    let Some(inc_value) = spec.get("value").and_then(Value::as_f64) else {
        return;
    };

    let prev = document
        .get(key)
        .and_then(Value::as_f64)
        .unwrap_or(0.0);

    if let Some(target) = document.as_object_mut() {
        target.insert(key.to_string(), json!(prev + inc_value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_field_overwrite() {
        let old = json!({"id": 1, "name": "Alice", "age": 30});
        let update = json!({"name": "Bob"});

        let new = perform_update(&old, &update);
        assert_eq!(new, json!({"id": 1, "name": "Bob", "age": 30}));
    }

    #[test]
    fn test_overwrite_adds_missing_field() {
        let old = json!({"id": 1});
        let new = perform_update(&old, &json!({"tag": "fresh"}));
        assert_eq!(new["tag"], "fresh");
    }

    #[test]
    fn test_inc_on_existing_number() {
        let old = json!({"id": 7, "count": 4});
        let update = json!({"#inc": {"key": "count", "value": 3}});

        let new = perform_update(&old, &update);
        assert_eq!(new["count"], json!(7.0));
    }

    #[test]
    fn test_inc_on_missing_field_starts_from_zero() {
        let old = json!({"id": 7});
        let update = json!({"#inc": {"key": "count", "value": 2.5}});

        let new = perform_update(&old, &update);
        assert_eq!(new["count"], json!(2.5));
    }

    #[test]
    fn test_inc_on_non_numeric_field_starts_from_zero() {
        let old = json!({"id": 7, "count": "many"});
        let update = json!({"#inc": {"key": "count", "value": 1}});

        let new = perform_update(&old, &update);
        assert_eq!(new["count"], json!(1.0));
    }

    #[test]
    fn test_validate_rejects_unknown_operator() {
        let err = validate_update(&json!({"#pop": {"key": "x"}})).unwrap_err();
        assert_eq!(err.kind(), "OperatorError");
    }

    #[test]
    fn test_validate_rejects_malformed_inc() {
        assert!(validate_update(&json!({"#inc": {"key": "x"}})).is_err());
        assert!(validate_update(&json!({"#inc": {"key": 3, "value": 1}})).is_err());
        assert!(validate_update(&json!({"#inc": {"key": "x", "value": "y"}})).is_err());
        assert!(validate_update(&json!({"#inc": 5})).is_err());
    }

    #[test]
    fn test_validate_accepts_plain_and_inc() {
        let update = json!({"name": "Eve", "#inc": {"key": "n", "value": 1}});
        assert!(validate_update(&update).is_ok());
    }

    #[test]
    fn test_mixed_update_applies_both() {
        let old = json!({"id": 1, "n": 10, "name": "a"});
        let update = json!({"name": "b", "#inc": {"key": "n", "value": -4}});

        let new = perform_update(&old, &update);
        assert_eq!(new["name"], "b");
        assert_eq!(new["n"], json!(6.0));
    }
}
