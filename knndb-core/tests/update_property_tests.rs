// Property tests for the update language and projection.

use std::collections::HashMap;

use knndb_core::document::reduce;
use knndb_core::update::perform_update;
use proptest::prelude::*;
use serde_json::json;

proptest! {
    // Overwriting a field always leaves exactly the new value behind.
    #[test]
    fn prop_overwrite_wins(old in any::<i64>(), new in any::<i64>()) {
        let doc = json!({"id": 1, "n": old});
        let updated = perform_update(&doc, &json!({"n": new}));
        prop_assert_eq!(&updated["n"], &json!(new));
        prop_assert_eq!(&updated["id"], &json!(1));
    }

    // #inc is addition over the numeric previous value.
    #[test]
    fn prop_inc_adds(base in -1e9f64..1e9f64, delta in -1e9f64..1e9f64) {
        let doc = json!({"id": 1, "n": base});
        let updated = perform_update(&doc, &json!({"#inc": {"key": "n", "value": delta}}));
        let result = updated["n"].as_f64().unwrap();
        prop_assert!((result - (base + delta)).abs() < 1e-6 * (1.0 + base.abs() + delta.abs()));
    }

    // #inc over a missing or non-numeric field starts from zero.
    #[test]
    fn prop_inc_missing_starts_at_zero(delta in -1e9f64..1e9f64) {
        let doc = json!({"id": 1, "n": "not numeric"});
        let updated = perform_update(&doc, &json!({"#inc": {"key": "n", "value": delta}}));
        let result = updated["n"].as_f64().unwrap();
        prop_assert!((result - delta).abs() < 1e-6 * (1.0 + delta.abs()));
    }

    // Untouched fields survive any update document.
    #[test]
    fn prop_untouched_fields_survive(value in any::<i64>(), other in any::<i64>()) {
        let doc = json!({"id": 1, "keep": other, "n": 0});
        let updated = perform_update(&doc, &json!({"n": value}));
        prop_assert_eq!(&updated["keep"], &json!(other));
    }

    // A projected document is always a subset of the original plus id.
    #[test]
    fn prop_projection_is_subset(
        keep_title in any::<bool>(),
        keep_body in any::<bool>(),
    ) {
        let doc = json!({"id": 1, "title": "A", "body": "B"});
        let mut projection = HashMap::new();
        projection.insert("title".to_string(), keep_title);
        projection.insert("body".to_string(), keep_body);

        let reduced = reduce(&doc, &projection);
        let fields = reduced.as_object().unwrap();

        prop_assert_eq!(&reduced["id"], &json!(1));
        prop_assert_eq!(fields.contains_key("title"), keep_title);
        prop_assert_eq!(fields.contains_key("body"), keep_body);
        for (key, value) in fields {
            prop_assert_eq!(&doc[key], value);
        }
    }
}
