// knndb-core/src/query.rs
// Query executor: translate a query document into index probes and
// accumulate per-document scores

use std::collections::HashMap;
use std::sync::Arc;

use ahash::AHashMap;
use serde_json::Value;

use crate::collection::Collection;
use crate::error::{KnnDbError, Result};
use crate::index::{Index, IndexType};

/// Result cap when the query names none.
pub const DEFAULT_LIMIT: usize = 1000;

/// Every equality and range clause is worth this much; a document must
/// collect the full amount per clause to survive result assembly.
const CLAUSE_SCORE: f32 = 1000.0;

/// Upper bound on what a KNN probe may contribute, keeping vector
/// similarity ordered but never decisive against equality clauses.
const KNN_SCORE_CEILING: f32 = 850.0;

/// One query run against one collection: probes in, ranked ids out.
pub struct QueryExecutor {
    collection: Arc<Collection>,
    limit: usize,
    max_score: f32,
    scores: AHashMap<u64, f32>,
}

impl QueryExecutor {
    pub fn new(collection: Arc<Collection>) -> Self {
        QueryExecutor {
            collection,
            limit: DEFAULT_LIMIT,
            max_score: 0.0,
            scores: AHashMap::new(),
        }
    }

    fn add_results(&mut self, ids: &[u64], factor: f32) {
        for id in ids {
            *self.scores.entry(*id).or_insert(0.0) += factor;
        }
    }

    /// Run every clause of the query document.
    ///
    /// Top-level keys starting with `#` are operators (`#limit`,
    /// `#similar`, `#range`; anything else is an error); all other keys are
    /// equality probes against every index covering that field. A query
    /// with no non-trivial clause selects everything.
    pub fn run(&mut self, query: &Value) -> Result<()> {
        let clauses = query
            .as_object()
            .ok_or_else(|| KnnDbError::WrongType("query has to be an object".to_string()))?;

        let indexed = self.collection.indexed_keys();
        let mut all_selected = true;

        for (name, value) in clauses {
            if name.starts_with('#') {
                match name.as_str() {
                    "#limit" => {
                        if let Some(limit) = value.as_u64() {
                            if limit > 0 {
                                self.limit = limit as usize;
                            }
                        }
                        // #limit alone does not make the query selective.
                    }
                    "#similar" => {
                        self.similar_operator(value, &indexed)?;
                        all_selected = false;
                    }
                    "#range" => {
                        self.range_operator(value, &indexed)?;
                        all_selected = false;
                    }
                    other => {
                        return Err(KnnDbError::OperatorError(format!(
                            "given operator does not exist: {}",
                            other
                        )))
                    }
                }
            } else {
                self.max_score += CLAUSE_SCORE;
                all_selected = false;
                self.equality_probe(name, value, &indexed);
            }
        }

        if all_selected {
            let ids = self.collection.all_ids();
            self.add_results(&ids, CLAUSE_SCORE);
        }
        Ok(())
    }

    fn equality_probe(
        &mut self,
        query_name: &str,
        query_value: &Value,
        indexed: &[(String, IndexType, Arc<Index>)],
    ) {
        let serialized = query_value.to_string();

        for (key_name, index_type, index) in indexed {
            if key_name != query_name {
                continue;
            }
            match index_type {
                IndexType::KeyValue => {
                    let Some(kv) = index.as_key_value() else {
                        continue;
                    };
                    index.wait_ready();
                    if let Some(hits) = kv.lookup(&[serialized.clone()]).into_iter().next() {
                        self.add_results(&hits, CLAUSE_SCORE);
                    }
                }
                IndexType::MultiKeyValue => {
                    let Some(multi) = index.as_multi_key_value() else {
                        continue;
                    };
                    index.wait_ready();
                    let mut probe = HashMap::new();
                    probe.insert(query_name.to_string(), vec![serialized.clone()]);
                    let hits = multi.lookup(&probe);
                    self.add_results(&hits, CLAUSE_SCORE);
                }
                // KNN and range indexes only answer their operators.
                IndexType::Knn | IndexType::Range => {}
            }
        }
    }

    /// `#similar {fieldName, value, k?}` - ANN probe. Contributions are
    /// scaled so the whole result set spans at most the KNN ceiling:
    ///
    ///   score += (maxDistance - distance) / (maxDistance / 850)
    ///
    /// with maxDistance = farthest returned distance + 1. The probe never
    /// raises `max_score`, so it orders results without gating them.
    fn similar_operator(
        &mut self,
        spec: &Value,
        indexed: &[(String, IndexType, Arc<Index>)],
    ) -> Result<()> {
        let field_name = spec.get("fieldName").ok_or_else(|| {
            KnnDbError::MissingKeys("fieldName or value is missing".to_string())
        })?;
        let value = spec.get("value").ok_or_else(|| {
            KnnDbError::MissingKeys("fieldName or value is missing".to_string())
        })?;

        let field_name = field_name.as_str().ok_or_else(|| {
            KnnDbError::WrongType("fieldName has to be a string".to_string())
        })?;
        let elements = value.as_array().ok_or_else(|| {
            KnnDbError::WrongType("value has to be a vector/array of floats".to_string())
        })?;
        if elements.is_empty() {
            return Err(KnnDbError::ZeroItems("value vector's length is 0".to_string()));
        }

        let mut query_vector = Vec::with_capacity(elements.len());
        for element in elements {
            let number = element.as_f64().ok_or_else(|| {
                KnnDbError::WrongType("value has to be a vector/array of floats".to_string())
            })?;
            query_vector.push(number as f32);
        }

        let k = match spec.get("k").and_then(Value::as_u64) {
            Some(k) => k as usize,
            None => self.collection.count_documents(),
        };

        let mut found: Option<Arc<Index>> = None;
        for (key, index_type, index) in indexed {
            if *index_type == IndexType::Knn && key == field_name {
                found = Some(Arc::clone(index));
                break;
            }
        }
        let Some(index) = found else {
            return Err(KnnDbError::IndexMissing(format!(
                "no knn index contains the given fieldName: {}",
                field_name
            )));
        };
        index.wait_ready();
        let Some(knn) = index.as_knn() else {
            return Err(KnnDbError::IndexMissing(format!(
                "no knn index contains the given fieldName: {}",
                field_name
            )));
        };

        let results = knn.search(&query_vector, k);
        if let Some(&(farthest, _)) = results.first() {
            let max_distance = farthest + 1.0;
            let denominator = max_distance / KNN_SCORE_CEILING;
            for (distance, id) in results {
                *self.scores.entry(id).or_insert(0.0) +=
                    (max_distance - distance) / denominator;
            }
        }
        Ok(())
    }

    /// `#range {fieldName, lower, higher}` - inclusive range probe, scored
    /// like an equality clause.
    fn range_operator(
        &mut self,
        spec: &Value,
        indexed: &[(String, IndexType, Arc<Index>)],
    ) -> Result<()> {
        for key in ["fieldName", "lower", "higher"] {
            if spec.get(key).is_none() {
                return Err(KnnDbError::MissingKeys(
                    "fieldName/lower/higher is missing".to_string(),
                ));
            }
        }

        let field_name = spec["fieldName"].as_str().ok_or_else(|| {
            KnnDbError::WrongType("fieldName has to be a string".to_string())
        })?;
        let lower = spec["lower"].as_f64().ok_or_else(|| {
            KnnDbError::WrongType("lower and higher should be floating points".to_string())
        })?;
        let higher = spec["higher"].as_f64().ok_or_else(|| {
            KnnDbError::WrongType("lower and higher should be floating points".to_string())
        })?;

        let mut found: Option<Arc<Index>> = None;
        for (key, index_type, index) in indexed {
            if *index_type == IndexType::Range && key == field_name {
                found = Some(Arc::clone(index));
                break;
            }
        }
        let Some(index) = found else {
            return Err(KnnDbError::IndexMissing(format!(
                "no range index contains the given fieldName: {}",
                field_name
            )));
        };

        index.wait_ready();
        if let Some(range) = index.as_range() {
            let hits = range.lookup(lower, higher);
            self.add_results(&hits, CLAUSE_SCORE);
        }
        self.max_score += CLAUSE_SCORE;
        Ok(())
    }

    /// Assemble the ranked result: keep ids that hit every gating clause,
    /// sort by score descending, cut to the limit, normalize.
    pub fn export(&mut self) -> Vec<(u64, f32)> {
        let mut results: Vec<(u64, f32)> = self
            .scores
            .iter()
            .filter(|(_, score)| **score >= self.max_score)
            .map(|(id, score)| (*id, *score))
            .collect();

        results.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(self.limit);

        let normalizer = self.max_score.max(1.0);
        for entry in &mut results {
            entry.1 /= normalizer;
        }
        results
    }
}
