// knndb-core/src/index.rs
// The index catalog: key-value, composite, range and ANN vector indexes

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use chrono::Utc;
use hnsw_rs::prelude::*;
use parking_lot::{Condvar, Mutex};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::document::doc_id;
use crate::error::{KnnDbError, Result};

/// HNSW graph parameters. The graph library manages growth internally, so
/// the element budget only scales layer probabilities.
const HNSW_MAX_CONNECTIONS: usize = 16;
const HNSW_ELEMENT_BUDGET: usize = 100_000;
const HNSW_LAYERS: usize = 16;
const HNSW_EF_CONSTRUCTION: usize = 200;

/// Index variants, with their stable on-disk type integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IndexType {
    KeyValue = 0,
    MultiKeyValue = 1,
    Knn = 2,
    Range = 3,
}

impl IndexType {
    pub fn as_int(&self) -> u64 {
        *self as u64
    }

    pub fn from_int(value: u64) -> Option<IndexType> {
        match value {
            0 => Some(IndexType::KeyValue),
            1 => Some(IndexType::MultiKeyValue),
            2 => Some(IndexType::Knn),
            3 => Some(IndexType::Range),
            _ => None,
        }
    }
}

/// Build gate: probes wait here while a rebuild populates the index.
/// Replaces the original busy-wait on an atomic flag with a condvar.
struct BuildGate {
    building: Mutex<bool>,
    ready: Condvar,
}

impl BuildGate {
    fn new() -> Self {
        BuildGate {
            building: Mutex::new(false),
            ready: Condvar::new(),
        }
    }

    fn begin(&self) {
        *self.building.lock() = true;
    }

    fn end(&self) {
        *self.building.lock() = false;
        self.ready.notify_all();
    }

    fn wait_ready(&self) {
        let mut building = self.building.lock();
        while *building {
            self.ready.wait(&mut building);
        }
    }
}

fn sha256_hex(input: &str) -> String {
    format!("{:x}", Sha256::digest(input.as_bytes()))
}

// ============================================================================
// KEY-VALUE INDEX
// ============================================================================

/// Maps one field's value to the ids carrying it.
///
/// The map key is the *serialized JSON* form of the value, so `42` and
/// `"42"` are distinct keys - client-visible behavior. A hashed index keys
/// by the SHA-256 of that serialization instead, trading inspectability for
/// fixed-length keys on large values.
pub struct KeyValueIndex {
    key_name: String,
    hashed: bool,
    data: Mutex<BTreeMap<String, Vec<u64>>>,
}

impl KeyValueIndex {
    pub fn new(key_name: String, hashed: bool) -> Self {
        KeyValueIndex {
            key_name,
            hashed,
            data: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn key_name(&self) -> &str {
        &self.key_name
    }

    pub fn is_hashed(&self) -> bool {
        self.hashed
    }

    fn reset(&self) {
        self.data.lock().clear();
    }

    fn add_item(&self, document: &Value) {
        let Some(value) = document.get(&self.key_name) else {
            return;
        };
        let Some(id) = doc_id(document) else {
            return;
        };

        let serialized = value.to_string();
        let key = if self.hashed {
            sha256_hex(&serialized)
        } else {
            serialized
        };
        self.data.lock().entry(key).or_default().push(id);
    }

    /// Probe with already-serialized JSON values; one id list per value.
    pub fn lookup(&self, values: &[String]) -> Vec<Vec<u64>> {
        let data = self.data.lock();
        values
            .iter()
            .map(|raw| {
                let key = if self.hashed {
                    sha256_hex(raw)
                } else {
                    // Normalize formatting through a parse where possible so
                    // the probe matches how values were serialized on add.
                    match serde_json::from_str::<Value>(raw) {
                        Ok(v) => v.to_string(),
                        Err(_) => raw.clone(),
                    }
                };
                data.get(&key).cloned().unwrap_or_default()
            })
            .collect()
    }
}

// ============================================================================
// COMPOSITE KEY-VALUE INDEX
// ============================================================================

/// An ordered list of key-value sub-indexes, intersection-scored at probe
/// time: only ids hitting on every queried key survive.
pub struct MultiKeyValueIndex {
    key_names: Vec<String>,
    full_hashed: bool,
    hashed: Vec<bool>,
    subs: Vec<KeyValueIndex>,
}

impl MultiKeyValueIndex {
    pub fn new(key_names: Vec<String>, full_hashed: bool, hashed: Vec<bool>) -> Self {
        let subs = key_names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let sub_hashed =
                    full_hashed || (hashed.len() == key_names.len() && hashed[i]);
                KeyValueIndex::new(name.clone(), sub_hashed)
            })
            .collect();

        MultiKeyValueIndex {
            key_names,
            full_hashed,
            hashed,
            subs,
        }
    }

    fn reset(&self) {
        for sub in &self.subs {
            sub.reset();
        }
    }

    fn add_item(&self, document: &Value) {
        for sub in &self.subs {
            sub.add_item(document);
        }
    }

    /// Probe with `key -> serialized values`. Ids must hit every queried
    /// key to be returned; the result is sorted and deduplicated.
    pub fn lookup(&self, query: &HashMap<String, Vec<String>>) -> Vec<u64> {
        if query.is_empty() {
            return Vec::new();
        }

        let mut hit_counts: BTreeMap<u64, usize> = BTreeMap::new();
        let mut required = 0usize;

        for sub in &self.subs {
            if let Some(values) = query.get(sub.key_name()) {
                required += 1;
                for id_list in sub.lookup(values) {
                    for id in id_list {
                        *hit_counts.entry(id).or_default() += 1;
                    }
                }
            }
        }

        if required == 0 {
            return Vec::new();
        }

        hit_counts
            .into_iter()
            .filter(|(_, count)| *count == required)
            .map(|(id, _)| id)
            .collect()
    }
}

// ============================================================================
// RANGE INDEX
// ============================================================================

/// f64 wrapper with total ordering so it can key a BTreeMap. NaN sorts
/// greatest; equal bit patterns are equal.
#[derive(Debug, Clone, Copy)]
pub struct OrderedFloat(pub f64);

impl PartialEq for OrderedFloat {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for OrderedFloat {}

impl PartialOrd for OrderedFloat {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedFloat {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match (self.0.is_nan(), other.0.is_nan()) {
            (true, true) => std::cmp::Ordering::Equal,
            (true, false) => std::cmp::Ordering::Greater,
            (false, true) => std::cmp::Ordering::Less,
            (false, false) => self
                .0
                .partial_cmp(&other.0)
                .unwrap_or(std::cmp::Ordering::Equal),
        }
    }
}

/// Ordered multimap from a numeric (or numeric-string) field to ids.
pub struct RangeIndex {
    key_name: String,
    data: Mutex<BTreeMap<OrderedFloat, Vec<u64>>>,
}

impl RangeIndex {
    pub fn new(key_name: String) -> Self {
        RangeIndex {
            key_name,
            data: Mutex::new(BTreeMap::new()),
        }
    }

    fn reset(&self) {
        self.data.lock().clear();
    }

    fn add_item(&self, document: &Value) {
        let Some(value) = document.get(&self.key_name) else {
            return;
        };
        let Some(id) = doc_id(document) else {
            return;
        };

        // Numbers directly; numeric strings parsed; everything else dropped.
        let numeric = match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        if let Some(key) = numeric {
            self.data
                .lock()
                .entry(OrderedFloat(key))
                .or_default()
                .push(id);
        }
    }

    /// All ids with key in `[lower, higher]`, both bounds inclusive.
    pub fn lookup(&self, lower: f64, higher: f64) -> Vec<u64> {
        if lower > higher {
            return Vec::new();
        }
        let data = self.data.lock();
        let mut results = Vec::new();
        for (_, ids) in data.range(OrderedFloat(lower)..=OrderedFloat(higher)) {
            results.extend_from_slice(ids);
        }
        results
    }
}

// ============================================================================
// KNN (ANN VECTOR) INDEX
// ============================================================================

/// Approximate nearest-neighbor index over one array-of-floats field, L2
/// distance, fixed dimension. Vectors shorter than the dimension are
/// zero-padded, longer ones truncated.
pub struct KnnIndex {
    key_name: String,
    space: usize,
    element_count: AtomicUsize,
    graph: Mutex<Hnsw<'static, f32, DistL2>>,
}

impl KnnIndex {
    pub fn new(key_name: String, space: usize) -> Self {
        KnnIndex {
            key_name,
            space,
            element_count: AtomicUsize::new(0),
            graph: Mutex::new(Self::new_graph()),
        }
    }

    fn new_graph() -> Hnsw<'static, f32, DistL2> {
        Hnsw::new(
            HNSW_MAX_CONNECTIONS,
            HNSW_ELEMENT_BUDGET,
            HNSW_LAYERS,
            HNSW_EF_CONSTRUCTION,
            DistL2 {},
        )
    }

    pub fn space(&self) -> usize {
        self.space
    }

    pub fn element_count(&self) -> usize {
        self.element_count.load(Ordering::Relaxed)
    }

    /// Pad or truncate to the index dimension, coercing numbers and
    /// numeric strings; anything unusable becomes 0.
    fn fit_vector(&self, elements: &[Value]) -> Vec<f32> {
        let mut data = vec![0.0f32; self.space];
        for (slot, value) in data.iter_mut().zip(elements.iter()) {
            *slot = match value {
                Value::Number(n) => n.as_f64().unwrap_or(0.0) as f32,
                Value::String(s) => s.trim().parse::<f32>().unwrap_or(0.0),
                _ => 0.0,
            };
        }
        data
    }

    fn reset(&self) {
        let mut graph = self.graph.lock();
        *graph = Self::new_graph();
        self.element_count.store(0, Ordering::Relaxed);
    }

    fn add_item(&self, document: &Value) {
        let Some(value) = document.get(&self.key_name) else {
            return;
        };
        let Some(elements) = value.as_array() else {
            return;
        };
        let Some(id) = doc_id(document) else {
            return;
        };

        let data = self.fit_vector(elements);
        {
            let graph = self.graph.lock();
            graph.insert((&data, id as usize));
        }
        self.element_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Top-k by L2 distance, ordered farthest-first (the order the scoring
    /// rule consumes). An index holding nothing returns nothing.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(f32, u64)> {
        if k == 0 || self.element_count() == 0 {
            return Vec::new();
        }

        let mut padded = vec![0.0f32; self.space];
        let take = query.len().min(self.space);
        padded[..take].copy_from_slice(&query[..take]);

        let graph = self.graph.lock();
        let mut neighbours: Vec<(f32, u64)> = graph
            .search(&padded, k, k.max(24))
            .into_iter()
            .map(|n| (n.distance, n.d_id as u64))
            .collect();
        drop(graph);

        neighbours.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        neighbours
    }
}

// ============================================================================
// INDEX FACADE
// ============================================================================

pub enum IndexKind {
    KeyValue(KeyValueIndex),
    MultiKeyValue(MultiKeyValueIndex),
    Knn(KnnIndex),
    Range(RangeIndex),
}

/// One catalog entry: a named index with its build lifecycle.
pub struct Index {
    name: String,
    created_at: AtomicU64,
    gate: BuildGate,
    kind: IndexKind,
}

impl Index {
    pub fn new(name: String, kind: IndexKind) -> Self {
        Index {
            name,
            created_at: AtomicU64::new(0),
            gate: BuildGate::new(),
            kind,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created_at(&self) -> u64 {
        self.created_at.load(Ordering::Relaxed)
    }

    pub fn index_type(&self) -> IndexType {
        match &self.kind {
            IndexKind::KeyValue(_) => IndexType::KeyValue,
            IndexKind::MultiKeyValue(_) => IndexType::MultiKeyValue,
            IndexKind::Knn(_) => IndexType::Knn,
            IndexKind::Range(_) => IndexType::Range,
        }
    }

    /// Mark this index as under construction; probes block until the
    /// matching `end_build`.
    pub fn begin_build(&self) {
        self.gate.begin();
    }

    pub fn end_build(&self) {
        self.gate.end();
    }

    /// Block until any in-flight build completes.
    pub fn wait_ready(&self) {
        self.gate.wait_ready();
    }

    /// Clear internal state ahead of repopulation.
    pub fn reset(&self) {
        match &self.kind {
            IndexKind::KeyValue(idx) => idx.reset(),
            IndexKind::MultiKeyValue(idx) => idx.reset(),
            IndexKind::Knn(idx) => idx.reset(),
            IndexKind::Range(idx) => idx.reset(),
        }
    }

    /// Offer a document. Absent or ill-typed fields are skipped silently.
    pub fn add_item(&self, document: &Value) {
        match &self.kind {
            IndexKind::KeyValue(idx) => idx.add_item(document),
            IndexKind::MultiKeyValue(idx) => idx.add_item(document),
            IndexKind::Knn(idx) => idx.add_item(document),
            IndexKind::Range(idx) => idx.add_item(document),
        }
    }

    /// Stamp the build completion time.
    pub fn finish(&self) {
        self.created_at
            .store(Utc::now().timestamp() as u64, Ordering::Relaxed);
    }

    /// Every document field this index covers.
    pub fn included_keys(&self) -> HashSet<String> {
        match &self.kind {
            IndexKind::KeyValue(idx) => [idx.key_name.clone()].into_iter().collect(),
            IndexKind::MultiKeyValue(idx) => idx.key_names.iter().cloned().collect(),
            IndexKind::Knn(idx) => [idx.key_name.clone()].into_iter().collect(),
            IndexKind::Range(idx) => [idx.key_name.clone()].into_iter().collect(),
        }
    }

    pub fn as_key_value(&self) -> Option<&KeyValueIndex> {
        match &self.kind {
            IndexKind::KeyValue(idx) => Some(idx),
            _ => None,
        }
    }

    pub fn as_multi_key_value(&self) -> Option<&MultiKeyValueIndex> {
        match &self.kind {
            IndexKind::MultiKeyValue(idx) => Some(idx),
            _ => None,
        }
    }

    pub fn as_knn(&self) -> Option<&KnnIndex> {
        match &self.kind {
            IndexKind::Knn(idx) => Some(idx),
            _ => None,
        }
    }

    pub fn as_range(&self) -> Option<&RangeIndex> {
        match &self.kind {
            IndexKind::Range(idx) => Some(idx),
            _ => None,
        }
    }

    /// Render the persistable metadata, exactly the on-disk schema.
    pub fn save_metadata(&self) -> Value {
        match &self.kind {
            IndexKind::KeyValue(idx) => json!({
                "name": self.name,
                "type": IndexType::KeyValue.as_int(),
                "keyName": idx.key_name,
                "isHashedIndex": idx.hashed,
            }),
            IndexKind::MultiKeyValue(idx) => json!({
                "name": self.name,
                "type": IndexType::MultiKeyValue.as_int(),
                "keyNames": idx.key_names,
                "isFullHashedIndex": idx.full_hashed,
                "isHashedIndex": idx.hashed,
            }),
            IndexKind::Knn(idx) => json!({
                "name": self.name,
                "type": IndexType::Knn.as_int(),
                "keyName": idx.key_name,
                "space": idx.space,
            }),
            IndexKind::Range(idx) => json!({
                "name": self.name,
                "type": IndexType::Range.as_int(),
                "keyName": idx.key_name,
            }),
        }
    }

    /// Reconstruct an index from its metadata object.
    pub fn from_metadata(metadata: &Value) -> Result<Index> {
        let name = metadata
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| KnnDbError::MissingKeys("index metadata needs 'name'".into()))?
            .to_string();
        let type_int = metadata
            .get("type")
            .and_then(Value::as_u64)
            .ok_or_else(|| KnnDbError::MissingKeys("index metadata needs 'type'".into()))?;
        let index_type = IndexType::from_int(type_int).ok_or_else(|| {
            KnnDbError::WrongType(format!("unknown index type: {}", type_int))
        })?;

        let key_name = |meta: &Value| -> Result<String> {
            meta.get("keyName")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| KnnDbError::MissingKeys("index metadata needs 'keyName'".into()))
        };

        let kind = match index_type {
            IndexType::KeyValue => {
                let hashed = metadata
                    .get("isHashedIndex")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                IndexKind::KeyValue(KeyValueIndex::new(key_name(metadata)?, hashed))
            }
            IndexType::MultiKeyValue => {
                let key_names: Vec<String> = metadata
                    .get("keyNames")
                    .and_then(Value::as_array)
                    .map(|names| {
                        names
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .ok_or_else(|| {
                        KnnDbError::MissingKeys("index metadata needs 'keyNames'".into())
                    })?;
                let full_hashed = metadata
                    .get("isFullHashedIndex")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let hashed: Vec<bool> = metadata
                    .get("isHashedIndex")
                    .and_then(Value::as_array)
                    .map(|flags| flags.iter().filter_map(Value::as_bool).collect())
                    .unwrap_or_default();
                IndexKind::MultiKeyValue(MultiKeyValueIndex::new(
                    key_names,
                    full_hashed,
                    hashed,
                ))
            }
            IndexType::Knn => {
                let space = metadata
                    .get("space")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| {
                        KnnDbError::MissingKeys("index metadata needs 'space'".into())
                    })? as usize;
                IndexKind::Knn(KnnIndex::new(key_name(metadata)?, space))
            }
            IndexType::Range => IndexKind::Range(RangeIndex::new(key_name(metadata)?)),
        };

        Ok(Index::new(name, kind))
    }
}
