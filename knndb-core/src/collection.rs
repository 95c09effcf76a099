// knndb-core/src/collection.rs
// Collection: a set of storage segments plus an index catalog

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::document::{doc_id, doc_ttl, ID_FIELD};
use crate::error::Result;
use crate::index::{Index, IndexType};
use crate::storage::StorageSegment;
use crate::{log_debug, log_error, log_warn};

/// Fewer segments than this and inserts always open a fresh one, spreading
/// the collection across files early.
const MIN_SEGMENT_SPREAD: usize = 10;

/// The `collection.metadata` file contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionMetadata {
    pub name: String,
    pub indexes: Vec<Value>,
}

/// A named aggregate of storage segments and indexes.
///
/// Probes clone `Arc<Index>` handles out of the catalog under a short read
/// lock; a rebuild swaps new entries in and the displaced indexes are freed
/// when the last in-flight probe drops its handle.
pub struct Collection {
    pub name: String,
    dir: PathBuf,
    max_segment_elements: usize,
    segments: RwLock<Vec<Arc<StorageSegment>>>,
    indexes: RwLock<HashMap<String, Arc<Index>>>,
    /// Excludes overlapping metadata flushes for this collection.
    save_lock: Mutex<()>,
    /// Two-phase rebuild gate: `try_lock` on waiting coalesces bursts,
    /// working serializes execution.
    builder_waiting: Mutex<()>,
    builder_working: Mutex<()>,
}

impl Collection {
    pub fn new(name: String, dir: PathBuf, max_segment_elements: usize) -> Self {
        Collection {
            name,
            dir,
            max_segment_elements,
            segments: RwLock::new(Vec::new()),
            indexes: RwLock::new(HashMap::new()),
            save_lock: Mutex::new(()),
            builder_waiting: Mutex::new(()),
            builder_working: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    /// Snapshot of the segment list.
    pub fn segments(&self) -> Vec<Arc<StorageSegment>> {
        self.segments.read().clone()
    }

    pub fn add_segment(&self, segment: Arc<StorageSegment>) {
        self.segments.write().push(segment);
    }

    /// Snapshot of the index catalog.
    pub fn catalog(&self) -> HashMap<String, Arc<Index>> {
        self.indexes.read().clone()
    }

    /// Register an index under its name. Returns false when the name is
    /// already taken (the existing definition wins).
    pub fn add_index(&self, index: Index) -> bool {
        let mut catalog = self.indexes.write();
        if catalog.contains_key(index.name()) {
            return false;
        }
        catalog.insert(index.name().to_string(), Arc::new(index));
        true
    }

    /// Projection of the catalog by included field:
    /// `(field name, index type, index handle)` per covered key.
    pub fn indexed_keys(&self) -> Vec<(String, IndexType, Arc<Index>)> {
        let catalog = self.indexes.read();
        let mut list = Vec::new();
        for index in catalog.values() {
            let index_type = index.index_type();
            for key in index.included_keys() {
                list.push((key, index_type, Arc::clone(index)));
            }
        }
        list
    }

    pub fn count_documents(&self) -> usize {
        self.segments().iter().map(|s| s.count_documents()).sum()
    }

    pub fn all_ids(&self) -> Vec<u64> {
        let mut ids = Vec::new();
        for segment in self.segments() {
            segment.all_ids(&mut ids);
        }
        ids
    }

    /// True if any segment holds the id, persisted or pending.
    pub fn saved_anywhere(&self, id: u64) -> bool {
        self.segments().iter().any(|s| s.saved_here(id))
    }

    /// Buffer documents into one target segment, assigning fresh random ids
    /// to documents that carry none. Returns the ids in input order.
    ///
    /// Target choice: probe random segments up to the segment count; the
    /// first one under capacity wins. When all probes are full, or fewer
    /// than ten segments exist, a fresh randomly-named segment is opened.
    pub fn insert_documents(&self, documents: Vec<Value>) -> Result<Vec<u64>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let mut rng = rand::thread_rng();

        let snapshot = self.segments();
        let mut target: Option<Arc<StorageSegment>> = None;
        for _ in 0..snapshot.len() {
            let candidate = Arc::clone(&snapshot[rng.gen_range(0..snapshot.len())]);
            let under_cap = candidate.count_documents() < self.max_segment_elements;
            target = Some(candidate);
            if under_cap {
                break;
            }
        }

        let needs_fresh = match &target {
            None => true,
            Some(segment) => {
                segment.count_documents() >= self.max_segment_elements
                    || snapshot.len() < MIN_SEGMENT_SPREAD
            }
        };
        let target = if needs_fresh {
            let path = self
                .dir
                .join(format!("storage-{}.knndb", Uuid::new_v4().simple()));
            let fresh = Arc::new(StorageSegment::open(path)?);
            self.add_segment(Arc::clone(&fresh));
            fresh
        } else {
            target.expect("probed target exists when no fresh segment is needed")
        };

        let mut entered_ids = Vec::with_capacity(documents.len());
        for mut document in documents {
            let id = match doc_id(&document) {
                Some(id) => id,
                None => {
                    // Random ids; collisions are improbable on 64 bits but
                    // explicit ids make the cross-segment check mandatory.
                    let fresh_id = loop {
                        let candidate: u64 = rng.gen();
                        if !self.saved_anywhere(candidate) {
                            break candidate;
                        }
                    };
                    if let Some(fields) = document.as_object_mut() {
                        fields.insert(ID_FIELD.to_string(), json!(fresh_id));
                    }
                    fresh_id
                }
            };
            target.insert(document);
            entered_ids.push(id);
        }
        Ok(entered_ids)
    }

    /// Rebuild every index from the live documents, in the background
    /// semantics of the catalog: the old indexes keep serving probes while
    /// shadows are populated, then the shadows are swapped in atomically.
    ///
    /// A burst of rebuild triggers coalesces: one in flight, at most one
    /// queued, the rest dropped.
    pub fn build_indexes(&self) {
        let catalog = self.catalog();
        if catalog.is_empty() {
            return;
        }

        // Waiting stage: someone already queued means this request drops.
        let Some(wait_guard) = self.builder_waiting.try_lock() else {
            return;
        };
        // Working stage: serialize execution, then free the waiting slot.
        let _work_guard = self.builder_working.lock();
        drop(wait_guard);

        // Shadow catalog built from the same metadata.
        let mut shadow: HashMap<String, Arc<Index>> = HashMap::new();
        for (name, index) in &catalog {
            match Index::from_metadata(&index.save_metadata()) {
                Ok(fresh) => {
                    fresh.begin_build();
                    fresh.reset();
                    shadow.insert(name.clone(), Arc::new(fresh));
                }
                Err(e) => log_error!("cannot rebuild index '{}': {}", name, e),
            }
        }
        if shadow.is_empty() {
            return;
        }

        // Stream every segment in parallel, offering each document to every
        // shadow index.
        let segments = self.segments();
        let scope_result = crossbeam::thread::scope(|scope| {
            for segment in &segments {
                let segment = Arc::clone(segment);
                let shadow = &shadow;
                scope.spawn(move |_| {
                    let streamed = segment.for_each(|document| {
                        for index in shadow.values() {
                            index.add_item(document);
                        }
                    });
                    if let Err(e) = streamed {
                        log_warn!("segment stream failed during rebuild: {}", e);
                    }
                });
            }
        });
        if scope_result.is_err() {
            log_error!("index rebuild worker panicked; keeping previous catalog");
            return;
        }

        for index in shadow.values() {
            index.finish();
            index.end_build();
        }

        // Swap. Probes entering mid-swap bind to either generation.
        let mut live = self.indexes.write();
        for (name, index) in shadow {
            live.insert(name, index);
        }
        log_debug!("index rebuild finished for collection '{}'", self.name);
    }

    /// Delete every document whose `&ttl` instant has passed.
    pub fn ttl_sweep(&self) {
        let now = Utc::now().timestamp();

        for segment in self.segments() {
            let mut expired = Vec::new();
            let streamed = segment.for_each(|document| {
                if let (Some(ttl), Some(id)) = (doc_ttl(document), doc_id(document)) {
                    if now - ttl > 0 {
                        expired.push(id);
                    }
                }
            });
            if let Err(e) = streamed {
                log_warn!("ttl sweep skipped a segment of '{}': {}", self.name, e);
                continue;
            }
            if expired.is_empty() {
                continue;
            }

            for id in &expired {
                segment.remove(*id);
            }
            if let Err(e) = segment.save() {
                log_warn!("ttl sweep flush failed for '{}': {}", self.name, e);
            } else {
                log_debug!(
                    "ttl sweep removed {} documents from '{}'",
                    expired.len(),
                    self.name
                );
            }
        }
    }

    /// The persistable `collection.metadata` contents.
    pub fn metadata(&self) -> CollectionMetadata {
        let catalog = self.indexes.read();
        let mut indexes: Vec<Value> = catalog.values().map(|i| i.save_metadata()).collect();
        // Stable order keeps the metadata file diffable.
        indexes.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
        CollectionMetadata {
            name: self.name.clone(),
            indexes,
        }
    }

    /// Flush every segment, then rewrite the metadata file. Metadata goes
    /// through a temp file and an atomic rename; nothing recovers a broken
    /// metadata file, so a torn write must be impossible.
    pub fn save(&self) -> Result<()> {
        for segment in self.segments() {
            segment.save()?;
        }

        let _guard = self.save_lock.lock();
        fs::create_dir_all(&self.dir)?;
        let final_path = self.dir.join("collection.metadata");
        let temp_path = self.dir.join("collection.metadata.tmp");
        fs::write(&temp_path, serde_json::to_string(&self.metadata())?)?;
        fs::rename(&temp_path, &final_path)?;
        Ok(())
    }
}
