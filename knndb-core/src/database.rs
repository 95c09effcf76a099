// knndb-core/src/database.rs
// Database root: collection lifecycle and the periodic manager loop

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::RwLock;

use crate::collection::{Collection, CollectionMetadata};
use crate::config::Config;
use crate::cursor::reap_expired_cursors;
use crate::error::{KnnDbError, Result};
use crate::index::Index;
use crate::storage::{discard_segment_file, StorageSegment};
use crate::{log_debug, log_error, log_info, log_warn};

/// TTL sweeps run on this cadence.
const TTL_SWEEP_INTERVAL: Duration = Duration::from_secs(300);
/// Saves and cursor reaping run on this cadence.
const SAVE_INTERVAL: Duration = Duration::from_secs(180);
/// Manager wakeup granularity; bounds shutdown latency.
const MANAGER_TICK: Duration = Duration::from_secs(1);

/// The root object owning every collection loaded from one data directory.
pub struct Database {
    config: Config,
    collections: RwLock<HashMap<String, Arc<Collection>>>,
    shutdown: AtomicBool,
}

impl Database {
    /// Scan `data_path` for `col_*` directories and load each collection,
    /// then schedule background index builds. Segment files that fail to
    /// parse are deleted silently: they are flush leftovers of a crash and
    /// the surviving file carries the data.
    pub fn load(config: Config) -> Result<Arc<Database>> {
        fs::create_dir_all(&config.data_path)?;
        log_info!("loading collections from {}", config.data_path.display());

        let db = Arc::new(Database {
            config: config.clone(),
            collections: RwLock::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
        });

        for entry in fs::read_dir(&config.data_path)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().to_string();
            if !entry.path().is_dir() || !file_name.starts_with("col_") {
                continue;
            }

            match Self::load_collection(&entry.path(), &config) {
                Ok(collection) => {
                    let collection = Arc::new(collection);
                    log_info!(
                        "loaded collection '{}' ({} segments)",
                        collection.name,
                        collection.segments().len()
                    );
                    db.collections
                        .write()
                        .insert(collection.name.clone(), Arc::clone(&collection));

                    // Indexes build in the background; queries meanwhile see
                    // the still-empty catalog entries.
                    let builder = Arc::clone(&collection);
                    std::thread::spawn(move || builder.build_indexes());
                }
                Err(e) => {
                    log_error!(
                        "collection cannot be loaded: {}: {}",
                        entry.path().display(),
                        e
                    );
                }
            }
        }

        Ok(db)
    }

    fn load_collection(dir: &Path, config: &Config) -> Result<Collection> {
        let metadata_path = dir.join("collection.metadata");
        if !metadata_path.exists() {
            return Err(KnnDbError::Corruption(format!(
                "collection.metadata missing in {}",
                dir.display()
            )));
        }

        let metadata: CollectionMetadata =
            serde_json::from_str(&fs::read_to_string(&metadata_path)?)?;

        let collection = Collection::new(
            metadata.name,
            dir.to_path_buf(),
            config.max_storage_elements,
        );

        for index_meta in &metadata.indexes {
            match Index::from_metadata(index_meta) {
                Ok(index) => {
                    collection.add_index(index);
                }
                Err(e) => log_warn!("cannot load index: {}", e),
            }
        }

        // Segment files load in parallel workers.
        let segment_paths: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension().map(|ext| ext == "knndb").unwrap_or(false)
            })
            .collect();

        let scope_result = crossbeam::thread::scope(|scope| {
            let handles: Vec<_> = segment_paths
                .iter()
                .map(|path| {
                    scope.spawn(move |_| match StorageSegment::open(path) {
                        Ok(segment) => Some(Arc::new(segment)),
                        Err(e) => {
                            // Crash leftover of an interrupted flush.
                            log_warn!(
                                "dropping unparseable segment {}: {}",
                                path.display(),
                                e
                            );
                            discard_segment_file(path);
                            None
                        }
                    })
                })
                .collect();
            for handle in handles {
                if let Ok(Some(segment)) = handle.join() {
                    collection.add_segment(segment);
                }
            }
        });
        if scope_result.is_err() {
            return Err(KnnDbError::Internal(
                "segment loader worker panicked".to_string(),
            ));
        }

        Ok(collection)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn collection(&self, name: &str) -> Option<Arc<Collection>> {
        self.collections.read().get(name).map(Arc::clone)
    }

    pub fn collections(&self) -> Vec<Arc<Collection>> {
        self.collections.read().values().map(Arc::clone).collect()
    }

    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Get or create a collection. Creation makes the `col_<name>`
    /// directory and persists an initial metadata file right away.
    pub fn create_collection(&self, name: &str) -> Result<Arc<Collection>> {
        if let Some(existing) = self.collection(name) {
            return Ok(existing);
        }

        let dir = self.config.data_path.join(format!("col_{}", name));
        fs::create_dir_all(&dir)?;
        let collection = Arc::new(Collection::new(
            name.to_string(),
            dir,
            self.config.max_storage_elements,
        ));
        collection.save()?;
        self.collections
            .write()
            .insert(name.to_string(), Arc::clone(&collection));
        log_debug!("created collection '{}'", name);
        Ok(collection)
    }

    /// Flush every collection. A failing collection loses this save attempt
    /// only; the rest proceed.
    pub fn save(&self) {
        for collection in self.collections() {
            if let Err(e) = collection.save() {
                log_error!("saving collection '{}' failed: {}", collection.name, e);
            }
        }
    }

    /// TTL sweep across every collection.
    pub fn ttl_sweep(&self) {
        for collection in self.collections() {
            collection.ttl_sweep();
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Run the periodic manager until shutdown: TTL sweeps every five
    /// minutes, saves plus cursor reaping every three. A final save runs
    /// on the way out.
    pub fn start_manager(self: &Arc<Self>) -> JoinHandle<()> {
        let db = Arc::clone(self);
        std::thread::spawn(move || {
            let mut since_ttl = Duration::ZERO;
            let mut since_save = Duration::ZERO;

            while !db.is_shutting_down() {
                std::thread::sleep(MANAGER_TICK);
                since_ttl += MANAGER_TICK;
                since_save += MANAGER_TICK;

                if since_ttl >= TTL_SWEEP_INTERVAL {
                    since_ttl = Duration::ZERO;
                    db.ttl_sweep();
                }
                if since_save >= SAVE_INTERVAL {
                    since_save = Duration::ZERO;
                    db.save();
                    let reaped = reap_expired_cursors();
                    if reaped > 0 {
                        log_debug!("reaped {} expired cursors", reaped);
                    }
                }
            }

            db.save();
            log_info!("manager loop stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> Config {
        Config::with_data_path(dir.path())
    }

    #[test]
    fn test_load_empty_directory() {
        let dir = TempDir::new().unwrap();
        let db = Database::load(test_config(&dir)).unwrap();
        assert!(db.collection_names().is_empty());
    }

    #[test]
    fn test_create_and_reload_collection() {
        let dir = TempDir::new().unwrap();
        {
            let db = Database::load(test_config(&dir)).unwrap();
            let col = db.create_collection("books").unwrap();
            col.insert_documents(vec![json!({"id": 1, "title": "A"})])
                .unwrap();
            db.save();
        }

        let db = Database::load(test_config(&dir)).unwrap();
        let col = db.collection("books").unwrap();
        assert_eq!(col.count_documents(), 1);
        assert!(col.saved_anywhere(1));
    }

    #[test]
    fn test_create_collection_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let db = Database::load(test_config(&dir)).unwrap();

        let first = db.create_collection("books").unwrap();
        let second = db.create_collection("books").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_reload_restores_indexes() {
        let dir = TempDir::new().unwrap();
        {
            let db = Database::load(test_config(&dir)).unwrap();
            let col = db.create_collection("books").unwrap();
            col.add_index(
                Index::from_metadata(&json!({
                    "name": "by_title", "type": 0, "keyName": "title", "isHashedIndex": false
                }))
                .unwrap(),
            );
            db.save();
        }

        let db = Database::load(test_config(&dir)).unwrap();
        let col = db.collection("books").unwrap();
        let catalog = col.catalog();
        assert!(catalog.contains_key("by_title"));
    }

    #[test]
    fn test_garbage_segment_is_dropped_silently() {
        let dir = TempDir::new().unwrap();
        {
            let db = Database::load(test_config(&dir)).unwrap();
            let col = db.create_collection("books").unwrap();
            col.insert_documents(vec![json!({"id": 1})]).unwrap();
            db.save();
        }

        // Plant truncated garbage next to the healthy segment.
        let garbage = dir.path().join("col_books").join("leftover.knndb");
        fs::write(&garbage, "{\"id\": 2, \"tru").unwrap();

        let db = Database::load(test_config(&dir)).unwrap();
        let col = db.collection("books").unwrap();
        assert_eq!(col.count_documents(), 1);
        assert!(!garbage.exists());
    }

    #[test]
    fn test_directory_without_metadata_is_skipped() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("col_broken")).unwrap();

        let db = Database::load(test_config(&dir)).unwrap();
        assert!(db.collection("broken").is_none());
    }

    #[test]
    fn test_non_collection_directories_ignored() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("not_a_collection")).unwrap();

        let db = Database::load(test_config(&dir)).unwrap();
        assert!(db.collection_names().is_empty());
    }

    #[test]
    fn test_manager_shutdown_saves() {
        let dir = TempDir::new().unwrap();
        let db = Database::load(test_config(&dir)).unwrap();
        let col = db.create_collection("books").unwrap();
        col.insert_documents(vec![json!({"id": 5})]).unwrap();

        let handle = db.start_manager();
        db.request_shutdown();
        handle.join().unwrap();

        // The final save flushed the pending insert to disk.
        let reloaded = Database::load(test_config(&dir)).unwrap();
        assert_eq!(reloaded.collection("books").unwrap().count_documents(), 1);
    }
}
