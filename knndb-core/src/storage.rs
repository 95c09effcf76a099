// knndb-core/src/storage.rs
// Row-oriented storage segment: one line file plus in-memory buffers

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use ahash::{AHashMap, AHashSet};
use parking_lot::Mutex;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::document::{doc_id, reduce};
use crate::error::{KnnDbError, Result};
use crate::log_trace;
use crate::update::perform_update;

/// Literal line marking a tombstoned row. Stable on-disk format.
pub const EMPTY_ROW_SEQUENCE: &str = "<fgsngflwsitu948whg49ghwe98gh>";

/// One storage segment: a `.knndb` line file, the id-to-row map covering
/// everything persisted in it, and the three pending-mutation buffers.
///
/// A single mutex serializes every operation on the segment, which covers
/// both the original file-lock discipline (`save`/`get`/`for_each` are
/// exclusive) and the rule that the owning collection must never run two
/// mutations concurrently against the same segment.
#[derive(Debug)]
pub struct StorageSegment {
    inner: Mutex<SegmentInner>,
}

#[derive(Debug)]
struct SegmentInner {
    path: PathBuf,
    /// id of persisted document -> row index in the file
    id_positions: AHashMap<u64, usize>,
    /// pending inserts: id -> full document
    new_documents: AHashMap<u64, Value>,
    /// pending edits: row index -> update document
    edited_documents: AHashMap<usize, Value>,
    /// pending deletes: row indexes
    removed_documents: AHashSet<usize>,
}

impl StorageSegment {
    /// Open a segment file, indexing every live row.
    ///
    /// A missing file yields an empty segment (fresh segments are created
    /// this way and only materialize on the first `save`). A file that
    /// exists but does not parse fails loudly; the collection loader treats
    /// that as a crash leftover and deletes it.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut id_positions = AHashMap::new();

        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for (row, line) in reader.lines().enumerate() {
                let line = line?;
                if line == EMPTY_ROW_SEQUENCE {
                    continue;
                }
                let document: Value = serde_json::from_str(&line).map_err(|e| {
                    KnnDbError::Corruption(format!(
                        "unparseable row {} in {}: {}",
                        row,
                        path.display(),
                        e
                    ))
                })?;
                let id = doc_id(&document).ok_or_else(|| {
                    KnnDbError::Corruption(format!(
                        "row {} in {} has no numeric id",
                        row,
                        path.display()
                    ))
                })?;
                id_positions.insert(id, row);
            }
        }

        Ok(StorageSegment {
            inner: Mutex::new(SegmentInner {
                path,
                id_positions,
                new_documents: AHashMap::new(),
                edited_documents: AHashMap::new(),
                removed_documents: AHashSet::new(),
            }),
        })
    }

    /// Current file path. Flushes move the segment to a new path.
    pub fn path(&self) -> PathBuf {
        self.inner.lock().path.clone()
    }

    /// True if the id lives in this segment, persisted or pending.
    pub fn saved_here(&self, id: u64) -> bool {
        let inner = self.inner.lock();
        inner.id_positions.contains_key(&id) || inner.new_documents.contains_key(&id)
    }

    /// Live documents in this segment, persisted plus pending inserts.
    pub fn count_documents(&self) -> usize {
        let inner = self.inner.lock();
        inner.id_positions.len() + inner.new_documents.len()
    }

    /// Buffer an insert. In-memory only until the next `save`.
    pub fn insert(&self, document: Value) {
        if let Some(id) = doc_id(&document) {
            self.inner.lock().new_documents.insert(id, document);
        }
    }

    /// Buffer an update for a document held here. Returns false when the id
    /// is unknown to this segment. Pending inserts are merged immediately;
    /// persisted rows get their update applied on the next `save`.
    pub fn edit(&self, id: u64, update: &Value) -> bool {
        let mut inner = self.inner.lock();
        if let Some(&row) = inner.id_positions.get(&id) {
            inner.edited_documents.insert(row, update.clone());
            return true;
        }
        if let Some(pending) = inner.new_documents.get(&id).cloned() {
            let merged = perform_update(&pending, update);
            inner.new_documents.insert(id, merged);
            return true;
        }
        false
    }

    /// Mark a persisted document for deletion. Returns true when the id was
    /// present. Pending inserts are not removed by this call.
    pub fn remove(&self, id: u64) -> bool {
        let mut inner = self.inner.lock();
        if let Some(row) = inner.id_positions.remove(&id) {
            inner.removed_documents.insert(row);
            return true;
        }
        false
    }

    /// Append every id held here (persisted and pending) to `out`.
    pub fn all_ids(&self, out: &mut Vec<u64>) {
        let inner = self.inner.lock();
        out.extend(inner.id_positions.keys().copied());
        out.extend(inner.new_documents.keys().copied());
    }

    /// Fetch documents by id (or all live documents when `all`), applying
    /// the projection. Pending inserts are served first, then the file.
    pub fn get(
        &self,
        ids: &[u64],
        projection: &HashMap<String, bool>,
        all: bool,
    ) -> Result<Vec<Value>> {
        let inner = self.inner.lock();
        let mut documents = Vec::with_capacity(ids.len());

        // Pending inserts first.
        if all {
            for doc in inner.new_documents.values() {
                documents.push(reduce(doc, projection));
            }
        } else {
            for id in ids {
                if let Some(doc) = inner.new_documents.get(id) {
                    documents.push(reduce(doc, projection));
                }
            }
        }

        // Then the persisted rows.
        let mut wanted_rows: AHashSet<usize> = AHashSet::new();
        for id in ids {
            if let Some(&row) = inner.id_positions.get(id) {
                wanted_rows.insert(row);
            }
        }

        if inner.path.exists() && (all || !wanted_rows.is_empty()) {
            let reader = BufReader::new(File::open(&inner.path)?);
            for (row, line) in reader.lines().enumerate() {
                let line = line?;
                if line == EMPTY_ROW_SEQUENCE {
                    continue;
                }
                if all || wanted_rows.contains(&row) {
                    let document: Value = serde_json::from_str(&line).map_err(|e| {
                        KnnDbError::Corruption(format!(
                            "unparseable row {} in {}: {}",
                            row,
                            inner.path.display(),
                            e
                        ))
                    })?;
                    documents.push(reduce(&document, projection));
                    if !all && documents.len() >= ids.len() {
                        break;
                    }
                }
            }
        }

        Ok(documents)
    }

    /// Flush pending mutations, then stream every live document through `f`.
    pub fn for_each<F: FnMut(&Value)>(&self, mut f: F) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::save_locked(&mut inner)?;

        if !inner.path.exists() {
            return Ok(());
        }

        let reader = BufReader::new(File::open(&inner.path)?);
        for line in reader.lines() {
            let line = line?;
            if line == EMPTY_ROW_SEQUENCE {
                continue;
            }
            let document: Value = serde_json::from_str(&line).map_err(|e| {
                KnnDbError::Corruption(format!(
                    "unparseable row in {}: {}",
                    inner.path.display(),
                    e
                ))
            })?;
            f(&document);
        }
        Ok(())
    }

    /// Flush pending inserts, edits and removes by rewriting the file.
    pub fn save(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::save_locked(&mut inner)
    }

    /// The rewrite protocol. The new file name is the SHA-256 of the old
    /// one, so the segment rolls to a new path on every flush; a crash
    /// between writing the new file and deleting the old one leaves a
    /// parseable survivor plus a partial file the loader drops.
    fn save_locked(inner: &mut SegmentInner) -> Result<()> {
        if inner.new_documents.is_empty()
            && inner.edited_documents.is_empty()
            && inner.removed_documents.is_empty()
        {
            return Ok(());
        }

        let old_path = inner.path.clone();
        let file_name = old_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let hashed = format!("{:x}", Sha256::digest(file_name.as_bytes()));
        let new_path = old_path.with_file_name(format!("{}.knndb", hashed));

        let mut writer = BufWriter::new(File::create(&new_path)?);
        let mut row = 0usize;

        if old_path.exists() {
            let reader = BufReader::new(File::open(&old_path)?);
            for line in reader.lines() {
                let line = line?;
                if line == EMPTY_ROW_SEQUENCE {
                    // Tombstone slot: refill it with a pending insert if one
                    // is left, otherwise keep the sentinel.
                    let refill = inner.new_documents.keys().next().copied();
                    match refill.and_then(|id| inner.new_documents.remove(&id).map(|d| (id, d))) {
                        Some((id, document)) => {
                            writeln!(writer, "{}", serde_json::to_string(&document)?)?;
                            inner.id_positions.insert(id, row);
                        }
                        None => writeln!(writer, "{}", EMPTY_ROW_SEQUENCE)?,
                    }
                } else if inner.removed_documents.remove(&row) {
                    writeln!(writer, "{}", EMPTY_ROW_SEQUENCE)?;
                } else if let Some(update) = inner.edited_documents.remove(&row) {
                    let old_doc: Value = serde_json::from_str(&line).map_err(|e| {
                        KnnDbError::Corruption(format!(
                            "unparseable row {} in {}: {}",
                            row,
                            old_path.display(),
                            e
                        ))
                    })?;
                    let updated = perform_update(&old_doc, &update);
                    writeln!(writer, "{}", serde_json::to_string(&updated)?)?;
                } else {
                    writeln!(writer, "{}", line)?;
                }
                row += 1;
            }
        }

        // Whatever inserts are still pending go at the end.
        let leftover: Vec<u64> = inner.new_documents.keys().copied().collect();
        for id in leftover {
            let document = inner.new_documents.remove(&id).unwrap();
            writeln!(writer, "{}", serde_json::to_string(&document)?)?;
            inner.id_positions.insert(id, row);
            row += 1;
        }

        writer.flush()?;
        drop(writer);

        inner.new_documents.clear();
        inner.edited_documents.clear();
        inner.removed_documents.clear();

        if old_path.exists() && old_path != new_path {
            fs::remove_file(&old_path)?;
        }
        log_trace!(
            "segment flushed: {} -> {}",
            old_path.display(),
            new_path.display()
        );
        inner.path = new_path;
        Ok(())
    }
}

/// Remove a segment file that failed to open. Used by the collection loader
/// for crash leftovers.
pub fn discard_segment_file(path: &Path) {
    let _ = fs::remove_file(path);
}
