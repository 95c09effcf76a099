// knndb-core/src/cursor.rs
// Cursors: ranked id lists streamed to clients in bounded batches

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::collection::Collection;
use crate::log_trace;

pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_TIMEOUT_SECS: u64 = 1800;

/// The prefetch buffer is kept at 1.75x the batch size.
const PREFETCH_NUM: usize = 7;
const PREFETCH_DEN: usize = 4;

lazy_static! {
    /// Process-wide cursor table, keyed by cursor id.
    static ref CURSORS: DashMap<String, Arc<Cursor>> = DashMap::new();
}

// Salts the id hash so cursors created in the same millisecond differ.
static CURSOR_SEQ: AtomicU64 = AtomicU64::new(0);

struct CursorState {
    ids: VecDeque<(u64, f32)>,
    documents: Vec<Value>,
    next_doc_index: usize,
}

/// A registered, prefetching view over one query result.
///
/// Batch entries are `[index, score, document]` triples in rank order.
pub struct Cursor {
    pub id: String,
    collection: Arc<Collection>,
    projection: HashMap<String, bool>,
    batch_size: AtomicUsize,
    timeout: u64,
    pub created_at: u64,
    last_interaction: AtomicU64,
    state: Mutex<CursorState>,
}

impl Cursor {
    /// Build a cursor, register it, and kick off the first prefetch.
    pub fn create(
        collection: Arc<Collection>,
        ids: Vec<(u64, f32)>,
        projection: HashMap<String, bool>,
        batch_size: usize,
        timeout: u64,
    ) -> Arc<Cursor> {
        let now_millis = Utc::now().timestamp_millis();
        let salt = CURSOR_SEQ.fetch_add(1, Ordering::Relaxed);
        let id = format!(
            "{:x}",
            Sha256::digest(format!("{}:{}", now_millis, salt).as_bytes())
        );

        let now = Utc::now().timestamp() as u64;
        let cursor = Arc::new(Cursor {
            id: id.clone(),
            collection,
            projection,
            batch_size: AtomicUsize::new(batch_size),
            timeout,
            created_at: now,
            last_interaction: AtomicU64::new(now),
            state: Mutex::new(CursorState {
                ids: ids.into(),
                documents: Vec::new(),
                next_doc_index: 0,
            }),
        });

        CURSORS.insert(id, Arc::clone(&cursor));

        let prefetcher = Arc::clone(&cursor);
        std::thread::spawn(move || prefetcher.make_batch());

        cursor
    }

    fn touch(&self) {
        self.last_interaction
            .store(Utc::now().timestamp() as u64, Ordering::Relaxed);
    }

    fn batch_size(&self) -> usize {
        self.batch_size.load(Ordering::Relaxed)
    }

    fn prefetch_target(&self) -> usize {
        self.batch_size().saturating_mul(PREFETCH_NUM) / PREFETCH_DEN
    }

    /// Pull documents for the front ids until the buffer reaches the
    /// prefetch target. Ids whose document vanished are consumed silently.
    fn fill_locked(&self, state: &mut CursorState) {
        let target = self.prefetch_target();
        let segments = self.collection.segments();

        while state.documents.len() < target {
            let Some((id, score)) = state.ids.pop_front() else {
                break;
            };
            for segment in &segments {
                if !segment.saved_here(id) {
                    continue;
                }
                if let Ok(docs) = segment.get(&[id], &self.projection, false) {
                    if let Some(document) = docs.into_iter().next() {
                        state
                            .documents
                            .push(json!([state.next_doc_index, score, document]));
                        state.next_doc_index += 1;
                    }
                }
                break;
            }
        }
    }

    /// Prefetch pass, run from a background task.
    pub fn make_batch(&self) {
        self.touch();
        let mut state = self.state.lock();
        if state.ids.is_empty() {
            return;
        }
        self.fill_locked(&mut state);
    }

    /// Switch to "all" mode: unbounded batch, one full prefetch pass.
    pub fn set_all(&self) {
        self.batch_size.store(usize::MAX, Ordering::Relaxed);
        self.make_batch();
    }

    /// Emit up to one batch. Tops the buffer up synchronously when the
    /// background prefetch has not caught up, so a call never blocks on a
    /// detached task. `finished` means ids and buffer are both drained.
    pub fn retrieve_batch(self: &Arc<Self>) -> (Vec<Value>, bool) {
        self.touch();
        let batch = self.batch_size();

        let mut state = self.state.lock();
        if state.documents.len() < batch && !state.ids.is_empty() {
            self.fill_locked(&mut state);
        }

        let take = state.documents.len().min(batch);
        let emitted: Vec<Value> = state.documents.drain(..take).collect();
        let finished = state.documents.is_empty() && state.ids.is_empty();
        drop(state);

        // Keep the buffer warm for the next call.
        if !finished {
            let prefetcher = Arc::clone(self);
            std::thread::spawn(move || prefetcher.make_batch());
        }

        (emitted, finished)
    }

    /// Seconds since the last client interaction reached the timeout.
    pub fn expired(&self, now: u64) -> bool {
        now.saturating_sub(self.last_interaction.load(Ordering::Relaxed)) >= self.timeout
    }

    /// Drop buffered state. Called on destruction under the batch lock so
    /// an in-flight prefetch cannot resurrect anything.
    fn clear(&self) {
        let mut state = self.state.lock();
        state.documents.clear();
        state.ids.clear();
    }
}

/// Look up a live cursor.
pub fn get_cursor(id: &str) -> Option<Arc<Cursor>> {
    CURSORS.get(id).map(|entry| Arc::clone(entry.value()))
}

/// Destroy a cursor: unregister and clear its buffers. The allocation goes
/// away when the last outstanding handle drops.
pub fn kill_cursor(id: &str) {
    if let Some((_, cursor)) = CURSORS.remove(id) {
        cursor.clear();
        log_trace!("cursor {} destroyed", id);
    }
}

/// Destroy every cursor whose timeout elapsed. Returns how many died.
pub fn reap_expired_cursors() -> usize {
    let now = Utc::now().timestamp() as u64;
    let expired: Vec<String> = CURSORS
        .iter()
        .filter(|entry| entry.value().expired(now))
        .map(|entry| entry.key().clone())
        .collect();

    for id in &expired {
        kill_cursor(id);
    }
    expired.len()
}

pub fn active_cursor_count() -> usize {
    CURSORS.len()
}
