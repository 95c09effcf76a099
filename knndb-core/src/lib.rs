// knndb-core/src/lib.rs
// Embedded document database with secondary indexes and ANN vector search.
//
// The crate is organized leaves-first:
//   storage    - row-oriented segment files with buffered mutations
//   index      - the four index variants and their build lifecycle
//   collection - segment set + index catalog, rebuild and TTL protocols
//   query      - the scoring executor
//   cursor     - batched result streaming with timeout reclamation
//   database   - directory lifecycle and the periodic manager loop
//   crud       - the JSON envelope surface an embedding server exposes

#![allow(clippy::too_many_arguments)]
#![allow(clippy::type_complexity)]

pub mod collection;
pub mod config;
pub mod crud;
pub mod cursor;
pub mod database;
pub mod document;
pub mod error;
pub mod index;
pub mod logging;
pub mod query;
pub mod storage;
pub mod update;

// Public exports
pub use collection::{Collection, CollectionMetadata};
pub use config::{is_truthy, Config, DEFAULT_MAX_STORAGE_ELEMENTS};
pub use cursor::{
    active_cursor_count, get_cursor, kill_cursor, reap_expired_cursors, Cursor,
    DEFAULT_BATCH_SIZE, DEFAULT_TIMEOUT_SECS,
};
pub use database::Database;
pub use document::{doc_id, doc_ttl, parse_projection, reduce, ID_FIELD, TTL_FIELD};
pub use error::{KnnDbError, Result};
pub use index::{Index, IndexType, KeyValueIndex, KnnIndex, MultiKeyValueIndex, RangeIndex};
pub use logging::{get_log_level, init_from_env, set_log_level, LogLevel};
pub use query::{QueryExecutor, DEFAULT_LIMIT};
pub use storage::{StorageSegment, EMPTY_ROW_SEQUENCE};
pub use update::{perform_update, validate_update};
