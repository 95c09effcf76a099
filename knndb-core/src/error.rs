// knndb-core/src/error.rs
// Error types shared across the crate

use serde_json::{json, Value};
use thiserror::Error;

/// All errors surfaced by knndb-core.
///
/// The first group maps 1:1 onto the client-facing failure kinds in the
/// response envelope; the second group is internal plumbing that clients
/// only ever see as `InternalServerError`.
#[derive(Debug, Error)]
pub enum KnnDbError {
    // ---- client-facing ----
    #[error("missing keys: {0}")]
    MissingKeys(String),

    #[error("wrong type: {0}")]
    WrongType(String),

    #[error("unknown operator: {0}")]
    OperatorError(String),

    #[error("no matching index: {0}")]
    IndexMissing(String),

    #[error("empty input: {0}")]
    ZeroItems(String),

    #[error("JSON parse error: {0}")]
    JsonParse(String),

    #[error("no cursor is listed with this uuid: {0}")]
    CursorNotFound(String),

    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    // ---- internal ----
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupted data: {0}")]
    Corruption(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, KnnDbError>;

impl From<serde_json::Error> for KnnDbError {
    fn from(e: serde_json::Error) -> Self {
        KnnDbError::JsonParse(e.to_string())
    }
}

impl KnnDbError {
    /// Stable kind name used as the key in failure envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            KnnDbError::MissingKeys(_) => "MissingKeys",
            KnnDbError::WrongType(_) => "WrongType",
            KnnDbError::OperatorError(_) => "OperatorError",
            KnnDbError::IndexMissing(_) => "IndexMissing",
            KnnDbError::ZeroItems(_) => "ZeroItems",
            KnnDbError::JsonParse(_) => "JsonParseError",
            KnnDbError::CursorNotFound(_) => "CannotFind",
            KnnDbError::CollectionNotFound(_) => "CollectionNotFound",
            KnnDbError::Io(_) | KnnDbError::Corruption(_) | KnnDbError::Internal(_) => {
                "InternalServerError"
            }
        }
    }

    /// Render this error as the `error` object of a failure envelope.
    pub fn error_payload(&self) -> Value {
        let detail = match self {
            KnnDbError::MissingKeys(m)
            | KnnDbError::WrongType(m)
            | KnnDbError::OperatorError(m)
            | KnnDbError::IndexMissing(m)
            | KnnDbError::ZeroItems(m)
            | KnnDbError::JsonParse(m)
            | KnnDbError::CursorNotFound(m)
            | KnnDbError::CollectionNotFound(m) => m.clone(),
            other => other.to_string(),
        };
        json!({ self.kind(): detail })
    }

    /// Full failure envelope: `{"status":"failed","error":{...}}`.
    pub fn to_response(&self) -> Value {
        json!({ "status": "failed", "error": self.error_payload() })
    }
}
