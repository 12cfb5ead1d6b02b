//! Storage Layer
//!
//! [`Database`] owns the SQLite connection, the tokenizer extension, and the
//! `__TABLE_MANAGE__` registry; [`Table`] is the per-logical-table engine
//! keeping the relational rows, the FTS5 shadow table, and the HNSW index
//! consistent.

mod database;
mod table;

pub use database::{
    CheckpointMode, CheckpointResult, Database, FtsTokenizer, SynchronousMode, TableInfo,
};
pub use table::{IndexParams, Table};

use crate::embeddings::EmbeddingError;
use crate::search::AnnError;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Storage error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// SQLite error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Vector index error
    #[error("vector index error: {0}")]
    Index(#[from] AnnError),
    /// Embedding callback or service error
    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),
    /// Caller passed an out-of-contract value
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Embedding output does not match the table's vector dimension
    #[error("embedding dimension mismatch: expected {expected} values, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    /// Registered table parameters disagree with the caller's
    #[error(
        "table `{table}` is registered with dimension {persisted_dimension} and \
         connectivity {persisted_connectivity}, caller asked for \
         {requested_dimension}/{requested_connectivity}"
    )]
    ParamMismatch {
        table: String,
        persisted_dimension: usize,
        persisted_connectivity: usize,
        requested_dimension: usize,
        requested_connectivity: usize,
    },
    /// WAL checkpoint failure
    #[error("wal error: {0}")]
    Wal(String),
    /// Initialization error
    #[error("initialization error: {0}")]
    Init(String),
    /// Connection lock poisoned by a panicking holder
    #[error("connection lock poisoned")]
    Lock,
}

/// Storage result type
pub type Result<T> = std::result::Result<T, StorageError>;

pub(crate) fn invalid_argument(msg: impl Into<String>) -> StorageError {
    StorageError::InvalidArgument(msg.into())
}
