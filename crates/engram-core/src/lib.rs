//! # Engram Core
//!
//! Hybrid chat-memory store. Three coordinated retrieval paths over short
//! text messages, kept consistent in one embedded database:
//!
//! - **Metadata lookup**: by id, speaker uuid, or timestamp range (SQLite)
//! - **Full-text search**: FTS5 shadow table with tokenizer-aware
//!   highlighting, including CJK segmentation via a loadable extension
//! - **Vector recall**: HNSW approximate nearest-neighbour search (USearch)
//!   over embeddings produced by a user-supplied callback
//!
//! Messages carry a per-row forget probability; the [`Table::forgotten`]
//! pass purges rows by Bernoulli trial and rebuilds the vector index from
//! the survivors, which is also how the append-only HNSW graph sheds
//! deleted entries. Everything persists across restarts: rows in the SQLite
//! file (WAL mode), vectors in one serialized index file per table.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use engram_core::{Database, FtsTokenizer, IndexParams, InsertMessage, Table};
//! use std::sync::Arc;
//!
//! let db = Arc::new(Database::open("memory.db", FtsTokenizer::Unicode61)?);
//! let mut table = Table::open(Arc::clone(&db), "chat", IndexParams::new(768))?;
//! table.set_embedder(|text| embed_somehow(text));
//!
//! table.add(&InsertMessage::new("speaker-uuid", "hello world"))?;
//!
//! let keyword = table.search_list_fts("hello", Some(10))?;
//! let semantic = table.search_list_vector_text("greetings", 10)?;
//! ```
//!
//! ## Feature Flags
//!
//! - `bundled-sqlite` (default): compile SQLite from source, FTS5 included
//! - `remote-embeddings`: blocking HTTP client for an embedding service

#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULES
// ============================================================================

pub mod embeddings;
pub mod memory;
pub mod search;
pub mod storage;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

// Message records
pub use memory::{FtsFilter, InsertMessage, StoredMessage, VectorMatch};

// Storage layer
pub use storage::{
    CheckpointMode, CheckpointResult, Database, FtsTokenizer, IndexParams, Result, StorageError,
    SynchronousMode, Table, TableInfo,
};

// Vector index
pub use search::{AnnError, AnnIndex, DEFAULT_CONNECTIVITY};

// Embedding callbacks
pub use embeddings::{BoxedError, EmbeddingError, EmbeddingHooks};

#[cfg(feature = "remote-embeddings")]
pub use embeddings::RemoteEmbedder;

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// PRELUDE
// ============================================================================

/// Convenient imports for common usage
pub mod prelude {
    pub use crate::{
        Database, FtsFilter, FtsTokenizer, IndexParams, InsertMessage, Result, StorageError,
        StoredMessage, Table, VectorMatch,
    };
}
