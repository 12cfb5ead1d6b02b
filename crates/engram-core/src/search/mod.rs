//! Search Module
//!
//! The two non-relational retrieval paths:
//! - Approximate nearest-neighbour search over an HNSW graph (USearch)
//! - FTS5 match-expression helpers for keyword search

mod ann;
mod keyword;

pub use ann::{AnnError, AnnIndex, DEFAULT_CONNECTIVITY, DEFAULT_EXPANSION_SEARCH};
pub use keyword::sanitize_match_query;
