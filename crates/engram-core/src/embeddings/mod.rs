//! Embedding callbacks.
//!
//! The store never computes embeddings itself; callers supply a text-to-vector
//! function (usually a client for an embedding service). [`EmbeddingHooks`]
//! holds the supplied callbacks; [`RemoteEmbedder`] is an optional HTTP client
//! for the common case.

mod hooks;

pub use hooks::{BoxedError, EmbedBatchFn, EmbedFn, EmbeddingError, EmbeddingHooks};

#[cfg(feature = "remote-embeddings")]
mod remote;

#[cfg(feature = "remote-embeddings")]
pub use remote::RemoteEmbedder;
