//! User-supplied embedding callbacks
//!
//! A table holds zero, one, or both of a single-text and a batch callback.
//! The batch form receives the whole input list in one call; when only the
//! single form is set, batch embedding falls back to one call per element
//! with the results concatenated in order. Callbacks may block arbitrarily
//! (an HTTP round-trip to an embedding service is the expected case), so
//! they are never invoked while a store lock is held.

use std::fmt;

/// Error type user callbacks may fail with.
pub type BoxedError = Box<dyn std::error::Error + Send + Sync>;

/// Single-text callback: text to a `dimension`-long vector.
pub type EmbedFn = Box<dyn Fn(&str) -> Result<Vec<f32>, BoxedError> + Send>;

/// Batch callback: `n` texts to a concatenated `n * dimension`-long vector.
pub type EmbedBatchFn = Box<dyn Fn(&[String]) -> Result<Vec<f32>, BoxedError> + Send>;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Embedding error types
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    /// Neither a single nor a batch callback has been supplied
    #[error("no embedding callback configured")]
    NotConfigured,
    /// The user callback returned an error
    #[error("embedding callback failed: {0}")]
    Callback(#[source] BoxedError),
    /// The embedding service misbehaved (transport, status, payload)
    #[error("embedding service error: {0}")]
    Service(String),
}

// ============================================================================
// HOOKS
// ============================================================================

/// Holder for the user-supplied embedding callbacks.
#[derive(Default)]
pub struct EmbeddingHooks {
    single: Option<EmbedFn>,
    batch: Option<EmbedBatchFn>,
}

impl EmbeddingHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the single-text callback.
    pub fn set_single(
        &mut self,
        f: impl Fn(&str) -> Result<Vec<f32>, BoxedError> + Send + 'static,
    ) {
        self.single = Some(Box::new(f));
    }

    /// Install the batch callback.
    pub fn set_batch(
        &mut self,
        f: impl Fn(&[String]) -> Result<Vec<f32>, BoxedError> + Send + 'static,
    ) {
        self.batch = Some(Box::new(f));
    }

    /// Whether any callback is available.
    pub fn is_configured(&self) -> bool {
        self.single.is_some() || self.batch.is_some()
    }

    /// Embed one text. Prefers the single callback, falls back to a
    /// one-element batch call.
    pub fn embed_one(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if let Some(single) = &self.single {
            return single(text).map_err(EmbeddingError::Callback);
        }
        if let Some(batch) = &self.batch {
            let texts = [text.to_string()];
            return batch(&texts).map_err(EmbeddingError::Callback);
        }
        Err(EmbeddingError::NotConfigured)
    }

    /// Embed many texts into one concatenated vector, in input order.
    /// Prefers the batch callback (one call with the full list).
    pub fn embed_many(&self, texts: &[String]) -> Result<Vec<f32>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(batch) = &self.batch {
            return batch(texts).map_err(EmbeddingError::Callback);
        }
        if let Some(single) = &self.single {
            let mut out = Vec::new();
            for text in texts {
                out.extend(single(text).map_err(EmbeddingError::Callback)?);
            }
            return Ok(out);
        }
        Err(EmbeddingError::NotConfigured)
    }
}

impl fmt::Debug for EmbeddingHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddingHooks")
            .field("single", &self.single.is_some())
            .field("batch", &self.batch.is_some())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn unset_hooks_fail_with_not_configured() {
        let hooks = EmbeddingHooks::new();
        assert!(!hooks.is_configured());
        assert!(matches!(
            hooks.embed_one("x"),
            Err(EmbeddingError::NotConfigured)
        ));
        assert!(matches!(
            hooks.embed_many(&["x".to_string()]),
            Err(EmbeddingError::NotConfigured)
        ));
    }

    #[test]
    fn single_callback_serves_both_paths() {
        let mut hooks = EmbeddingHooks::new();
        hooks.set_single(|text| Ok(vec![text.len() as f32, 1.0]));

        assert_eq!(hooks.embed_one("abc").unwrap(), vec![3.0, 1.0]);
        // per-element fallback concatenates in order
        let out = hooks
            .embed_many(&["a".to_string(), "abcd".to_string()])
            .unwrap();
        assert_eq!(out, vec![1.0, 1.0, 4.0, 1.0]);
    }

    #[test]
    fn batch_callback_receives_full_list_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let mut hooks = EmbeddingHooks::new();
        hooks.set_batch(move |texts| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(texts.iter().map(|t| t.len() as f32).collect())
        });

        let out = hooks
            .embed_many(&["a".to_string(), "bb".to_string(), "ccc".to_string()])
            .unwrap();
        assert_eq!(out, vec![1.0, 2.0, 3.0]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // embed_one falls back to a one-element batch
        assert_eq!(hooks.embed_one("dd").unwrap(), vec![2.0]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn empty_batch_never_invokes_the_callback() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let mut hooks = EmbeddingHooks::new();
        hooks.set_batch(move |texts| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(vec![0.0; texts.len()])
        });

        assert!(hooks.embed_many(&[]).unwrap().is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn callback_errors_are_surfaced() {
        let mut hooks = EmbeddingHooks::new();
        hooks.set_single(|_| Err("service unreachable".into()));
        let err = hooks.embed_one("x").unwrap_err();
        assert!(matches!(err, EmbeddingError::Callback(_)));
        assert!(err.to_string().contains("embedding callback failed"));
    }
}
