//! HTTP embedding-service client
//!
//! Speaks the common `POST {model, prompt}` / `{"embedding": [...]}` JSON
//! shape (Ollama-style). Blocking on purpose: the store invokes callbacks
//! synchronously from its insert and query paths.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::hooks::{BoxedError, EmbeddingError};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

/// Client for an HTTP embedding endpoint.
pub struct RemoteEmbedder {
    client: reqwest::blocking::Client,
    endpoint: String,
    model: String,
}

impl RemoteEmbedder {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, EmbeddingError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| EmbeddingError::Service(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            model: model.into(),
        })
    }

    /// Embed one prompt. Any non-success status is an error.
    pub fn embed(&self, prompt: &str) -> Result<Vec<f32>, EmbeddingError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&EmbeddingRequest {
                model: &self.model,
                prompt,
            })
            .send()
            .map_err(|e| EmbeddingError::Service(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(EmbeddingError::Service(format!(
                "embedding endpoint returned {status}"
            )));
        }

        let body: EmbeddingResponse = response
            .json()
            .map_err(|e| EmbeddingError::Service(format!("malformed embedding payload: {e}")))?;
        Ok(body.embedding)
    }

    /// Adapt into a single-text callback for
    /// [`Table::set_embedder`](crate::storage::Table::set_embedder).
    pub fn into_single_hook(self) -> impl Fn(&str) -> Result<Vec<f32>, BoxedError> + Send + 'static {
        move |text| self.embed(text).map_err(|e| Box::new(e) as BoxedError)
    }
}

impl std::fmt::Debug for RemoteEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteEmbedder")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .finish()
    }
}
