//! Embedding client for the dense retrieval path.
//!
//! Maps text to vectors of a fixed dimension D using a single canonical
//! model behind an HTTP service. Request shape: `{ model, prompt }`;
//! response shape: `{ embedding: [f32, ...] }`.
//!
//! Behavior that matters for retrieval quality:
//!
//! - There is **no fallback model** and no synthetic hash-vector: when the
//!   service exhausts its retries the caller gets
//!   [`EngineError::EmbeddingUnavailable`].
//! - Vectors of the wrong length are zero-padded or truncated to D and the
//!   correction is logged; non-finite components are rejected as
//!   [`EngineError::BadVector`].
//! - Batch embedding preserves input order, serves cache hits without
//!   touching the network, and fans misses out with bounded concurrency.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::{hash_key, TtlCache};
use crate::config::EmbeddingConfig;
use crate::types::{EngineError, Result};

/// Base delay for the exponential retry backoff.
const RETRY_BASE_DELAY_MS: u64 = 500;

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

/// HTTP embedding client with cache-through and batched concurrency.
pub struct EmbeddingClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    config: EmbeddingConfig,
    cache: Arc<TtlCache<Vec<f32>>>,
}

impl EmbeddingClient {
    /// Create a client for the given service endpoint and model.
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        config: EmbeddingConfig,
        cache: Arc<TtlCache<Vec<f32>>>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| {
                EngineError::EmbeddingUnavailable(format!("failed to build http client: {}", e))
            })?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            config,
            cache,
        })
    }

    /// The embedding dimension D this client enforces.
    pub fn dimension(&self) -> usize {
        self.config.dimension
    }

    /// The model identifier this client is pinned to.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Embed a single text, serving from cache when possible.
    pub async fn embed(&self, text: &str, cancel: &CancellationToken) -> Result<Vec<f32>> {
        let key = hash_key(&[&self.model, text]);
        if let Some(vector) = self.cache.get(&key) {
            return Ok(vector);
        }

        let vector = self.fetch_with_retry(text, cancel).await?;
        // A cancelled request must leave no trace in the cache.
        if !cancel.is_cancelled() {
            self.cache.insert(&key, vector.clone());
        }
        Ok(vector)
    }

    /// Embed many texts, preserving input order.
    ///
    /// Texts are partitioned by cache hit vs miss; misses are processed in
    /// batches of `batch_size`, each fanned out with up to `concurrency`
    /// concurrent requests. A miss that ultimately fails aborts the whole
    /// batch.
    pub async fn embed_batch(
        &self,
        texts: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<f32>>> {
        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut misses: Vec<(usize, &str)> = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            let key = hash_key(&[&self.model, text]);
            match self.cache.get(&key) {
                Some(vector) => results[i] = Some(vector),
                None => misses.push((i, text.as_str())),
            }
        }

        debug!(
            total = texts.len(),
            cached = texts.len() - misses.len(),
            misses = misses.len(),
            "embedding batch"
        );

        for batch in misses.chunks(self.config.batch_size) {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let futures: Vec<_> = batch
                .iter()
                .map(|&(i, text)| {
                    let text = text.to_string();
                    async move { (i, self.embed(&text, cancel).await) }
                })
                .collect();
            let fetched: Vec<(usize, Result<Vec<f32>>)> = stream::iter(futures)
                .buffered(self.config.concurrency.max(1))
                .collect()
                .await;

            for (i, result) in fetched {
                results[i] = Some(result?);
            }
        }

        // Every slot is filled: cache hits above, fetched misses here, and
        // any fetch failure already returned.
        Ok(results.into_iter().flatten().collect())
    }

    async fn fetch_with_retry(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<f32>> {
        let mut last_error = String::new();

        for attempt in 0..=self.config.retries {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                outcome = self.request(text) => outcome,
            };

            match outcome {
                Ok(raw) => return self.conform(raw),
                Err(e) => {
                    last_error = e;
                    if attempt < self.config.retries {
                        let backoff = RETRY_BASE_DELAY_MS * (1 << attempt);
                        let jitter = rand::rng().random_range(0..RETRY_BASE_DELAY_MS / 2);
                        warn!(
                            attempt = attempt + 1,
                            retries = self.config.retries,
                            error = %last_error,
                            "embedding request failed, retrying"
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                            _ = tokio::time::sleep(Duration::from_millis(backoff + jitter)) => {}
                        }
                    }
                }
            }
        }

        Err(EngineError::EmbeddingUnavailable(format!(
            "model {} failed after {} retries: {}",
            self.model, self.config.retries, last_error
        )))
    }

    async fn request(&self, text: &str) -> std::result::Result<Vec<f32>, String> {
        let url = format!("{}/api/embeddings", self.base_url);
        let body = EmbeddingRequest {
            model: &self.model,
            prompt: text,
        };

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("request error: {}", e))?
            .error_for_status()
            .map_err(|e| format!("status error: {}", e))?;

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| format!("decode error: {}", e))?;
        Ok(parsed.embedding)
    }

    /// Enforce dimension D and finiteness on a raw service vector.
    fn conform(&self, mut vector: Vec<f32>) -> Result<Vec<f32>> {
        if let Some(bad) = vector.iter().find(|v| !v.is_finite()) {
            return Err(EngineError::BadVector(format!(
                "non-finite component {} from model {}",
                bad, self.model
            )));
        }

        let dim = self.config.dimension;
        if vector.len() != dim {
            warn!(
                got = vector.len(),
                expected = dim,
                model = %self.model,
                "embedding dimension mismatch, correcting"
            );
            if vector.len() > dim {
                vector.truncate(dim);
            } else {
                vector.resize(dim, 0.0);
            }
        }

        if vector.iter().all(|v| *v == 0.0) {
            return Err(EngineError::BadVector(format!(
                "zero-norm vector from model {}",
                self.model
            )));
        }

        Ok(vector)
    }
}

// ============================================================================
// Tests
// ============================================================================
