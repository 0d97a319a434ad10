//! Ingestion path: raw pages in, embedded chunks out.
//!
//! The ingestor drives a source through the processing state machine
//! (`pending → extracting → chunking → embedding → ready`, any state
//! `→ failed`), with up to a configured number of whole-source attempts
//! separated by exponential backoff with jitter. Failures surface as the
//! source's error text; embedding failures are never papered over with
//! substitute vectors.
//!
//! Refresh re-chunks and re-embeds off to the side and swaps the chunk set
//! atomically, so readers see the old chunks until the new set commits.

pub mod chunker;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::IngestConfig;
use crate::embedding::EmbeddingClient;
use crate::store::ChunkStore;
use crate::types::{
    Chunk, EngineError, ProcessingState, Result, Source, SourceId, SourceKind,
};

use chunker::{ChunkingOutcome, SemanticChunker};

/// Base delay between whole-source ingest attempts.
const ATTEMPT_BASE_DELAY_MS: u64 = 1_000;

/// Caller-supplied description of a source to ingest.
#[derive(Debug, Clone)]
pub struct SourceDescriptor {
    /// Display name (filename, page title, ...).
    pub name: String,
    /// Origin kind.
    pub kind: SourceKind,
}

/// Turns raw sources into persisted, embedded chunks.
pub struct Ingestor {
    store: Arc<dyn ChunkStore>,
    embedder: Arc<EmbeddingClient>,
    chunker: SemanticChunker,
    config: IngestConfig,
}

impl Ingestor {
    /// Create an ingestor over the given store and embedding client.
    pub fn new(
        store: Arc<dyn ChunkStore>,
        embedder: Arc<EmbeddingClient>,
        chunker: SemanticChunker,
        config: IngestConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            chunker,
            config,
        }
    }

    /// Ingest a new source from ordered page texts. Returns the final
    /// source record (state `Ready`), or an error after the last attempt.
    pub async fn ingest(
        &self,
        descriptor: SourceDescriptor,
        pages: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<Source> {
        validate_input(&descriptor, &pages)?;
        let hash = content_hash(&pages);

        if let Some(existing) = self.store.find_active_hash(&hash).await? {
            return Err(EngineError::Duplicate(format!(
                "content already ingested as '{}' ({})",
                existing.name, existing.id
            )));
        }

        let now = Utc::now();
        let source = Source {
            id: Uuid::new_v4(),
            name: descriptor.name.clone(),
            kind: descriptor.kind,
            hash: hash.clone(),
            page_count: pages.len(),
            state: ProcessingState::Pending,
            chunk_count: 0,
            embedding_count: 0,
            is_truncated: false,
            coverage_percent: 100.0,
            error: None,
            created_at: now,
            updated_at: now,
        };
        let id = source.id;
        self.store.create_source(source).await?;

        let mut last_error: Option<EngineError> = None;
        for attempt in 1..=self.config.max_attempts.max(1) {
            let run_fut: std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>> =
                Box::pin(self.run_attempt(id, &pages, cancel));
            match run_fut.await {
                Ok(()) => {
                    let source = self.require_source(id).await?;
                    info!(
                        source = %id,
                        name = %descriptor.name,
                        chunks = source.chunk_count,
                        attempt,
                        "source ready"
                    );
                    return Ok(source);
                }
                Err(EngineError::Cancelled) => {
                    self.store.mark_failed(id, "ingest cancelled").await?;
                    return Err(EngineError::Cancelled);
                }
                Err(e) => {
                    let message = e.to_string();
                    warn!(
                        source = %id,
                        attempt,
                        max_attempts = self.config.max_attempts,
                        error = %message,
                        "ingest attempt failed"
                    );
                    self.store.mark_failed(id, &message).await?;
                    last_error = Some(e);
                    if attempt < self.config.max_attempts {
                        let backoff = ATTEMPT_BASE_DELAY_MS * (1 << (attempt - 1));
                        let jitter = rand::rng().random_range(0..ATTEMPT_BASE_DELAY_MS / 2);
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                            _ = tokio::time::sleep(Duration::from_millis(backoff + jitter)) => {}
                        }
                        self.store.transition(id, ProcessingState::Pending).await?;
                    }
                }
            }
        }

        // The attempt loop always records an error before falling through.
        Err(last_error.unwrap_or_else(|| {
            EngineError::StoreUnavailable(format!("ingest of source {} failed", id))
        }))
    }

    /// Re-ingest an existing source from new page texts, atomically
    /// replacing its chunks. The old chunks stay searchable until the new
    /// set commits.
    pub async fn refresh(
        &self,
        source_id: SourceId,
        pages: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<Source> {
        let existing = self.require_source(source_id).await?;
        let descriptor = SourceDescriptor {
            name: existing.name,
            kind: existing.kind,
        };
        validate_input(&descriptor, &pages)?;
        let hash = content_hash(&pages);

        // Chunk and embed off to the side; the store is untouched until
        // the swap below.
        let outcome = self.chunk_and_check(&pages)?;
        let chunks = self.embed_chunks(source_id, &outcome, cancel).await?;

        self.store
            .replace_source(
                source_id,
                hash,
                pages.len(),
                chunks,
                outcome.is_truncated,
                outcome.coverage_percent,
            )
            .await?;
        self.require_source(source_id).await
    }

    /// Delete a source and all its chunks. Returns the chunk count removed.
    pub async fn delete(&self, source_id: SourceId) -> Result<usize> {
        self.store.delete_source(source_id).await
    }

    async fn run_attempt(
        &self,
        id: SourceId,
        pages: &[String],
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.store.transition(id, ProcessingState::Extracting).await?;
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        self.store.transition(id, ProcessingState::Chunking).await?;
        let outcome = self.chunk_and_check(pages)?;

        self.store.transition(id, ProcessingState::Embedding).await?;
        let chunks = self.embed_chunks(id, &outcome, cancel).await?;

        self.store.insert_chunks(id, chunks).await?;
        self.store
            .complete_source(id, outcome.is_truncated, outcome.coverage_percent)
            .await?;
        Ok(())
    }

    fn chunk_and_check(&self, pages: &[String]) -> Result<ChunkingOutcome> {
        let outcome = self.chunker.chunk_pages(pages);
        if outcome.chunks.is_empty() {
            return Err(EngineError::BadInput(
                "no chunks produced from source pages".to_string(),
            ));
        }
        if outcome.is_truncated {
            warn!(
                chunks = outcome.chunks.len(),
                coverage = outcome.coverage_percent,
                "source truncated at chunk cap"
            );
        }
        Ok(outcome)
    }

    async fn embed_chunks(
        &self,
        source_id: SourceId,
        outcome: &ChunkingOutcome,
        cancel: &CancellationToken,
    ) -> Result<Vec<Chunk>> {
        let texts: Vec<String> = outcome.chunks.iter().map(|c| c.content.clone()).collect();
        let vectors = self.embedder.embed_batch(&texts, cancel).await?;

        // embed_batch preserves order and aborts on any failure, so the
        // zip below is total.
        Ok(outcome
            .chunks
            .iter()
            .zip(vectors)
            .enumerate()
            .map(|(ordinal, (chunk, embedding))| Chunk {
                source_id,
                ordinal,
                page: chunk.page,
                section: chunk.section.clone(),
                text: chunk.content.clone(),
                embedding,
            })
            .collect())
    }

    async fn require_source(&self, id: SourceId) -> Result<Source> {
        self.store
            .get_source(id)
            .await?
            .ok_or_else(|| EngineError::StoreUnavailable(format!("unknown source {}", id)))
    }
}

fn validate_input(descriptor: &SourceDescriptor, pages: &[String]) -> Result<()> {
    if descriptor.name.trim().is_empty() {
        return Err(EngineError::BadInput("source name is empty".to_string()));
    }
    if pages.is_empty() || pages.iter().all(|p| p.trim().is_empty()) {
        return Err(EngineError::BadInput(format!(
            "source '{}' has no page text",
            descriptor.name
        )));
    }
    Ok(())
}

/// SHA-256 over page texts, with a separator so page splits are part of
/// the identity.
fn content_hash(pages: &[String]) -> String {
    let mut hasher = Sha256::new();
    for page in pages {
        hasher.update(page.as_bytes());
        hasher.update([0x1f]);
    }
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// Tests
// ============================================================================
