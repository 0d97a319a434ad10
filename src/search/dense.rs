//! Dense retrieval: query embedding plus k-NN over the chunk store.
//!
//! The retriever embeds the expanded query form when expansion was
//! applied, falling back to the normalized form when the expanded search
//! comes back empty. Metadata filters from the query context are applied
//! in two layers: structural predicates (source ids, kinds) go to the
//! store, while version and document-type hints are matched post-search
//! against chunk text and source names.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::embedding::EmbeddingClient;
use crate::store::{ChunkFilter, ChunkStore, ScoredChunk};
use crate::types::{MetadataFilters, QueryContext, RankedResult, Result};

/// Initial candidate pool retriever.
pub struct DenseRetriever {
    store: Arc<dyn ChunkStore>,
    embedder: Arc<EmbeddingClient>,
}

impl DenseRetriever {
    /// Create a retriever over the given store and embedding client.
    pub fn new(store: Arc<dyn ChunkStore>, embedder: Arc<EmbeddingClient>) -> Self {
        Self { store, embedder }
    }

    /// Pull up to `candidates` chunks for the query, dense-scored and
    /// filtered. `threshold` drops the low-similarity tail.
    pub async fn retrieve(
        &self,
        context: &QueryContext,
        candidates: usize,
        threshold: f32,
        cancel: &CancellationToken,
    ) -> Result<Vec<RankedResult>> {
        let filter = store_filter(&context.filters);

        let mut scored = self
            .search(context.search_text(), candidates, &filter, cancel)
            .await?;

        // The expanded form occasionally matches nothing the raw query
        // would; retry with the normalized form before giving up.
        if scored.is_empty() && context.expanded.is_some() {
            debug!("expanded query matched nothing, retrying with normalized form");
            scored = self
                .search(&context.normalized, candidates, &filter, cancel)
                .await?;
        }

        let results: Vec<RankedResult> = scored
            .into_iter()
            .filter(|s| s.score >= threshold)
            .filter(|s| matches_metadata(s, &context.filters))
            .map(|s| RankedResult {
                chunk_id: s.chunk.id,
                source_id: s.chunk.source_id,
                source_name: s.chunk.source_name,
                page: s.chunk.page,
                content: s.chunk.text,
                dense_score: s.score,
                lexical_score: None,
                fused_score: None,
                rerank_score: None,
                final_score: None,
                query_type: Some(context.query_type),
            })
            .collect();

        debug!(count = results.len(), "dense retrieval complete");
        Ok(results)
    }

    async fn search(
        &self,
        text: &str,
        candidates: usize,
        filter: &ChunkFilter,
        cancel: &CancellationToken,
    ) -> Result<Vec<ScoredChunk>> {
        let vector = self.embedder.embed(text, cancel).await?;
        self.store.nearest(&vector, candidates, filter).await
    }
}

fn store_filter(filters: &MetadataFilters) -> ChunkFilter {
    ChunkFilter {
        source_ids: filters.source_ids.clone(),
        kinds: filters.kinds.clone(),
        ordinal_range: None,
    }
}

/// Version and document-type hints match against chunk text and source
/// name, case-insensitively.
fn matches_metadata(scored: &ScoredChunk, filters: &MetadataFilters) -> bool {
    if let Some(version) = &filters.version {
        let version = version.to_lowercase();
        let text = scored.chunk.text.to_lowercase();
        let name = scored.chunk.source_name.to_lowercase();
        if !text.contains(&version) && !name.contains(&version) {
            return false;
        }
    }

    if let Some(doc_type) = &filters.document_type {
        // `installation_guide` probes as "installation", `release_notes`
        // as "release notes".
        let probe = doc_type.trim_end_matches("_guide").replace('_', " ");
        let text = scored.chunk.text.to_lowercase();
        let name = scored.chunk.source_name.to_lowercase();
        if !text.contains(&probe) && !name.contains(&probe) {
            return false;
        }
    }

    true
}

// ============================================================================
// Tests
// ============================================================================
