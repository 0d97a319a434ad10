//! The engine: per-request pipeline assembly over shared components.
//!
//! A query runs the stages in order: query processing → dense retrieval →
//! lexical scoring → fusion → deduplication → reranking → MMR → abstain
//! gate → context assembly → prompt → generation → cleanup. Stage depth
//! and aggressiveness come from the request's pipeline profile, resolved
//! to a parameter record; there is one pipeline, not one engine variant
//! per profile.
//!
//! Failure policy: retrieval-side degradations (lexical scoring down,
//! cross-encoder missing) are noted in the stats and the pipeline
//! continues; embedding failures and cancellation surface as errors;
//! generation failures return the retrieval results with an error code.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::answer::{
    build_prompt, clean_response, AbstainGate, ContextOptimizer, NOT_AVAILABLE_MESSAGE,
};
use crate::cache::{hash_key, CacheLayer, CacheStats};
use crate::config::{EngineConfig, ProfileParams};
use crate::embedding::EmbeddingClient;
use crate::generate::GeneratorClient;
use crate::ingest::{Ingestor, SourceDescriptor};
use crate::query::QueryProcessor;
use crate::rerank::{CrossEncoder, Reranker};
use crate::search::{
    bm25::tokenize, dedup, rrf_fuse, weighted_fuse, Bm25Scorer, CorpusStats, DenseRetriever,
    MmrSelector,
};
use crate::store::{ChunkStore, MemoryChunkStore};
use crate::types::{
    Answer, EngineError, MetadataFilters, PipelineProfile, QueryContext, RankedResult, Result,
    SearchStats, Source, SourceId, SourceRef,
};

// ============================================================================
// Request Types
// ============================================================================

/// A query request.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    /// The natural-language query.
    pub text: String,
    /// Override the profile's result count.
    pub top_k: Option<usize>,
    /// Caller-supplied metadata filters; merged over extracted ones.
    pub filters: MetadataFilters,
    /// Pipeline profile.
    pub profile: PipelineProfile,
    /// Drop dense candidates below this similarity.
    pub similarity_threshold: Option<f32>,
}

impl QueryRequest {
    /// A request with defaults for everything but the text.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            top_k: None,
            filters: MetadataFilters::default(),
            profile: PipelineProfile::default(),
            similarity_threshold: None,
        }
    }

    /// Set the pipeline profile.
    pub fn with_profile(mut self, profile: PipelineProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Set the result count.
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    /// Set caller filters.
    pub fn with_filters(mut self, filters: MetadataFilters) -> Self {
        self.filters = filters;
        self
    }
}

// ============================================================================
// Analytics
// ============================================================================

/// Engine-lifetime counters.
#[derive(Debug, Default)]
struct Counters {
    queries: AtomicU64,
    abstains: AtomicU64,
    search_cache_hits: AtomicU64,
    degraded_generations: AtomicU64,
    ingests: AtomicU64,
}

/// Snapshot of engine analytics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineAnalytics {
    /// Queries served.
    pub queries: u64,
    /// Queries that abstained.
    pub abstains: u64,
    /// Queries answered from the search cache.
    pub search_cache_hits: u64,
    /// Queries whose generation step failed after retrieval succeeded.
    pub degraded_generations: u64,
    /// Sources ingested (including refreshes).
    pub ingests: u64,
    /// Embedding cache statistics.
    pub embedding_cache: CacheStats,
    /// Search cache statistics.
    pub search_cache: CacheStats,
    /// Response cache statistics.
    pub response_cache: CacheStats,
}

// ============================================================================
// Engine
// ============================================================================

/// Document-grounded question answering engine.
pub struct Engine {
    config: EngineConfig,
    caches: CacheLayer,
    store: Arc<dyn ChunkStore>,
    processor: QueryProcessor,
    retriever: DenseRetriever,
    corpus: CorpusStats,
    bm25: Bm25Scorer,
    reranker: Reranker,
    generator: GeneratorClient,
    ingestor: Ingestor,
    counters: Counters,
}

impl Engine {
    /// Build an engine with the default in-memory chunk store.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let dimension = config.embedding.dimension;
        Self::with_store(config, Arc::new(MemoryChunkStore::new(dimension)))
    }

    /// Build an engine over a caller-provided chunk store.
    pub fn with_store(config: EngineConfig, store: Arc<dyn ChunkStore>) -> Result<Self> {
        let caches = CacheLayer::new(&config.cache);

        let embedder = Arc::new(EmbeddingClient::new(
            &config.services.embedding_url,
            &config.services.embedding_model,
            config.embedding.clone(),
            Arc::clone(&caches.embedding),
        )?);

        let generator = GeneratorClient::new(
            &config.services.generator_url,
            &config.services.generator_model,
            config.generator.clone(),
            Arc::clone(&caches.response),
        )?;

        let ingestor = Ingestor::new(
            Arc::clone(&store),
            Arc::clone(&embedder),
            crate::ingest::chunker::SemanticChunker::new(config.chunking.clone()),
            config.ingest.clone(),
        );

        Ok(Self {
            processor: QueryProcessor::default(),
            retriever: DenseRetriever::new(Arc::clone(&store), Arc::clone(&embedder)),
            corpus: CorpusStats::new(Arc::clone(&store), &config.bm25),
            bm25: Bm25Scorer::new(&config.bm25),
            reranker: Reranker::new(None, config.rerank.clone()),
            generator,
            ingestor,
            caches,
            store,
            counters: Counters::default(),
            config,
        })
    }

    /// Attach a cross-encoder model for the primary rerank path.
    pub fn with_cross_encoder(mut self, encoder: Arc<dyn CrossEncoder>) -> Self {
        self.reranker = Reranker::new(Some(encoder), self.config.rerank.clone());
        self
    }

    // ============== Ingest API ==============

    /// Ingest a source from ordered page texts.
    pub async fn ingest(
        &self,
        descriptor: SourceDescriptor,
        pages: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<Source> {
        let fut: std::pin::Pin<Box<dyn std::future::Future<Output = Result<Source>> + Send + '_>> =
            Box::pin(self.ingestor.ingest(descriptor, pages, cancel));
        let source: Source = fut.await?;
        self.counters.ingests.fetch_add(1, Ordering::Relaxed);
        self.index_changed();
        Ok(source)
    }

    /// Re-ingest a source from new page texts, atomically replacing its
    /// chunks.
    pub async fn refresh(
        &self,
        source_id: SourceId,
        pages: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<Source> {
        let source = self.ingestor.refresh(source_id, pages, cancel).await?;
        self.counters.ingests.fetch_add(1, Ordering::Relaxed);
        self.index_changed();
        Ok(source)
    }

    /// Delete a source and its chunks.
    pub async fn delete(&self, source_id: SourceId) -> Result<usize> {
        let removed = self.ingestor.delete(source_id).await?;
        self.index_changed();
        Ok(removed)
    }

    /// List all sources with their processing state.
    pub async fn sources(&self) -> Result<Vec<Source>> {
        self.store.list_sources().await
    }

    /// The index changed: corpus statistics and cached rankings are stale.
    fn index_changed(&self) {
        self.corpus.invalidate();
        self.caches.search.clear();
        self.caches.response.clear();
    }

    // ============== Query API ==============

    /// Answer a query: retrieve, rank, gate, and (unless abstaining)
    /// generate grounded answer text.
    pub async fn query(&self, request: QueryRequest, cancel: &CancellationToken) -> Result<Answer> {
        if request.text.trim().is_empty() {
            return Err(EngineError::BadInput("query is empty".to_string()));
        }
        self.counters.queries.fetch_add(1, Ordering::Relaxed);

        let params = self.config.profile(request.profile);
        let top_k = request.top_k.unwrap_or(params.top_k);
        let context = self
            .processor
            .process(request.text.trim(), request.filters.clone());

        let started = Instant::now();
        let cache_key = self.search_cache_key(&context, top_k, &request);
        let (results, mut stats) = match self.caches.search.get(&cache_key) {
            Some(cached) => {
                self.counters.search_cache_hits.fetch_add(1, Ordering::Relaxed);
                debug!("ranked results served from search cache");
                let stats = SearchStats {
                    candidates_considered: cached.len(),
                    results_returned: cached.len(),
                    query_type: context.query_type,
                    profile: request.profile,
                    expansion_applied: context.expansion_applied,
                    cache_hit: true,
                    duration_ms: started.elapsed().as_millis() as u64,
                    degraded: None,
                };
                (cached, stats)
            }
            None => {
                let (results, stats) = self
                    .retrieve_and_rank(&context, &params, top_k, &request, cancel)
                    .await?;
                if !cancel.is_cancelled() {
                    self.caches.search.insert(&cache_key, results.clone());
                }
                (results, stats)
            }
        };

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        // Abstain gate. The fused-score scale reflects the fusion mode
        // this profile runs: the weighted sum stays on a [0, 1] scale,
        // two-ranking RRF tops out at 2/(k+1).
        let fused_scale = if params.use_hybrid && !self.config.fusion.weighted_fallback {
            2.0 / (self.config.fusion.rrf_k + 1.0)
        } else {
            1.0
        };
        let gate = AbstainGate::new(&self.config.abstain, params.min_similarity, fused_scale);
        if let Some(reason) = gate.evaluate(&results) {
            self.counters.abstains.fetch_add(1, Ordering::Relaxed);
            info!(reason = %reason, "abstaining");
            let clarification = gate.clarification(&context.raw, &reason);
            return Ok(Answer {
                text: String::new(),
                sources: source_refs(&results),
                stats,
                abstained: true,
                clarification: Some(clarification),
                error: None,
            });
        }

        // Context assembly and generation.
        let assembled = ContextOptimizer::new(params.context_budget).assemble(&results);
        if assembled.text.is_empty() {
            return Ok(Answer {
                text: NOT_AVAILABLE_MESSAGE.to_string(),
                sources: source_refs(&results),
                stats,
                abstained: false,
                clarification: None,
                error: None,
            });
        }

        let prompt = build_prompt(
            &context.raw,
            &assembled,
            context.query_type,
            params.profile == PipelineProfile::Comprehensive,
        );

        match self
            .generator
            .generate(&prompt, context.query_type, &params, cancel)
            .await
        {
            Ok(raw) => Ok(Answer {
                text: clean_response(&raw),
                sources: source_refs(&results),
                stats,
                abstained: false,
                clarification: None,
                error: None,
            }),
            Err(EngineError::Cancelled) => Err(EngineError::Cancelled),
            Err(e) => {
                // Retrieval stands; only the generation portion degraded.
                self.counters
                    .degraded_generations
                    .fetch_add(1, Ordering::Relaxed);
                stats.degraded = Some(match &stats.degraded {
                    Some(existing) => format!("{}; {}", existing, e.code()),
                    None => e.code().to_string(),
                });
                Ok(Answer {
                    text: String::new(),
                    sources: source_refs(&results),
                    stats,
                    abstained: false,
                    clarification: None,
                    error: Some(e.code().to_string()),
                })
            }
        }
    }

    /// Current analytics snapshot.
    pub fn analytics(&self) -> EngineAnalytics {
        EngineAnalytics {
            queries: self.counters.queries.load(Ordering::Relaxed),
            abstains: self.counters.abstains.load(Ordering::Relaxed),
            search_cache_hits: self.counters.search_cache_hits.load(Ordering::Relaxed),
            degraded_generations: self.counters.degraded_generations.load(Ordering::Relaxed),
            ingests: self.counters.ingests.load(Ordering::Relaxed),
            embedding_cache: self.caches.embedding.stats(),
            search_cache: self.caches.search.stats(),
            response_cache: self.caches.response.stats(),
        }
    }

    // ============== Pipeline ==============

    async fn retrieve_and_rank(
        &self,
        context: &QueryContext,
        params: &ProfileParams,
        top_k: usize,
        request: &QueryRequest,
        cancel: &CancellationToken,
    ) -> Result<(Vec<RankedResult>, SearchStats)> {
        let started = Instant::now();
        let threshold = request.similarity_threshold.unwrap_or(0.0);
        let mut degraded: Vec<String> = Vec::new();

        // Stage 1: dense candidates.
        let mut candidates = self
            .retriever
            .retrieve(context, params.candidates, threshold, cancel)
            .await?;
        let candidates_considered = candidates.len();

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        // Stage 2: lexical scoring over the candidate set.
        let mut lexical_usable = false;
        if params.use_hybrid && candidates.len() > 1 {
            match self.corpus.snapshot().await {
                Ok(snapshot) => {
                    let query_terms = tokenize(context.search_text());
                    for candidate in &mut candidates {
                        candidate.lexical_score =
                            Some(self.bm25.score(&snapshot, &query_terms, &candidate.content));
                    }
                    lexical_usable = true;
                }
                Err(e) => {
                    debug!(error = %e, "corpus statistics unavailable, dense-only fusion");
                    degraded.push("lexical_unavailable".to_string());
                }
            }
        }

        // Stage 3: fusion. RRF is primary; the weighted sum runs when only
        // one ranking is usable or when configuration opts into it.
        let fusion = &self.config.fusion;
        let mut results = if lexical_usable && !fusion.weighted_fallback {
            rrf_fuse(candidates, fusion.rrf_k)
        } else {
            weighted_fuse(candidates, fusion.dense_weight, fusion.lexical_weight)
        };

        // Stage 4: deduplication.
        results = dedup::dedup_by_source(results, self.config.dedup.per_source_cap);
        results = dedup::dedup_by_content(results, self.config.dedup.overlap_threshold);

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        // Stage 5: rerank + composite scoring.
        let (results, rerank_note) = self
            .reranker
            .rerank(&context.normalized, results, params.use_rerank)
            .await;
        if let Some(note) = rerank_note {
            degraded.push(note);
        }

        // Stage 6: diversity selection.
        let selector = MmrSelector::new(&self.config.mmr);
        let selected = selector.select(results, top_k);

        let stats = SearchStats {
            candidates_considered,
            results_returned: selected.len(),
            query_type: context.query_type,
            profile: params.profile,
            expansion_applied: context.expansion_applied,
            cache_hit: false,
            duration_ms: started.elapsed().as_millis() as u64,
            degraded: (!degraded.is_empty()).then(|| degraded.join("; ")),
        };

        debug!(
            candidates = candidates_considered,
            returned = stats.results_returned,
            query_type = %stats.query_type,
            "retrieval pipeline complete"
        );
        Ok((selected, stats))
    }

    fn search_cache_key(
        &self,
        context: &QueryContext,
        top_k: usize,
        request: &QueryRequest,
    ) -> String {
        let filters =
            serde_json::to_string(&context.filters).unwrap_or_else(|_| String::from("{}"));
        hash_key(&[
            &context.normalized,
            &top_k.to_string(),
            &request.profile.to_string(),
            &filters,
            &request
                .similarity_threshold
                .map(|t| t.to_string())
                .unwrap_or_default(),
        ])
    }
}

fn source_refs(results: &[RankedResult]) -> Vec<SourceRef> {
    results
        .iter()
        .map(|r| SourceRef {
            source_id: r.source_id,
            name: r.source_name.clone(),
            page: r.page,
            chunk_id: r.chunk_id,
            score: r.relevance(),
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
