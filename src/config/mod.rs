//! Engine configuration.
//!
//! All tunables live in one immutable [`EngineConfig`] loaded from a TOML
//! file (`quarry.toml`) with serde defaults, so an empty file is a valid
//! configuration. The struct is built once and handed to the engine;
//! mid-pipeline overrides are not permitted. Per-profile differences
//! (candidate depth, context budget, rerank aggressiveness) are expressed
//! as a [`ProfileParams`] record resolved from the profile tag, not as
//! separate engine variants.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::types::{EngineError, PipelineProfile, QueryType, Result};

/// Root configuration structure loaded from quarry.toml.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Outbound service endpoints (embedding, generator).
    #[serde(default)]
    pub services: ServicesConfig,

    /// Chunking parameters for ingest.
    #[serde(default)]
    pub chunking: ChunkingConfig,

    /// Embedding client parameters.
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Ingest retry policy.
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Cache TTLs per scope.
    #[serde(default)]
    pub cache: CacheConfig,

    /// BM25 parameters and corpus statistics TTL.
    #[serde(default)]
    pub bm25: Bm25Config,

    /// Rank fusion parameters.
    #[serde(default)]
    pub fusion: FusionConfig,

    /// Deduplication parameters.
    #[serde(default)]
    pub dedup: DedupConfig,

    /// MMR diversity selection parameters.
    #[serde(default)]
    pub mmr: MmrConfig,

    /// Abstain gate thresholds.
    #[serde(default)]
    pub abstain: AbstainConfig,

    /// Reranker and composite scoring parameters.
    #[serde(default)]
    pub rerank: RerankConfig,

    /// Context assembly budgets.
    #[serde(default)]
    pub context: ContextConfig,

    /// Generator client parameters.
    #[serde(default)]
    pub generator: GeneratorConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            EngineError::BadInput(format!(
                "failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| EngineError::BadInput(format!("invalid config: {}", e)))
    }

    /// Resolve the parameter record for a pipeline profile.
    pub fn profile(&self, profile: PipelineProfile) -> ProfileParams {
        let response_ttl = match profile {
            PipelineProfile::Comprehensive => {
                Duration::from_secs(self.cache.comprehensive_response_ttl_secs)
            }
            _ => Duration::from_secs(self.cache.response_ttl_secs),
        };
        let generator_timeout = match profile {
            PipelineProfile::Comprehensive => {
                Duration::from_secs(self.generator.comprehensive_timeout_secs)
            }
            _ => Duration::from_secs(self.generator.timeout_secs),
        };
        match profile {
            PipelineProfile::Baseline => ProfileParams {
                profile,
                top_k: 8,
                candidates: 20,
                context_budget: self.context.standard_budget,
                min_similarity: self.abstain.min_similarity,
                use_hybrid: false,
                use_rerank: false,
                response_ttl,
                generator_timeout,
            },
            PipelineProfile::Enhanced => ProfileParams {
                profile,
                top_k: 8,
                candidates: 20,
                context_budget: self.context.standard_budget,
                min_similarity: self.abstain.min_similarity,
                use_hybrid: true,
                use_rerank: false,
                response_ttl,
                generator_timeout,
            },
            PipelineProfile::Advanced => ProfileParams {
                profile,
                top_k: 8,
                candidates: 30,
                context_budget: self.context.standard_budget,
                min_similarity: self.abstain.min_similarity,
                use_hybrid: true,
                use_rerank: true,
                response_ttl,
                generator_timeout,
            },
            PipelineProfile::Comprehensive => ProfileParams {
                profile,
                top_k: 20,
                candidates: 60,
                context_budget: self.context.comprehensive_budget,
                min_similarity: self.abstain.comprehensive_min_similarity,
                use_hybrid: true,
                use_rerank: true,
                response_ttl,
                generator_timeout,
            },
        }
    }
}

// ============= Services =============

/// Outbound service endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesConfig {
    /// Base URL of the embedding service.
    #[serde(default = "default_service_url")]
    pub embedding_url: String,
    /// Embedding model identifier. There is no fallback model; quality
    /// requires a single canonical model.
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    /// Base URL of the generator (chat) service.
    #[serde(default = "default_service_url")]
    pub generator_url: String,
    /// Generator model identifier.
    #[serde(default = "default_generator_model")]
    pub generator_model: String,
}

fn default_service_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_embedding_model() -> String {
    "bge-m3".to_string()
}

fn default_generator_model() -> String {
    "llama3.1:8b".to_string()
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            embedding_url: default_service_url(),
            embedding_model: default_embedding_model(),
            generator_url: default_service_url(),
            generator_model: default_generator_model(),
        }
    }
}

// ============= Chunking =============

/// Chunking parameters for ingest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Target chunk size in characters.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Overlap between adjacent chunks in characters.
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    /// Hard cap on chunks per source; overflow marks the source truncated.
    #[serde(default = "default_max_chunks_per_source")]
    pub max_chunks_per_source: usize,
    /// Emit definition micro-chunks for acronyms and "X is ..." sentences.
    #[serde(default = "default_true")]
    pub definition_microchunks: bool,
}

fn default_chunk_size() -> usize {
    600
}

fn default_chunk_overlap() -> usize {
    120
}

fn default_max_chunks_per_source() -> usize {
    2000
}

fn default_true() -> bool {
    true
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            max_chunks_per_source: default_max_chunks_per_source(),
            definition_microchunks: true,
        }
    }
}

// ============= Embedding =============

/// Embedding client parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Fixed embedding dimension D. Short vectors are zero-padded and long
    /// vectors truncated to this, both logged.
    #[serde(default = "default_embedding_dim")]
    pub dimension: usize,
    /// Concurrent outbound requests for batch misses.
    #[serde(default = "default_embedding_concurrency")]
    pub concurrency: usize,
    /// Texts per outbound batch.
    #[serde(default = "default_embedding_batch_size")]
    pub batch_size: usize,
    /// Retries per text before surfacing `EmbeddingUnavailable`.
    #[serde(default = "default_embedding_retries")]
    pub retries: u32,
    /// Per-call timeout in seconds.
    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_embedding_dim() -> usize {
    1024
}

fn default_embedding_concurrency() -> usize {
    10
}

fn default_embedding_batch_size() -> usize {
    50
}

fn default_embedding_retries() -> u32 {
    3
}

fn default_embedding_timeout_secs() -> u64 {
    15
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            dimension: default_embedding_dim(),
            concurrency: default_embedding_concurrency(),
            batch_size: default_embedding_batch_size(),
            retries: default_embedding_retries(),
            timeout_secs: default_embedding_timeout_secs(),
        }
    }
}

// ============= Ingest =============

/// Whole-source ingest retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Attempts per source before marking it failed.
    #[serde(default = "default_ingest_attempts")]
    pub max_attempts: u32,
}

fn default_ingest_attempts() -> u32 {
    3
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_ingest_attempts(),
        }
    }
}

// ============= Cache =============

/// TTLs for the cache scopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Whether caching is enabled at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Embedding cache TTL in seconds.
    #[serde(default = "default_embedding_ttl")]
    pub embedding_ttl_secs: u64,
    /// Ranked-results cache TTL in seconds.
    #[serde(default = "default_search_ttl")]
    pub search_ttl_secs: u64,
    /// Response cache TTL in seconds.
    #[serde(default = "default_response_ttl")]
    pub response_ttl_secs: u64,
    /// Response cache TTL for the comprehensive profile, in seconds.
    #[serde(default = "default_comprehensive_response_ttl")]
    pub comprehensive_response_ttl_secs: u64,
}

fn default_embedding_ttl() -> u64 {
    86_400
}

fn default_search_ttl() -> u64 {
    3_600
}

fn default_response_ttl() -> u64 {
    1_800
}

fn default_comprehensive_response_ttl() -> u64 {
    7_200
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            embedding_ttl_secs: default_embedding_ttl(),
            search_ttl_secs: default_search_ttl(),
            response_ttl_secs: default_response_ttl(),
            comprehensive_response_ttl_secs: default_comprehensive_response_ttl(),
        }
    }
}

// ============= BM25 =============

/// BM25 parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bm25Config {
    /// Term frequency saturation parameter.
    #[serde(default = "default_bm25_k1")]
    pub k1: f32,
    /// Length normalization parameter.
    #[serde(default = "default_bm25_b")]
    pub b: f32,
    /// Corpus statistics snapshot TTL in seconds.
    #[serde(default = "default_search_ttl")]
    pub stats_ttl_secs: u64,
}

fn default_bm25_k1() -> f32 {
    1.5
}

fn default_bm25_b() -> f32 {
    0.75
}

impl Default for Bm25Config {
    fn default() -> Self {
        Self {
            k1: default_bm25_k1(),
            b: default_bm25_b(),
            stats_ttl_secs: default_search_ttl(),
        }
    }
}

// ============= Fusion =============

/// Rank fusion parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionConfig {
    /// RRF constant.
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f32,
    /// Dense weight for the weighted-sum fallback.
    #[serde(default = "default_dense_weight")]
    pub dense_weight: f32,
    /// Lexical weight for the weighted-sum fallback.
    #[serde(default = "default_lexical_weight")]
    pub lexical_weight: f32,
    /// Force the weighted-sum combination instead of RRF. Off by default;
    /// callers depending on weighted-sum-only behavior must opt in.
    #[serde(default)]
    pub weighted_fallback: bool,
}

fn default_rrf_k() -> f32 {
    60.0
}

fn default_dense_weight() -> f32 {
    0.7
}

fn default_lexical_weight() -> f32 {
    0.3
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            rrf_k: default_rrf_k(),
            dense_weight: default_dense_weight(),
            lexical_weight: default_lexical_weight(),
            weighted_fallback: false,
        }
    }
}

// ============= Dedup =============

/// Deduplication parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Maximum surviving chunks per source.
    #[serde(default = "default_per_source_cap")]
    pub per_source_cap: usize,
    /// Jaccard overlap above which a chunk is dropped as a duplicate.
    #[serde(default = "default_overlap_threshold")]
    pub overlap_threshold: f32,
}

fn default_per_source_cap() -> usize {
    3
}

fn default_overlap_threshold() -> f32 {
    0.85
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            per_source_cap: default_per_source_cap(),
            overlap_threshold: default_overlap_threshold(),
        }
    }
}

// ============= MMR =============

/// MMR diversity selection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MmrConfig {
    /// Relevance/diversity trade-off; 1.0 is pure relevance.
    #[serde(default = "default_mmr_lambda")]
    pub lambda: f32,
}

fn default_mmr_lambda() -> f32 {
    0.6
}

impl Default for MmrConfig {
    fn default() -> Self {
        Self {
            lambda: default_mmr_lambda(),
        }
    }
}

// ============= Abstain =============

/// Abstain gate thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbstainConfig {
    /// Minimum mean composite score.
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f32,
    /// Minimum mean composite score for the comprehensive profile.
    #[serde(default = "default_comprehensive_min_similarity")]
    pub comprehensive_min_similarity: f32,
    /// Minimum number of results.
    #[serde(default = "default_min_results")]
    pub min_results: usize,
    /// Minimum mean fused score.
    #[serde(default = "default_min_hybrid")]
    pub min_hybrid: f32,
}

fn default_min_similarity() -> f32 {
    0.3
}

fn default_comprehensive_min_similarity() -> f32 {
    0.2
}

fn default_min_results() -> usize {
    1
}

fn default_min_hybrid() -> f32 {
    0.2
}

impl Default for AbstainConfig {
    fn default() -> Self {
        Self {
            min_similarity: default_min_similarity(),
            comprehensive_min_similarity: default_comprehensive_min_similarity(),
            min_results: default_min_results(),
            min_hybrid: default_min_hybrid(),
        }
    }
}

// ============= Rerank =============

/// Composite score weights. Should sum to 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeWeights {
    /// Weight of the fused (hybrid) score.
    #[serde(default = "default_weight_fused")]
    pub fused: f32,
    /// Weight of the reranker score.
    #[serde(default = "default_weight_rerank")]
    pub rerank: f32,
    /// Weight of the freshness signal.
    #[serde(default = "default_weight_tenth")]
    pub freshness: f32,
    /// Weight of the content quality signal.
    #[serde(default = "default_weight_tenth")]
    pub quality: f32,
    /// Weight of the user feedback signal.
    #[serde(default = "default_weight_tenth")]
    pub feedback: f32,
}

fn default_weight_fused() -> f32 {
    0.4
}

fn default_weight_rerank() -> f32 {
    0.3
}

fn default_weight_tenth() -> f32 {
    0.1
}

impl Default for CompositeWeights {
    fn default() -> Self {
        Self {
            fused: default_weight_fused(),
            rerank: default_weight_rerank(),
            freshness: default_weight_tenth(),
            quality: default_weight_tenth(),
            feedback: default_weight_tenth(),
        }
    }
}

/// Reranker parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankConfig {
    /// Composite score weights.
    #[serde(default)]
    pub weights: CompositeWeights,
    /// Chunk text is truncated to this many characters before cross-encoder
    /// scoring.
    #[serde(default = "default_rerank_chunk_chars")]
    pub max_chunk_chars: usize,
}

fn default_rerank_chunk_chars() -> usize {
    512
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            weights: CompositeWeights::default(),
            max_chunk_chars: default_rerank_chunk_chars(),
        }
    }
}

// ============= Context =============

/// Context assembly budgets, in characters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Budget for the standard profiles.
    #[serde(default = "default_standard_budget")]
    pub standard_budget: usize,
    /// Budget for the comprehensive profile.
    #[serde(default = "default_comprehensive_budget")]
    pub comprehensive_budget: usize,
}

fn default_standard_budget() -> usize {
    4_000
}

fn default_comprehensive_budget() -> usize {
    12_000
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            standard_budget: default_standard_budget(),
            comprehensive_budget: default_comprehensive_budget(),
        }
    }
}

// ============= Generator =============

/// Sampling parameters for one generator call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Maximum tokens to generate.
    pub num_predict: i32,
    /// Sampling temperature.
    pub temperature: f32,
    /// Nucleus sampling cutoff.
    pub top_p: f32,
    /// Top-k sampling cutoff.
    pub top_k: i32,
    /// Repetition penalty.
    pub repeat_penalty: f32,
    /// Context window size.
    pub num_ctx: i32,
}

/// Generator client parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Request timeout in seconds.
    #[serde(default = "default_generator_timeout")]
    pub timeout_secs: u64,
    /// Request timeout for the comprehensive profile, in seconds.
    #[serde(default = "default_comprehensive_generator_timeout")]
    pub comprehensive_timeout_secs: u64,
}

fn default_generator_timeout() -> u64 {
    120
}

fn default_comprehensive_generator_timeout() -> u64 {
    300
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_generator_timeout(),
            comprehensive_timeout_secs: default_comprehensive_generator_timeout(),
        }
    }
}

impl GeneratorConfig {
    /// Sampling parameters for a query type. Troubleshooting, procedural
    /// and locational queries run tight sampling; general queries get a
    /// slightly broader distribution. Comprehensive runs raise the output
    /// and context budgets.
    pub fn sampling_for(&self, query_type: QueryType, comprehensive: bool) -> SamplingParams {
        let mut params = match query_type {
            QueryType::Procedural => SamplingParams {
                num_predict: 1200,
                temperature: 0.1,
                top_p: 0.8,
                top_k: 40,
                repeat_penalty: 1.2,
                num_ctx: 4096,
            },
            QueryType::Definitional => SamplingParams {
                num_predict: 800,
                temperature: 0.15,
                top_p: 0.85,
                top_k: 40,
                repeat_penalty: 1.15,
                num_ctx: 4096,
            },
            QueryType::Troubleshooting => SamplingParams {
                num_predict: 1000,
                temperature: 0.1,
                top_p: 0.8,
                top_k: 40,
                repeat_penalty: 1.25,
                num_ctx: 4096,
            },
            QueryType::Locational => SamplingParams {
                num_predict: 600,
                temperature: 0.05,
                top_p: 0.75,
                top_k: 40,
                repeat_penalty: 1.1,
                num_ctx: 4096,
            },
            QueryType::General => SamplingParams {
                num_predict: 1024,
                temperature: 0.2,
                top_p: 0.9,
                top_k: 40,
                repeat_penalty: 1.1,
                num_ctx: 4096,
            },
        };
        if comprehensive {
            params.num_predict = 3000;
            params.num_ctx = 16_384;
        }
        params
    }
}

// ============= Profile Resolution =============

/// Resolved per-request parameters for a pipeline profile.
#[derive(Debug, Clone)]
pub struct ProfileParams {
    /// The profile tag this record was resolved from.
    pub profile: PipelineProfile,
    /// Results returned to the caller.
    pub top_k: usize,
    /// Dense candidate pool size.
    pub candidates: usize,
    /// Context assembly budget in characters.
    pub context_budget: usize,
    /// Abstain gate mean-composite threshold.
    pub min_similarity: f32,
    /// Whether lexical scoring and fusion run.
    pub use_hybrid: bool,
    /// Whether the cross-encoder path may run (the rule fallback always
    /// may).
    pub use_rerank: bool,
    /// Response cache TTL.
    pub response_ttl: Duration,
    /// Generator request timeout.
    pub generator_timeout: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_is_valid() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config.chunking.chunk_size, 600);
        assert_eq!(config.chunking.chunk_overlap, 120);
        assert_eq!(config.embedding.dimension, 1024);
        assert_eq!(config.embedding.concurrency, 10);
        assert_eq!(config.embedding.batch_size, 50);
        assert_eq!(config.fusion.rrf_k, 60.0);
        assert_eq!(config.bm25.k1, 1.5);
        assert_eq!(config.bm25.b, 0.75);
        assert_eq!(config.dedup.per_source_cap, 3);
        assert_eq!(config.mmr.lambda, 0.6);
        assert_eq!(config.cache.embedding_ttl_secs, 86_400);
    }

    #[test]
    fn test_partial_toml_overrides() {
        let config = EngineConfig::from_toml_str(
            r#"
            [chunking]
            chunk_size = 400

            [services]
            embedding_model = "mxbai-embed-large"
            "#,
        )
        .unwrap();
        assert_eq!(config.chunking.chunk_size, 400);
        assert_eq!(config.chunking.chunk_overlap, 120);
        assert_eq!(config.services.embedding_model, "mxbai-embed-large");
    }

    #[test]
    fn test_invalid_toml_is_bad_input() {
        let err = EngineConfig::from_toml_str("chunking = 3").unwrap_err();
        assert!(matches!(err, EngineError::BadInput(_)));
    }

    #[test]
    fn test_from_path_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quarry.toml");
        std::fs::write(&path, "[mmr]\nlambda = 0.7\n").unwrap();

        let config = EngineConfig::from_path(&path).unwrap();
        assert_eq!(config.mmr.lambda, 0.7);

        let err = EngineConfig::from_path(dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, EngineError::BadInput(_)));
    }

    #[test]
    fn test_profile_depths() {
        let config = EngineConfig::default();

        let baseline = config.profile(PipelineProfile::Baseline);
        assert_eq!((baseline.top_k, baseline.candidates), (8, 20));
        assert!(!baseline.use_hybrid);

        let advanced = config.profile(PipelineProfile::Advanced);
        assert_eq!((advanced.top_k, advanced.candidates), (8, 30));
        assert!(advanced.use_hybrid && advanced.use_rerank);

        let comprehensive = config.profile(PipelineProfile::Comprehensive);
        assert_eq!((comprehensive.top_k, comprehensive.candidates), (20, 60));
        assert_eq!(comprehensive.context_budget, 12_000);
        assert_eq!(comprehensive.min_similarity, 0.2);
        assert_eq!(comprehensive.generator_timeout, Duration::from_secs(300));
        assert_eq!(comprehensive.response_ttl, Duration::from_secs(7_200));
    }

    #[test]
    fn test_sampling_table() {
        let generator = GeneratorConfig::default();

        let procedural = generator.sampling_for(QueryType::Procedural, false);
        assert_eq!(procedural.num_predict, 1200);
        assert_eq!(procedural.temperature, 0.1);

        let locational = generator.sampling_for(QueryType::Locational, false);
        assert_eq!(locational.temperature, 0.05);
        assert_eq!(locational.top_p, 0.75);

        let general = generator.sampling_for(QueryType::General, false);
        assert!(general.temperature > procedural.temperature);

        let comprehensive = generator.sampling_for(QueryType::General, true);
        assert_eq!(comprehensive.num_predict, 3000);
        assert_eq!(comprehensive.num_ctx, 16_384);
    }

    #[test]
    fn test_composite_weights_sum_to_one() {
        let weights = CompositeWeights::default();
        let sum = weights.fused + weights.rerank + weights.freshness + weights.quality
            + weights.feedback;
        assert!((sum - 1.0).abs() < 1e-6);
    }
}
