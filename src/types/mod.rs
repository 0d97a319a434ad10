//! Core types used throughout the quarry engine.
//!
//! This module contains the common data structures used for:
//! - Sources and chunks (the ingested knowledge base)
//! - Query processing (query context, classification, filters)
//! - Ranked results with per-stage score fields
//! - Answers and search statistics
//! - Error handling

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier for an ingested source.
pub type SourceId = Uuid;

/// Identifier for a chunk. Assigned monotonically by the chunk store, so
/// ordering by id is ordering by insertion.
pub type ChunkId = u64;

// ============= Source Types =============

/// Where a source's text originally came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Uploaded file (PDF, text, ...).
    #[default]
    File,
    /// Web page or portal document.
    Web,
    /// Anything else handed to the ingest API.
    Other,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::File => "file",
            Self::Web => "web",
            Self::Other => "other",
        };
        write!(f, "{}", name)
    }
}

/// Processing state of a source.
///
/// Transitions are monotonic: `Pending → Extracting → Chunking → Embedding
/// → Ready`, with any state able to drop to `Failed`. Only `Ready` and
/// `Failed` are stable; the interior states are informational.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingState {
    /// Accepted but not yet started.
    #[default]
    Pending,
    /// Reading raw pages and recording the content hash.
    Extracting,
    /// Splitting pages into chunks.
    Chunking,
    /// Producing embeddings for the chunks.
    Embedding,
    /// All chunks persisted with embeddings; searchable.
    Ready,
    /// Terminal failure; see the source's error text.
    Failed,
}

impl ProcessingState {
    /// Whether this state allows chunk writes for the source.
    pub fn is_ingesting(&self) -> bool {
        matches!(self, Self::Extracting | Self::Chunking | Self::Embedding)
    }

    /// Whether this state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Failed)
    }
}

impl std::fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Extracting => "extracting",
            Self::Chunking => "chunking",
            Self::Embedding => "embedding",
            Self::Ready => "ready",
            Self::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// An ingested source and its processing bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    /// Unique identifier.
    pub id: SourceId,
    /// Display name (filename, page title, ...).
    pub name: String,
    /// Origin kind.
    pub kind: SourceKind,
    /// SHA-256 over the page texts; used for duplicate detection.
    pub hash: String,
    /// Number of pages handed to the ingestor.
    pub page_count: usize,
    /// Current processing state.
    pub state: ProcessingState,
    /// Number of chunks persisted for this source.
    pub chunk_count: usize,
    /// Number of embeddings persisted; equals `chunk_count` when ready.
    pub embedding_count: usize,
    /// Set when the per-source chunk cap truncated the document.
    pub is_truncated: bool,
    /// Percentage of the document covered by persisted chunks (0-100).
    pub coverage_percent: f32,
    /// Human-readable error text when `state == Failed`.
    pub error: Option<String>,
    /// When the source was first accepted.
    pub created_at: DateTime<Utc>,
    /// When the source last changed state.
    pub updated_at: DateTime<Utc>,
}

/// A chunk as produced by the ingestor, before it receives a store id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Owning source.
    pub source_id: SourceId,
    /// Position within the source; contiguous from 0.
    pub ordinal: usize,
    /// 1-based page number the chunk was extracted from.
    pub page: usize,
    /// Nearest preceding section header, when one was detected.
    pub section: Option<String>,
    /// Chunk text.
    pub text: String,
    /// Dense embedding of dimension D.
    pub embedding: Vec<f32>,
}

// ============= Query Types =============

/// Classified intent of a query. Drives prompt emphasis and generator
/// sampling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    /// "how to", "steps", "procedure" - wants ordered instructions.
    Procedural,
    /// "what is", "define" - wants a definition.
    Definitional,
    /// "error", "fix", "troubleshoot" - wants a diagnostic flow.
    Troubleshooting,
    /// "where", "find" - wants a location.
    Locational,
    /// Everything else.
    #[default]
    General,
}

impl QueryType {
    /// Stable lowercase name, used in cache keys and stats.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Procedural => "procedural",
            Self::Definitional => "definitional",
            Self::Troubleshooting => "troubleshooting",
            Self::Locational => "locational",
            Self::General => "general",
        }
    }
}

impl std::fmt::Display for QueryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Named pipeline configuration bundle selecting candidate depth, context
/// budget and rerank aggressiveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PipelineProfile {
    /// Dense-only retrieval, no reranking.
    Baseline,
    /// Hybrid retrieval with rule-based reranking.
    #[default]
    Enhanced,
    /// Hybrid retrieval, deeper candidate pool, full reranking.
    Advanced,
    /// Maximum recall and context budget for exhaustive answers.
    Comprehensive,
}

impl FromStr for PipelineProfile {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "baseline" | "basic" => Ok(Self::Baseline),
            "enhanced" | "improved" => Ok(Self::Enhanced),
            "advanced" => Ok(Self::Advanced),
            "comprehensive" | "deep" => Ok(Self::Comprehensive),
            _ => Err(EngineError::BadInput(format!(
                "unknown pipeline profile: {}. Use: baseline, enhanced, advanced, comprehensive",
                s
            ))),
        }
    }
}

impl std::fmt::Display for PipelineProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Baseline => "baseline",
            Self::Enhanced => "enhanced",
            Self::Advanced => "advanced",
            Self::Comprehensive => "comprehensive",
        };
        write!(f, "{}", name)
    }
}

/// Metadata filters applied during retrieval. May be extracted from the
/// query text or passed in by the caller; caller-supplied values win.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataFilters {
    /// Canonical version string (e.g. `v3.6`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Document type hint (e.g. `installation_guide`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_type: Option<String>,
    /// Restrict to these sources.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_ids: Option<Vec<SourceId>>,
    /// Restrict to these source kinds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<SourceKind>>,
}

impl MetadataFilters {
    /// True when no filter is set.
    pub fn is_empty(&self) -> bool {
        self.version.is_none()
            && self.document_type.is_none()
            && self.source_ids.is_none()
            && self.kinds.is_none()
    }
}

/// Immutable per-request view of a processed query.
#[derive(Debug, Clone)]
pub struct QueryContext {
    /// The query exactly as submitted.
    pub raw: String,
    /// After entity normalization (aliases, error codes, versions).
    pub normalized: String,
    /// Synonym-expanded form, when the expansion policy allowed it.
    pub expanded: Option<String>,
    /// Entities found during normalization, alias → canonical.
    pub entities: HashMap<String, String>,
    /// Classified intent.
    pub query_type: QueryType,
    /// Whether expansion was applied.
    pub expansion_applied: bool,
    /// Filters extracted from the query and/or supplied by the caller.
    pub filters: MetadataFilters,
}

impl QueryContext {
    /// The best form of the query for recall-oriented stages: the expanded
    /// form when present, the normalized form otherwise.
    pub fn search_text(&self) -> &str {
        self.expanded.as_deref().unwrap_or(&self.normalized)
    }
}

// ============= Result Types =============

/// A retrieval result with one score field per pipeline stage.
///
/// Each stage fills only its own field; earlier scores are never
/// overwritten. `dense_score` is set by the retriever, `lexical_score` by
/// the BM25 scorer, `fused_score` by rank fusion, `rerank_score` by the
/// reranker and `final_score` by the composite scorer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedResult {
    /// Chunk identifier in the store.
    pub chunk_id: ChunkId,
    /// Owning source.
    pub source_id: SourceId,
    /// Source display name.
    pub source_name: String,
    /// 1-based page number.
    pub page: usize,
    /// Chunk text.
    pub content: String,
    /// Cosine similarity between query and chunk embeddings, in [-1, 1].
    pub dense_score: f32,
    /// BM25 score, >= 0.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lexical_score: Option<f32>,
    /// Reciprocal rank fusion score.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fused_score: Option<f32>,
    /// Cross-encoder (or rule-based fallback) relevance.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f32>,
    /// Composite score; the final ordering key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_score: Option<f32>,
    /// Query type this result was ranked under.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_type: Option<QueryType>,
}

impl RankedResult {
    /// Best available relevance estimate: composite, then fused, then
    /// dense. Used by stages that run before the composite scorer and by
    /// the abstain gate.
    pub fn relevance(&self) -> f32 {
        self.final_score
            .or(self.fused_score)
            .unwrap_or(self.dense_score)
    }
}

/// Attribution entry for one passage used in an answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRef {
    /// Owning source.
    pub source_id: SourceId,
    /// Source display name.
    pub name: String,
    /// 1-based page number.
    pub page: usize,
    /// Chunk identifier.
    pub chunk_id: ChunkId,
    /// Relevance score shown to the caller.
    pub score: f32,
}

/// Statistics describing how a query was answered.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchStats {
    /// Candidates pulled by the dense retriever before filtering.
    pub candidates_considered: usize,
    /// Results that survived the full pipeline.
    pub results_returned: usize,
    /// Classified query type.
    pub query_type: QueryType,
    /// Pipeline profile used.
    pub profile: PipelineProfile,
    /// Whether synonym expansion was applied.
    pub expansion_applied: bool,
    /// Whether the ranked results came from the search cache.
    pub cache_hit: bool,
    /// Wall-clock time for the retrieval portion, in milliseconds.
    pub duration_ms: u64,
    /// Diagnostic note when a stage degraded (e.g. lexical scoring
    /// unavailable, fusion fell back to a weighted sum).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded: Option<String>,
}

/// The engine's reply to a query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    /// Generated answer text. Empty when the engine abstained or
    /// generation failed.
    pub text: String,
    /// Passages the answer is grounded in, in final rank order.
    pub sources: Vec<SourceRef>,
    /// Retrieval statistics; valid even when generation failed.
    pub stats: SearchStats,
    /// True when the abstain gate declined to answer.
    pub abstained: bool,
    /// Clarification prompt for the caller when abstaining.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clarification: Option<String>,
    /// Error code when the generation step failed after successful
    /// retrieval (e.g. `generation_unavailable`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ============= Error Types =============

/// Engine-wide error type.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Empty query, invalid filter, or malformed source descriptor.
    #[error("invalid input: {0}")]
    BadInput(String),

    /// Ingest of a source whose content hash is already ready.
    #[error("duplicate source: {0}")]
    Duplicate(String),

    /// Embedding with a non-finite component or an unrecoverable dimension.
    #[error("bad vector: {0}")]
    BadVector(String),

    /// Embedding service exhausted its retries.
    #[error("embedding service unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// Generator service failed.
    #[error("generation unavailable: {0}")]
    GenerationUnavailable(String),

    /// Chunk store read or write failed.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Recoverable internal condition (cache failure). Swallowed and
    /// logged inside the engine; never surfaced to callers.
    #[error("transient: {0}")]
    Transient(String),

    /// The request-wide cancellation token fired.
    #[error("request cancelled")]
    Cancelled,
}

impl EngineError {
    /// Short stable code for logs and the `Answer::error` field.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadInput(_) => "bad_input",
            Self::Duplicate(_) => "duplicate",
            Self::BadVector(_) => "bad_vector",
            Self::EmbeddingUnavailable(_) => "embedding_unavailable",
            Self::GenerationUnavailable(_) => "generation_unavailable",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::Transient(_) => "transient",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A specialized Result type for quarry operations.
pub type Result<T> = std::result::Result<T, EngineError>;
