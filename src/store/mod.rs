//! Chunk store abstraction.
//!
//! The store owns two logical tables: Sources (processing bookkeeping) and
//! Chunks (text + embedding + position). A vector index over the chunk
//! embeddings answers "top-N nearest neighbors to v, optionally filtered
//! by source attributes". Sources hold no back-pointers to chunks; a chunk
//! stores only its owning source id.
//!
//! The shipped backend is [`memory::MemoryChunkStore`]; the trait keeps
//! the engine backend-agnostic the same way the database layer abstracts
//! over its providers.

pub mod memory;

use async_trait::async_trait;

use crate::types::{
    Chunk, ChunkId, ProcessingState, Result, Source, SourceId, SourceKind,
};

pub use memory::MemoryChunkStore;

// ============================================================================
// Read Views
// ============================================================================

/// A chunk as returned by store reads. Embeddings stay inside the store;
/// downstream stages work on text and metadata.
#[derive(Debug, Clone)]
pub struct StoredChunk {
    /// Store-assigned identifier.
    pub id: ChunkId,
    /// Owning source.
    pub source_id: SourceId,
    /// Source display name, denormalized for result assembly.
    pub source_name: String,
    /// Position within the source.
    pub ordinal: usize,
    /// 1-based page number.
    pub page: usize,
    /// Detected section header, if any.
    pub section: Option<String>,
    /// Chunk text.
    pub text: String,
}

/// A stored chunk with its cosine similarity to a query vector.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    /// The matching chunk.
    pub chunk: StoredChunk,
    /// Cosine similarity in [-1, 1].
    pub score: f32,
}

/// Filter predicates for `nearest`.
#[derive(Debug, Clone, Default)]
pub struct ChunkFilter {
    /// Restrict to these sources.
    pub source_ids: Option<Vec<SourceId>>,
    /// Restrict to these source kinds.
    pub kinds: Option<Vec<SourceKind>>,
    /// Restrict to ordinals in `[start, end]` inclusive.
    pub ordinal_range: Option<(usize, usize)>,
}

impl ChunkFilter {
    /// True when no predicate is set.
    pub fn is_empty(&self) -> bool {
        self.source_ids.is_none() && self.kinds.is_none() && self.ordinal_range.is_none()
    }
}

// ============================================================================
// Store Trait
// ============================================================================

/// Persistence contract for sources and chunks.
///
/// Writers follow a single-writer-per-source discipline during ingest;
/// readers are unrestricted and only ever see chunks of `Ready` sources.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    // ============== Source Operations ==============

    /// Register a new source record.
    async fn create_source(&self, source: Source) -> Result<()>;

    /// Fetch a source by id.
    async fn get_source(&self, id: SourceId) -> Result<Option<Source>>;

    /// List all sources.
    async fn list_sources(&self) -> Result<Vec<Source>>;

    /// Find a non-failed source carrying this content hash.
    async fn find_active_hash(&self, hash: &str) -> Result<Option<Source>>;

    /// Advance a source's processing state. Transitions must be monotonic;
    /// `Failed` is reachable from anywhere, and `Pending` is re-enterable
    /// only via explicit refresh.
    async fn transition(&self, id: SourceId, to: ProcessingState) -> Result<()>;

    /// Mark a source failed with a human-readable error.
    async fn mark_failed(&self, id: SourceId, error: &str) -> Result<()>;

    /// Validate counts and transition a source to `Ready`, recording
    /// truncation and coverage.
    async fn complete_source(
        &self,
        id: SourceId,
        is_truncated: bool,
        coverage_percent: f32,
    ) -> Result<()>;

    /// Atomically delete a source and all its chunks. Returns the number
    /// of chunks removed.
    async fn delete_source(&self, id: SourceId) -> Result<usize>;

    // ============== Chunk Operations ==============

    /// Append chunks for a source. Fails when the source is not in an
    /// ingesting state, when an ordinal conflicts with a persisted chunk,
    /// or when an embedding is malformed (`BadVector`).
    async fn insert_chunks(&self, source_id: SourceId, chunks: Vec<Chunk>) -> Result<Vec<ChunkId>>;

    /// Atomically replace a source's chunks, hash and page count, then
    /// mark it ready. The old chunks stay visible until the swap commits;
    /// there is no partial visibility.
    async fn replace_source(
        &self,
        source_id: SourceId,
        hash: String,
        page_count: usize,
        chunks: Vec<Chunk>,
        is_truncated: bool,
        coverage_percent: f32,
    ) -> Result<()>;

    /// Top-N chunks by cosine similarity to `vector`, descending; ties
    /// broken by lower chunk id. Only chunks of `Ready` sources are
    /// considered, and chunks whose stored vector is malformed are skipped.
    async fn nearest(
        &self,
        vector: &[f32],
        n: usize,
        filter: &ChunkFilter,
    ) -> Result<Vec<ScoredChunk>>;

    /// Texts of all chunks belonging to `Ready` sources, for corpus
    /// statistics builds.
    async fn ready_chunk_texts(&self) -> Result<Vec<(ChunkId, String)>>;

    /// Number of chunks belonging to `Ready` sources.
    async fn ready_chunk_count(&self) -> Result<usize>;
}
