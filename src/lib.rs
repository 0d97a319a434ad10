//! # Quarry - Document-Grounded Question Answering Engine
//!
//! Quarry answers natural-language questions from an ingested document
//! corpus and returns the ranked passages the answer is grounded in, each
//! annotated with provenance (source, page, score). When the evidence is
//! too weak it abstains with a clarification instead of guessing.
//!
//! ## Pipeline
//!
//! 1. **Ingestion** - pages are cleaned, chunked at sentence boundaries
//!    (plus definition micro-chunks), embedded in batches and persisted.
//! 2. **Query processing** - entity normalization, intent classification,
//!    adaptive synonym expansion, filter extraction.
//! 3. **Retrieval** - dense k-NN candidates, BM25 lexical scores,
//!    reciprocal rank fusion, per-source and content deduplication.
//! 4. **Ranking** - cross-encoder (or rule-based) reranking folded into a
//!    composite score, then MMR diversity selection.
//! 5. **Answering** - abstain gate, source-grouped context packing, a
//!    strictly grounded prompt, chat-model generation, markdown cleanup.
//!
//! ## Example
//!
//! ```rust,ignore
//! use quarry::{Engine, EngineConfig, QueryRequest, SourceDescriptor};
//! use quarry::types::SourceKind;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Engine::new(EngineConfig::default())?;
//!     let cancel = CancellationToken::new();
//!
//!     engine.ingest(
//!         SourceDescriptor { name: "manual.pdf".into(), kind: SourceKind::File },
//!         vec!["Page one text...".into()],
//!         &cancel,
//!     ).await?;
//!
//!     let answer = engine.query(QueryRequest::new("how do I calibrate?"), &cancel).await?;
//!     println!("{}", answer.text);
//!     Ok(())
//! }
//! ```
//!
//! ## External collaborators
//!
//! The embedding service and the chat generator are consumed over HTTP
//! (Ollama-compatible wire shapes). There is no fallback embedding model
//! and no fabricated answer text: when a collaborator is down, the error
//! surfaces.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

/// Abstain gating, context packing, prompt construction, response cleanup.
pub mod answer;
/// Keyed TTL caches (embedding, search, response scopes).
pub mod cache;
/// Immutable engine configuration (TOML + defaults).
pub mod config;
/// HTTP embedding client with batching and cache-through.
pub mod embedding;
/// Pipeline assembly and the ingest/query API.
pub mod engine;
/// HTTP chat generation client with per-query-type sampling.
pub mod generate;
/// Ingestion: semantic chunking and the source state machine.
pub mod ingest;
/// Query normalization, classification, expansion and filters.
pub mod query;
/// Reranking: cross-encoder seam, rule fallback, composite scoring.
pub mod rerank;
/// Retrieval stages: BM25, dense search, fusion, dedup, MMR.
pub mod search;
/// Chunk store abstraction and the in-memory backend.
pub mod store;
/// Core types (sources, chunks, results, errors).
pub mod types;

// Re-export commonly used types
pub use config::EngineConfig;
pub use engine::{Engine, EngineAnalytics, QueryRequest};
pub use ingest::SourceDescriptor;
pub use rerank::CrossEncoder;
pub use store::{ChunkStore, MemoryChunkStore};
pub use types::{Answer, EngineError, PipelineProfile, QueryType, Result};
