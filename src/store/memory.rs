//! In-memory chunk store.
//!
//! Sources live in a map of per-source slots, each guarded by its own
//! mutex so state transitions are serialized per source while readers and
//! other sources proceed. Chunks live in an append-only arena keyed by a
//! monotonically increasing id, which makes "ties broken by lower chunk
//! id" the same as insertion order. Nearest-neighbor search is an exact
//! cosine scan over ready chunks.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::{
    Chunk, ChunkId, EngineError, ProcessingState, Result, Source, SourceId, SourceKind,
};

use super::{ChunkFilter, ChunkStore, ScoredChunk, StoredChunk};

/// Cosine similarity between two equal-length vectors. Returns 0 when
/// either vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[derive(Debug, Serialize, Deserialize)]
struct ChunkRow {
    source_id: SourceId,
    ordinal: usize,
    page: usize,
    section: Option<String>,
    text: String,
    embedding: Vec<f32>,
}

/// On-disk snapshot of the store (JSON).
#[derive(Deserialize)]
struct PersistedStore {
    dimension: usize,
    sources: Vec<Source>,
    chunks: BTreeMap<ChunkId, ChunkRow>,
    next_chunk_id: u64,
}

/// Borrowed view of the store state for serialization.
#[derive(Serialize)]
struct PersistedStoreRef<'a> {
    dimension: usize,
    sources: &'a [Source],
    chunks: &'a BTreeMap<ChunkId, ChunkRow>,
    next_chunk_id: u64,
}

type SourceSlot = Arc<Mutex<Source>>;

/// In-memory `ChunkStore` backend.
#[derive(Debug)]
pub struct MemoryChunkStore {
    dimension: usize,
    sources: RwLock<HashMap<SourceId, SourceSlot>>,
    chunks: RwLock<BTreeMap<ChunkId, ChunkRow>>,
    next_chunk_id: AtomicU64,
}

impl MemoryChunkStore {
    /// Create an empty store enforcing embedding dimension `dimension`.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            sources: RwLock::new(HashMap::new()),
            chunks: RwLock::new(BTreeMap::new()),
            next_chunk_id: AtomicU64::new(1),
        }
    }

    fn slot(&self, id: SourceId) -> Result<SourceSlot> {
        self.sources
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::StoreUnavailable(format!("unknown source {}", id)))
    }

    fn validate_embedding(&self, embedding: &[f32]) -> Result<()> {
        if embedding.len() != self.dimension {
            return Err(EngineError::BadVector(format!(
                "embedding has dimension {}, store requires {}",
                embedding.len(),
                self.dimension
            )));
        }
        if embedding.iter().any(|v| !v.is_finite()) {
            return Err(EngineError::BadVector(
                "embedding contains a non-finite component".to_string(),
            ));
        }
        if embedding.iter().all(|v| *v == 0.0) {
            return Err(EngineError::BadVector(
                "embedding has zero norm".to_string(),
            ));
        }
        Ok(())
    }

    fn build_rows(&self, source_id: SourceId, chunks: Vec<Chunk>) -> Result<Vec<ChunkRow>> {
        let mut rows = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            if chunk.source_id != source_id {
                return Err(EngineError::BadInput(format!(
                    "chunk claims source {}, expected {}",
                    chunk.source_id, source_id
                )));
            }
            self.validate_embedding(&chunk.embedding)?;
            rows.push(ChunkRow {
                source_id,
                ordinal: chunk.ordinal,
                page: chunk.page,
                section: chunk.section,
                text: chunk.text,
                embedding: chunk.embedding,
            });
        }
        Ok(rows)
    }

    /// Snapshot of (id, name, kind) for ready sources, for read paths.
    fn ready_sources(&self) -> HashMap<SourceId, (String, SourceKind)> {
        self.sources
            .read()
            .values()
            .filter_map(|slot| {
                let source = slot.lock();
                (source.state == ProcessingState::Ready)
                    .then(|| (source.id, (source.name.clone(), source.kind)))
            })
            .collect()
    }

    /// Save the store to a file (JSON format).
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let sources: Vec<Source> = self
            .sources
            .read()
            .values()
            .map(|slot| slot.lock().clone())
            .collect();
        let chunks = self.chunks.read();
        let snapshot = PersistedStoreRef {
            dimension: self.dimension,
            sources: sources.as_slice(),
            chunks: &*chunks,
            next_chunk_id: self.next_chunk_id.load(Ordering::Relaxed),
        };

        let json = serde_json::to_string(&snapshot)
            .map_err(|e| EngineError::StoreUnavailable(format!("failed to serialize store: {}", e)))?;
        std::fs::write(path, json)
            .map_err(|e| EngineError::StoreUnavailable(format!("failed to write store file: {}", e)))
    }

    /// Load a store from a file (JSON format). Fails when the persisted
    /// dimension does not match `dimension`.
    pub fn load<P: AsRef<Path>>(path: P, dimension: usize) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| EngineError::StoreUnavailable(format!("failed to read store file: {}", e)))?;
        let persisted: PersistedStore = serde_json::from_str(&json).map_err(|e| {
            EngineError::StoreUnavailable(format!("failed to deserialize store: {}", e))
        })?;

        if persisted.dimension != dimension {
            return Err(EngineError::BadVector(format!(
                "persisted store has dimension {}, expected {}",
                persisted.dimension, dimension
            )));
        }

        let sources = persisted
            .sources
            .into_iter()
            .map(|source| (source.id, Arc::new(Mutex::new(source))))
            .collect();

        Ok(Self {
            dimension,
            sources: RwLock::new(sources),
            next_chunk_id: AtomicU64::new(persisted.next_chunk_id),
            chunks: RwLock::new(persisted.chunks),
        })
    }

    /// Load a store from a file if it exists, otherwise return a new
    /// empty store.
    pub fn load_or_new<P: AsRef<Path>>(path: P, dimension: usize) -> Self {
        if path.as_ref().exists() {
            Self::load(path, dimension).unwrap_or_else(|_| Self::new(dimension))
        } else {
            Self::new(dimension)
        }
    }

    fn transition_allowed(from: ProcessingState, to: ProcessingState) -> bool {
        use ProcessingState::*;
        match to {
            Failed => true,
            // Explicit refresh may re-enter the pipeline from a stable state.
            Pending => matches!(from, Ready | Failed),
            Extracting => matches!(from, Pending),
            Chunking => matches!(from, Extracting),
            Embedding => matches!(from, Chunking),
            Ready => matches!(from, Embedding),
        }
    }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn create_source(&self, source: Source) -> Result<()> {
        let mut sources = self.sources.write();
        if sources.contains_key(&source.id) {
            return Err(EngineError::BadInput(format!(
                "source {} already exists",
                source.id
            )));
        }
        sources.insert(source.id, Arc::new(Mutex::new(source)));
        Ok(())
    }

    async fn get_source(&self, id: SourceId) -> Result<Option<Source>> {
        Ok(self
            .sources
            .read()
            .get(&id)
            .map(|slot| slot.lock().clone()))
    }

    async fn list_sources(&self) -> Result<Vec<Source>> {
        let mut sources: Vec<Source> = self
            .sources
            .read()
            .values()
            .map(|slot| slot.lock().clone())
            .collect();
        sources.sort_by_key(|s| s.created_at);
        Ok(sources)
    }

    async fn find_active_hash(&self, hash: &str) -> Result<Option<Source>> {
        Ok(self.sources.read().values().find_map(|slot| {
            let source = slot.lock();
            (source.hash == hash && source.state != ProcessingState::Failed)
                .then(|| source.clone())
        }))
    }

    async fn transition(&self, id: SourceId, to: ProcessingState) -> Result<()> {
        let slot = self.slot(id)?;
        let mut source = slot.lock();
        if !Self::transition_allowed(source.state, to) {
            return Err(EngineError::BadInput(format!(
                "illegal state transition {} -> {} for source {}",
                source.state, to, id
            )));
        }
        source.state = to;
        source.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_failed(&self, id: SourceId, error: &str) -> Result<()> {
        let slot = self.slot(id)?;
        let mut source = slot.lock();
        source.state = ProcessingState::Failed;
        source.error = Some(error.to_string());
        source.updated_at = Utc::now();
        Ok(())
    }

    async fn complete_source(
        &self,
        id: SourceId,
        is_truncated: bool,
        coverage_percent: f32,
    ) -> Result<()> {
        let slot = self.slot(id)?;
        let mut source = slot.lock();

        let chunks = self.chunks.read();
        let mut ordinals: Vec<usize> = chunks
            .values()
            .filter(|row| row.source_id == id)
            .map(|row| row.ordinal)
            .collect();
        drop(chunks);

        if ordinals.is_empty() {
            return Err(EngineError::BadInput(format!(
                "source {} has no chunks, cannot become ready",
                id
            )));
        }
        ordinals.sort_unstable();
        if ordinals.first() != Some(&0) || ordinals.windows(2).any(|w| w[1] != w[0] + 1) {
            return Err(EngineError::BadInput(format!(
                "source {} has non-contiguous chunk ordinals",
                id
            )));
        }

        if !Self::transition_allowed(source.state, ProcessingState::Ready) {
            return Err(EngineError::BadInput(format!(
                "illegal state transition {} -> ready for source {}",
                source.state, id
            )));
        }

        source.chunk_count = ordinals.len();
        source.embedding_count = ordinals.len();
        source.is_truncated = is_truncated;
        source.coverage_percent = coverage_percent;
        source.state = ProcessingState::Ready;
        source.error = None;
        source.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_source(&self, id: SourceId) -> Result<usize> {
        let mut sources = self.sources.write();
        let mut chunks = self.chunks.write();

        if sources.remove(&id).is_none() {
            return Err(EngineError::StoreUnavailable(format!(
                "unknown source {}",
                id
            )));
        }
        let before = chunks.len();
        chunks.retain(|_, row| row.source_id != id);
        Ok(before - chunks.len())
    }

    async fn insert_chunks(&self, source_id: SourceId, chunks: Vec<Chunk>) -> Result<Vec<ChunkId>> {
        let slot = self.slot(source_id)?;
        let mut source = slot.lock();
        if !source.state.is_ingesting() {
            return Err(EngineError::BadInput(format!(
                "source {} is {}, not accepting chunks",
                source_id, source.state
            )));
        }

        let rows = self.build_rows(source_id, chunks)?;

        let mut arena = self.chunks.write();
        let existing: HashSet<usize> = arena
            .values()
            .filter(|row| row.source_id == source_id)
            .map(|row| row.ordinal)
            .collect();
        let mut batch: HashSet<usize> = HashSet::with_capacity(rows.len());
        for row in &rows {
            if existing.contains(&row.ordinal) || !batch.insert(row.ordinal) {
                return Err(EngineError::BadInput(format!(
                    "ordinal {} conflicts for source {}",
                    row.ordinal, source_id
                )));
            }
        }

        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            let id = self.next_chunk_id.fetch_add(1, Ordering::Relaxed);
            arena.insert(id, row);
            ids.push(id);
        }

        source.chunk_count += ids.len();
        source.embedding_count += ids.len();
        source.updated_at = Utc::now();
        Ok(ids)
    }

    async fn replace_source(
        &self,
        source_id: SourceId,
        hash: String,
        page_count: usize,
        chunks: Vec<Chunk>,
        is_truncated: bool,
        coverage_percent: f32,
    ) -> Result<()> {
        let slot = self.slot(source_id)?;
        let mut source = slot.lock();

        let rows = self.build_rows(source_id, chunks)?;
        if rows.is_empty() {
            return Err(EngineError::BadInput(format!(
                "refresh of source {} produced no chunks",
                source_id
            )));
        }

        // Swap under the arena write lock: the old chunks stay visible
        // until this point, then readers see only the new set.
        let mut arena = self.chunks.write();
        arena.retain(|_, row| row.source_id != source_id);
        let count = rows.len();
        for row in rows {
            let id = self.next_chunk_id.fetch_add(1, Ordering::Relaxed);
            arena.insert(id, row);
        }
        drop(arena);

        source.hash = hash;
        source.page_count = page_count;
        source.chunk_count = count;
        source.embedding_count = count;
        source.is_truncated = is_truncated;
        source.coverage_percent = coverage_percent;
        source.state = ProcessingState::Ready;
        source.error = None;
        source.updated_at = Utc::now();
        Ok(())
    }

    async fn nearest(
        &self,
        vector: &[f32],
        n: usize,
        filter: &ChunkFilter,
    ) -> Result<Vec<ScoredChunk>> {
        if n == 0 {
            return Ok(Vec::new());
        }

        let ready = self.ready_sources();
        let chunks = self.chunks.read();

        let mut scored: Vec<ScoredChunk> = Vec::new();
        for (id, row) in chunks.iter() {
            let Some((name, kind)) = ready.get(&row.source_id) else {
                continue;
            };
            if let Some(ids) = &filter.source_ids {
                if !ids.contains(&row.source_id) {
                    continue;
                }
            }
            if let Some(kinds) = &filter.kinds {
                if !kinds.contains(kind) {
                    continue;
                }
            }
            if let Some((start, end)) = filter.ordinal_range {
                if row.ordinal < start || row.ordinal > end {
                    continue;
                }
            }
            // Validate on read as well as write; skip rather than poison
            // the ranking with a malformed stored vector.
            if row.embedding.len() != self.dimension
                || row.embedding.iter().any(|v| !v.is_finite())
            {
                warn!(chunk_id = id, "skipping chunk with malformed stored vector");
                continue;
            }

            scored.push(ScoredChunk {
                chunk: StoredChunk {
                    id: *id,
                    source_id: row.source_id,
                    source_name: name.clone(),
                    ordinal: row.ordinal,
                    page: row.page,
                    section: row.section.clone(),
                    text: row.text.clone(),
                },
                score: cosine_similarity(vector, &row.embedding),
            });
        }

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.chunk.id.cmp(&b.chunk.id))
        });
        scored.truncate(n);
        Ok(scored)
    }

    async fn ready_chunk_texts(&self) -> Result<Vec<(ChunkId, String)>> {
        let ready = self.ready_sources();
        Ok(self
            .chunks
            .read()
            .iter()
            .filter(|(_, row)| ready.contains_key(&row.source_id))
            .map(|(id, row)| (*id, row.text.clone()))
            .collect())
    }

    async fn ready_chunk_count(&self) -> Result<usize> {
        let ready = self.ready_sources();
        Ok(self
            .chunks
            .read()
            .values()
            .filter(|row| ready.contains_key(&row.source_id))
            .count())
    }
}

// ============================================================================
// Tests
// ============================================================================
