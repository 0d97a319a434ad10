//! BM25 lexical scoring over memoized corpus statistics.
//!
//! Corpus statistics (per-term document frequencies and the average chunk
//! length) are computed over all ready chunks and cached in an
//! [`ArcSwap`] snapshot with a TTL. Readers hold a reference to the
//! snapshot they started with and are unaffected by a concurrent rebuild;
//! a stale-but-consistent snapshot is acceptable. Ingest deltas invalidate
//! the snapshot so the next use rebuilds lazily.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::Mutex;
use tracing::info;

use crate::config::Bm25Config;
use crate::store::ChunkStore;
use crate::types::Result;

static BM25_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[a-zA-Z]{2,}\b").unwrap());

/// Lowercased alphabetic tokens of length >= 2.
pub fn tokenize(text: &str) -> Vec<String> {
    BM25_WORD
        .find_iter(&text.to_lowercase())
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Immutable corpus statistics snapshot.
#[derive(Debug)]
pub struct CorpusSnapshot {
    /// Number of ready chunks at build time.
    pub total_docs: usize,
    /// Average chunk token length.
    pub avg_doc_length: f32,
    /// Term → number of chunks containing it.
    pub doc_frequencies: HashMap<String, usize>,
    built_at: Instant,
}

impl CorpusSnapshot {
    /// An empty snapshot for an empty corpus.
    fn empty() -> Self {
        Self {
            total_docs: 0,
            avg_doc_length: 0.0,
            doc_frequencies: HashMap::new(),
            built_at: Instant::now(),
        }
    }
}

/// Memoized corpus statistics over a chunk store.
pub struct CorpusStats {
    store: Arc<dyn ChunkStore>,
    snapshot: ArcSwapOption<CorpusSnapshot>,
    stale: AtomicBool,
    ttl: Duration,
    rebuild_lock: Mutex<()>,
}

impl CorpusStats {
    /// Create a statistics holder over the given store.
    pub fn new(store: Arc<dyn ChunkStore>, config: &Bm25Config) -> Self {
        Self {
            store,
            snapshot: ArcSwapOption::empty(),
            stale: AtomicBool::new(false),
            ttl: Duration::from_secs(config.stats_ttl_secs),
            rebuild_lock: Mutex::new(()),
        }
    }

    /// Mark the snapshot stale; the next reader rebuilds it.
    pub fn invalidate(&self) {
        self.stale.store(true, Ordering::Release);
    }

    /// Current snapshot, rebuilding lazily when missing, stale or expired.
    pub async fn snapshot(&self) -> Result<Arc<CorpusSnapshot>> {
        if let Some(current) = self.snapshot.load_full() {
            let expired = current.built_at.elapsed() > self.ttl;
            if !expired && !self.stale.load(Ordering::Acquire) {
                return Ok(current);
            }
        }
        self.rebuild().await
    }

    async fn rebuild(&self) -> Result<Arc<CorpusSnapshot>> {
        // One rebuild at a time; late arrivals reuse the fresh snapshot.
        let _guard = self.rebuild_lock.lock().await;
        if let Some(current) = self.snapshot.load_full() {
            if current.built_at.elapsed() <= self.ttl && !self.stale.load(Ordering::Acquire) {
                return Ok(current);
            }
        }

        let texts = self.store.ready_chunk_texts().await?;
        let snapshot = if texts.is_empty() {
            Arc::new(CorpusSnapshot::empty())
        } else {
            let mut doc_frequencies: HashMap<String, usize> = HashMap::new();
            let mut total_tokens = 0usize;

            for (_, text) in &texts {
                let tokens = tokenize(text);
                total_tokens += tokens.len();
                let unique: HashSet<&String> = tokens.iter().collect();
                for term in unique {
                    *doc_frequencies.entry(term.clone()).or_insert(0) += 1;
                }
            }

            Arc::new(CorpusSnapshot {
                total_docs: texts.len(),
                avg_doc_length: total_tokens as f32 / texts.len() as f32,
                doc_frequencies,
                built_at: Instant::now(),
            })
        };

        info!(
            docs = snapshot.total_docs,
            avg_length = snapshot.avg_doc_length,
            "rebuilt BM25 corpus statistics"
        );
        self.snapshot.store(Some(Arc::clone(&snapshot)));
        self.stale.store(false, Ordering::Release);
        Ok(snapshot)
    }
}

/// BM25 scorer with configurable k1/b.
#[derive(Debug, Clone)]
pub struct Bm25Scorer {
    k1: f32,
    b: f32,
}

impl Bm25Scorer {
    /// Create a scorer from configuration.
    pub fn new(config: &Bm25Config) -> Self {
        Self {
            k1: config.k1,
            b: config.b,
        }
    }

    /// Inverse document frequency of a term under a snapshot. Terms absent
    /// from the corpus contribute zero.
    fn idf(&self, snapshot: &CorpusSnapshot, term: &str) -> f32 {
        let df = snapshot.doc_frequencies.get(term).copied().unwrap_or(0) as f32;
        let n = snapshot.total_docs as f32;
        if df == 0.0 || n == 0.0 {
            return 0.0;
        }
        ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
    }

    /// BM25 score of a chunk text for the given query terms.
    pub fn score(&self, snapshot: &CorpusSnapshot, query_terms: &[String], text: &str) -> f32 {
        if snapshot.total_docs == 0 || snapshot.avg_doc_length == 0.0 {
            return 0.0;
        }

        let doc_tokens = tokenize(text);
        let doc_len = doc_tokens.len() as f32;
        if doc_len == 0.0 {
            return 0.0;
        }

        let mut term_freq: HashMap<&str, usize> = HashMap::new();
        for token in &doc_tokens {
            *term_freq.entry(token.as_str()).or_insert(0) += 1;
        }

        let mut score = 0.0;
        for term in query_terms {
            let tf = term_freq.get(term.as_str()).copied().unwrap_or(0) as f32;
            if tf == 0.0 {
                continue;
            }
            let idf = self.idf(snapshot, term);
            let numerator = tf * (self.k1 + 1.0);
            let denominator =
                tf + self.k1 * (1.0 - self.b + self.b * doc_len / snapshot.avg_doc_length);
            score += idf * numerator / denominator;
        }
        score
    }
}

// ============================================================================
// Tests
// ============================================================================
