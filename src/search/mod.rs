//! Retrieval stages: dense search, lexical scoring, fusion, deduplication
//! and diversity selection.
//!
//! Stage order for a query: dense retrieval pulls candidates, BM25 scores
//! them lexically, reciprocal rank fusion combines the two rankings,
//! deduplication trims per-source and near-identical chunks, the reranker
//! (see [`crate::rerank`]) refines the ordering and MMR selects a diverse
//! final set. Each stage writes only its own score field on
//! [`crate::types::RankedResult`].

pub mod bm25;
pub mod dedup;
pub mod dense;
pub mod fusion;
pub mod mmr;

use std::collections::HashSet;

pub use bm25::{Bm25Scorer, CorpusStats};
pub use dense::DenseRetriever;
pub use fusion::{rrf_fuse, weighted_fuse};
pub use mmr::MmrSelector;

/// Whitespace token set of (a prefix of) a text, lowercased. Used for
/// content-overlap checks in deduplication and MMR.
pub fn token_set(text: &str, prefix_chars: Option<usize>) -> HashSet<String> {
    let text = match prefix_chars {
        Some(limit) if text.len() > limit => {
            let mut end = limit;
            while end > 0 && !text.is_char_boundary(end) {
                end -= 1;
            }
            &text[..end]
        }
        _ => text,
    };
    text.to_lowercase()
        .split_whitespace()
        .map(String::from)
        .collect()
}

/// Jaccard overlap of two token sets; 0 when either is empty.
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f32 / union as f32
    }
}
