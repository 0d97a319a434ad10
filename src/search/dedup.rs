//! Deduplication: per-source caps and content-overlap filtering.
//!
//! Runs after fusion, on candidates sorted by fused score descending, so
//! "extras are discarded in fused-score order" falls out of iteration
//! order.

use std::collections::HashMap;

use crate::types::{RankedResult, SourceId};

use super::{jaccard, token_set};

/// Characters of content considered by the overlap filter.
const OVERLAP_PREFIX_CHARS: usize = 500;

/// Keep at most `cap` chunks per source, in input (fused-score) order.
pub fn dedup_by_source(results: Vec<RankedResult>, cap: usize) -> Vec<RankedResult> {
    let mut counts: HashMap<SourceId, usize> = HashMap::new();
    results
        .into_iter()
        .filter(|result| {
            let count = counts.entry(result.source_id).or_insert(0);
            *count += 1;
            *count <= cap
        })
        .collect()
}

/// Drop chunks whose first-500-character token set overlaps an already
/// kept chunk by more than `threshold` (Jaccard).
pub fn dedup_by_content(results: Vec<RankedResult>, threshold: f32) -> Vec<RankedResult> {
    let mut kept: Vec<RankedResult> = Vec::with_capacity(results.len());
    let mut kept_tokens: Vec<std::collections::HashSet<String>> = Vec::new();

    for result in results {
        let tokens = token_set(&result.content, Some(OVERLAP_PREFIX_CHARS));
        let duplicate = kept_tokens.iter().any(|seen| jaccard(&tokens, seen) > threshold);
        if !duplicate {
            kept_tokens.push(tokens);
            kept.push(result);
        }
    }
    kept
}

// ============================================================================
// Tests
// ============================================================================
