//! Rank fusion: combining the dense and lexical rankings.
//!
//! Reciprocal rank fusion is the primary combination; it is robust to the
//! very different scales of cosine similarities and BM25 scores because it
//! only looks at rank positions. A weighted sum of min-max normalized
//! scores exists as a degraded fallback for when only one ranking is
//! usable, or for callers that opt into it via configuration.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::types::{ChunkId, RankedResult};

/// Fuse candidates' dense and lexical rankings with reciprocal rank
/// fusion: each ranking contributes `1 / (k + rank)` (rank starts at 1)
/// to a document's fused score. Documents missing from a ranking simply
/// receive no contribution from it. Returns candidates sorted by fused
/// score descending, ties by lower chunk id.
pub fn rrf_fuse(mut candidates: Vec<RankedResult>, k: f32) -> Vec<RankedResult> {
    if candidates.is_empty() {
        return candidates;
    }

    let mut fused: HashMap<ChunkId, f32> = HashMap::new();

    for ranking in [dense_ranking(&candidates), lexical_ranking(&candidates)] {
        for (position, chunk_id) in ranking.into_iter().enumerate() {
            let contribution = 1.0 / (k + (position + 1) as f32);
            *fused.entry(chunk_id).or_insert(0.0) += contribution;
        }
    }

    for candidate in &mut candidates {
        candidate.fused_score = Some(fused.get(&candidate.chunk_id).copied().unwrap_or(0.0));
    }

    sort_by_fused(&mut candidates);
    candidates
}

/// Weighted-sum fallback: min-max normalize the dense and lexical scores
/// over the candidate set and combine them linearly. Candidates without a
/// lexical score contribute zero on the lexical side.
pub fn weighted_fuse(
    mut candidates: Vec<RankedResult>,
    dense_weight: f32,
    lexical_weight: f32,
) -> Vec<RankedResult> {
    if candidates.is_empty() {
        return candidates;
    }

    let dense: Vec<f32> = candidates.iter().map(|c| c.dense_score).collect();
    let lexical: Vec<f32> = candidates
        .iter()
        .map(|c| c.lexical_score.unwrap_or(0.0))
        .collect();
    let dense_norm = normalize(&dense);
    let lexical_norm = normalize(&lexical);

    for (i, candidate) in candidates.iter_mut().enumerate() {
        candidate.fused_score =
            Some(dense_weight * dense_norm[i] + lexical_weight * lexical_norm[i]);
    }

    sort_by_fused(&mut candidates);
    candidates
}

/// Chunk ids by dense score descending, ties by lower id.
fn dense_ranking(candidates: &[RankedResult]) -> Vec<ChunkId> {
    let mut order: Vec<(ChunkId, f32)> = candidates
        .iter()
        .map(|c| (c.chunk_id, c.dense_score))
        .collect();
    order.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    order.into_iter().map(|(id, _)| id).collect()
}

/// Chunk ids by lexical score descending, ties by lower id. Candidates
/// with no lexical evidence are left out of this ranking entirely.
fn lexical_ranking(candidates: &[RankedResult]) -> Vec<ChunkId> {
    let mut order: Vec<(ChunkId, f32)> = candidates
        .iter()
        .filter_map(|c| {
            c.lexical_score
                .filter(|s| *s > 0.0)
                .map(|s| (c.chunk_id, s))
        })
        .collect();
    order.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    order.into_iter().map(|(id, _)| id).collect()
}

fn sort_by_fused(candidates: &mut [RankedResult]) {
    candidates.sort_by(|a, b| {
        b.fused_score
            .partial_cmp(&a.fused_score)
            .unwrap_or(Ordering::Equal)
            .then(a.chunk_id.cmp(&b.chunk_id))
    });
}

/// Min-max normalize scores to [0, 1]. A constant list maps to all ones,
/// except the no-signal case (all zeros) which stays zero.
fn normalize(scores: &[f32]) -> Vec<f32> {
    let min = scores.iter().copied().fold(f32::INFINITY, f32::min);
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !min.is_finite() || !max.is_finite() {
        return vec![0.0; scores.len()];
    }
    if (max - min).abs() < f32::EPSILON {
        return if max == 0.0 {
            vec![0.0; scores.len()]
        } else {
            vec![1.0; scores.len()]
        };
    }
    scores.iter().map(|s| (s - min) / (max - min)).collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn candidate(chunk_id: ChunkId, dense: f32, lexical: Option<f32>) -> RankedResult {
        RankedResult {
            chunk_id,
            source_id: Uuid::nil(),
            source_name: "doc".to_string(),
            page: 1,
            content: format!("chunk {}", chunk_id),
            dense_score: dense,
            lexical_score: lexical,
            fused_score: None,
            rerank_score: None,
            final_score: None,
            query_type: None,
        }
    }

    #[test]
    fn test_rrf_score_is_sum_of_contributions() {
        // Dense ranking: 1, 2. Lexical ranking: 2, 1.
        let fused = rrf_fuse(
            vec![candidate(1, 0.9, Some(1.0)), candidate(2, 0.8, Some(2.0))],
            60.0,
        );

        let by_id = |id: ChunkId| {
            fused
                .iter()
                .find(|c| c.chunk_id == id)
                .unwrap()
                .fused_score
                .unwrap()
        };
        // Each appears once at rank 1 and once at rank 2.
        let expected = 1.0 / 61.0 + 1.0 / 62.0;
        assert!((by_id(1) - expected).abs() < 1e-6);
        assert!((by_id(2) - expected).abs() < 1e-6);
        // Identical fused scores: lower chunk id first.
        assert_eq!(fused[0].chunk_id, 1);
    }

    #[test]
    fn test_rrf_document_in_one_ranking_still_contributes() {
        // Chunk 2 has no lexical evidence; it still gets its dense
        // contribution.
        let fused = rrf_fuse(
            vec![candidate(1, 0.5, Some(3.0)), candidate(2, 0.9, None)],
            60.0,
        );

        let chunk2 = fused.iter().find(|c| c.chunk_id == 2).unwrap();
        assert!((chunk2.fused_score.unwrap() - 1.0 / 61.0).abs() < 1e-6);
    }

    #[test]
    fn test_rrf_agreement_beats_single_ranking() {
        // Chunk 1 is top in both rankings; chunk 2 is second in both;
        // chunk 3 only shows up in dense.
        let fused = rrf_fuse(
            vec![
                candidate(1, 0.9, Some(5.0)),
                candidate(2, 0.8, Some(4.0)),
                candidate(3, 0.85, None),
            ],
            60.0,
        );
        assert_eq!(fused[0].chunk_id, 1);
        assert!(fused[0].fused_score > fused[2].fused_score);
    }

    #[test]
    fn test_rrf_preserves_prior_scores() {
        let fused = rrf_fuse(vec![candidate(1, 0.42, Some(1.5))], 60.0);
        assert_eq!(fused[0].dense_score, 0.42);
        assert_eq!(fused[0].lexical_score, Some(1.5));
        assert!(fused[0].rerank_score.is_none());
    }

    #[test]
    fn test_weighted_fuse_applies_weights() {
        let fused = weighted_fuse(
            vec![candidate(1, 0.9, Some(0.0)), candidate(2, 0.1, Some(10.0))],
            0.7,
            0.3,
        );
        // Chunk 1: normalized dense 1.0, lexical 0.0 -> 0.7.
        // Chunk 2: normalized dense 0.0, lexical 1.0 -> 0.3.
        let chunk1 = fused.iter().find(|c| c.chunk_id == 1).unwrap();
        let chunk2 = fused.iter().find(|c| c.chunk_id == 2).unwrap();
        assert!((chunk1.fused_score.unwrap() - 0.7).abs() < 1e-6);
        assert!((chunk2.fused_score.unwrap() - 0.3).abs() < 1e-6);
        assert_eq!(fused[0].chunk_id, 1);
    }

    #[test]
    fn test_empty_input() {
        assert!(rrf_fuse(Vec::new(), 60.0).is_empty());
        assert!(weighted_fuse(Vec::new(), 0.7, 0.3).is_empty());
    }
}
