//! Maximal-marginal-relevance diversity selection.
//!
//! Greedy MMR: seed with the highest-scored candidate, then repeatedly
//! pick the candidate maximizing
//! `lambda * relevance - (1 - lambda) * max_similarity_to_selected`,
//! where similarity is token-set Jaccard on content. The greedy order is
//! deterministic (ties keep the earlier candidate), which makes the
//! selection prefix-complete: asking for k+1 extends the k-selection by
//! exactly one element.

use std::collections::HashSet;

use crate::config::MmrConfig;
use crate::types::RankedResult;

use super::{jaccard, token_set};

/// Greedy MMR selector.
#[derive(Debug, Clone)]
pub struct MmrSelector {
    lambda: f32,
}

impl MmrSelector {
    /// Create a selector from configuration.
    pub fn new(config: &MmrConfig) -> Self {
        Self {
            lambda: config.lambda.clamp(0.0, 1.0),
        }
    }

    /// Select up to `top_k` diverse results. The greedy pass always runs,
    /// even when every candidate will be kept, so the selection order for
    /// `k` is always a prefix of the order for `k + 1`.
    pub fn select(&self, candidates: Vec<RankedResult>, top_k: usize) -> Vec<RankedResult> {
        if top_k == 0 || candidates.is_empty() {
            return Vec::new();
        }

        let tokens: Vec<HashSet<String>> = candidates
            .iter()
            .map(|c| token_set(&c.content, None))
            .collect();

        let mut remaining: Vec<usize> = (0..candidates.len()).collect();
        let mut selected: Vec<usize> = Vec::with_capacity(top_k);

        // Seed with the most relevant candidate (the input is sorted, but
        // pick explicitly so unsorted input still behaves).
        let seed = remaining
            .iter()
            .copied()
            .max_by(|a, b| {
                candidates[*a]
                    .relevance()
                    .partial_cmp(&candidates[*b].relevance())
                    .unwrap_or(std::cmp::Ordering::Equal)
                    // max_by keeps the later of equal elements; reverse the
                    // index order so ties go to the earlier candidate.
                    .then(b.cmp(a))
            })
            .unwrap_or(0);
        selected.push(seed);
        remaining.retain(|i| *i != seed);

        while selected.len() < top_k && !remaining.is_empty() {
            let mut best_index = 0;
            let mut best_score = f32::NEG_INFINITY;

            for (position, candidate_index) in remaining.iter().enumerate() {
                let relevance = candidates[*candidate_index].relevance();
                let max_similarity = selected
                    .iter()
                    .map(|s| jaccard(&tokens[*candidate_index], &tokens[*s]))
                    .fold(0.0f32, f32::max);

                let mmr = self.lambda * relevance - (1.0 - self.lambda) * max_similarity;
                if mmr > best_score {
                    best_score = mmr;
                    best_index = position;
                }
            }

            selected.push(remaining.remove(best_index));
        }

        selected.into_iter().map(|i| candidates[i].clone()).collect()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn result(chunk_id: u64, content: &str, final_score: f32) -> RankedResult {
        RankedResult {
            chunk_id,
            source_id: Uuid::nil(),
            source_name: "doc".to_string(),
            page: 1,
            content: content.to_string(),
            dense_score: 0.0,
            lexical_score: None,
            fused_score: None,
            rerank_score: None,
            final_score: Some(final_score),
            query_type: None,
        }
    }

    fn selector(lambda: f32) -> MmrSelector {
        MmrSelector::new(&MmrConfig { lambda })
    }

    #[test]
    fn test_first_pick_is_highest_score() {
        let selected = selector(0.6).select(
            vec![
                result(1, "pump maintenance steps", 0.7),
                result(2, "detector lamp replacement", 0.9),
                result(3, "column conditioning", 0.5),
            ],
            2,
        );
        assert_eq!(selected[0].chunk_id, 2);
    }

    #[test]
    fn test_diversity_preferred_over_redundancy() {
        // Chunks 1 and 2 are near-identical; chunk 3 is different but only
        // slightly less relevant. With diversity in play, 3 beats 2.
        let selected = selector(0.5).select(
            vec![
                result(1, "install the acquisition client on the workstation now", 0.9),
                result(2, "install the acquisition client on the workstation today", 0.85),
                result(3, "license server troubleshooting and diagnostics overview", 0.8),
            ],
            2,
        );
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].chunk_id, 1);
        assert_eq!(selected[1].chunk_id, 3);
    }

    #[test]
    fn test_pure_relevance_at_lambda_one() {
        let selected = selector(1.0).select(
            vec![
                result(1, "same text entirely", 0.9),
                result(2, "same text entirely", 0.8),
                result(3, "different content here", 0.7),
            ],
            2,
        );
        assert_eq!(selected[0].chunk_id, 1);
        assert_eq!(selected[1].chunk_id, 2);
    }

    #[test]
    fn test_prefix_completeness() {
        let candidates = vec![
            result(1, "alpha beta gamma", 0.9),
            result(2, "alpha beta delta", 0.8),
            result(3, "epsilon zeta eta", 0.7),
            result(4, "theta iota kappa", 0.6),
            result(5, "alpha gamma epsilon", 0.5),
        ];

        let s = selector(0.6);
        for k in 1..candidates.len() {
            let shorter: Vec<u64> = s
                .select(candidates.clone(), k)
                .iter()
                .map(|r| r.chunk_id)
                .collect();
            let longer: Vec<u64> = s
                .select(candidates.clone(), k + 1)
                .iter()
                .map(|r| r.chunk_id)
                .collect();
            assert_eq!(&longer[..k], &shorter[..], "k={} not a prefix", k);
        }
    }

    #[test]
    fn test_small_input_returns_everything() {
        let candidates = vec![result(1, "a", 0.9), result(2, "b", 0.8)];
        let selected = selector(0.6).select(candidates.clone(), 5);
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].chunk_id, 1);
    }

    #[test]
    fn test_top_k_zero() {
        assert!(selector(0.6).select(vec![result(1, "a", 0.9)], 0).is_empty());
    }
}
