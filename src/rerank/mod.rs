//! Reranking: cross-encoder relevance with a rule-based fallback, plus the
//! composite final score.
//!
//! The cross-encoder is an optional collaborator behind the
//! [`CrossEncoder`] trait; deployments without the model run only the
//! rule-based path. Raw cross-encoder scores are mapped to [0, 1] via
//! `(s + 1) / 2` and clamped. The composite score combines the fused
//! score with the rerank score and three auxiliary signals (freshness,
//! content quality, user feedback); freshness and feedback default to a
//! neutral 0.5 unless a signal source is wired in.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::config::RerankConfig;
use crate::types::{RankedResult, Result};

// ============================================================================
// Cross-Encoder Seam
// ============================================================================

/// A cross-encoder scoring (query, document) pairs. Implementations may
/// batch; scores come back in document order.
#[async_trait]
pub trait CrossEncoder: Send + Sync {
    /// Relevance score per document, one per input, same order.
    async fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f32>>;
}

// ============================================================================
// Auxiliary Signals
// ============================================================================

/// Freshness and user-feedback signals for the composite score. The
/// default implementation is neutral; enabling real signals requires a
/// source of truth outside this crate.
pub trait AuxiliarySignals: Send + Sync {
    /// Document recency signal in [0, 1]; 0.5 when unknown.
    fn freshness(&self, _result: &RankedResult) -> f32 {
        0.5
    }

    /// User interaction signal in [0, 1]; 0.5 when unknown.
    fn feedback(&self, _result: &RankedResult) -> f32 {
        0.5
    }
}

/// Neutral signal source (both signals 0.5).
pub struct NeutralSignals;

impl AuxiliarySignals for NeutralSignals {}

// ============================================================================
// Reranker
// ============================================================================

/// Produces the final relevance ordering.
pub struct Reranker {
    cross_encoder: Option<Arc<dyn CrossEncoder>>,
    signals: Arc<dyn AuxiliarySignals>,
    config: RerankConfig,
}

impl Reranker {
    /// Create a reranker. Pass `None` for deployments without a
    /// cross-encoder model; the rule-based path then always runs.
    pub fn new(cross_encoder: Option<Arc<dyn CrossEncoder>>, config: RerankConfig) -> Self {
        Self {
            cross_encoder,
            signals: Arc::new(NeutralSignals),
            config,
        }
    }

    /// Replace the auxiliary signal source.
    pub fn with_signals(mut self, signals: Arc<dyn AuxiliarySignals>) -> Self {
        self.signals = signals;
        self
    }

    /// Rerank results and fill `rerank_score` and `final_score`. Returns
    /// the reordered results and a degradation note when the cross-encoder
    /// was wanted but unusable.
    pub async fn rerank(
        &self,
        query: &str,
        mut results: Vec<RankedResult>,
        allow_cross_encoder: bool,
    ) -> (Vec<RankedResult>, Option<String>) {
        if results.is_empty() {
            return (results, None);
        }

        let mut degraded = None;
        let scores = match (&self.cross_encoder, allow_cross_encoder) {
            (Some(encoder), true) => {
                match self.cross_encoder_scores(encoder.as_ref(), query, &results).await {
                    Ok(scores) => scores,
                    Err(e) => {
                        warn!(error = %e, "cross-encoder failed, using rule-based rerank");
                        degraded = Some("cross_encoder_unavailable".to_string());
                        self.rule_scores(query, &results)
                    }
                }
            }
            _ => self.rule_scores(query, &results),
        };

        for (result, score) in results.iter_mut().zip(scores) {
            result.rerank_score = Some(score);
            let weights = &self.config.weights;
            let composite = weights.fused * result.fused_score.unwrap_or(0.0)
                + weights.rerank * score
                + weights.freshness * self.signals.freshness(result)
                + weights.quality * quality_score(&result.content)
                + weights.feedback * self.signals.feedback(result);
            result.final_score = Some(composite);
        }

        // Final ordering: composite descending, ties by dense score
        // descending, then lower chunk id.
        results.sort_by(|a, b| {
            b.final_score
                .partial_cmp(&a.final_score)
                .unwrap_or(Ordering::Equal)
                .then(
                    b.dense_score
                        .partial_cmp(&a.dense_score)
                        .unwrap_or(Ordering::Equal),
                )
                .then(a.chunk_id.cmp(&b.chunk_id))
        });

        (results, degraded)
    }

    async fn cross_encoder_scores(
        &self,
        encoder: &dyn CrossEncoder,
        query: &str,
        results: &[RankedResult],
    ) -> Result<Vec<f32>> {
        let documents: Vec<String> = results
            .iter()
            .map(|r| truncate_chars(&r.content, self.config.max_chunk_chars))
            .collect();
        let raw = encoder.score(query, &documents).await?;
        Ok(raw
            .into_iter()
            .map(|s| ((s + 1.0) / 2.0).clamp(0.0, 1.0))
            .collect())
    }

    fn rule_scores(&self, query: &str, results: &[RankedResult]) -> Vec<f32> {
        results
            .iter()
            .map(|r| rule_score(query, &r.content, &r.source_name))
            .collect()
    }
}

/// Rule-based relevance score for one (query, chunk) pair.
pub fn rule_score(query: &str, content: &str, source_name: &str) -> f32 {
    let query_lower = query.to_lowercase();
    let content_lower = content.to_lowercase();
    let name_lower = source_name.to_lowercase();

    let query_terms: HashSet<&str> = query_lower.split_whitespace().collect();
    let content_words: HashSet<&str> = content_lower.split_whitespace().collect();
    let name_words: HashSet<&str> = name_lower.split_whitespace().collect();

    let mut score = 0.0f32;

    // Exact phrase match dominates.
    if content_lower.contains(&query_lower) {
        score += 2.0;
    }

    score += query_terms.intersection(&content_words).count() as f32 * 0.5;
    score += query_terms.intersection(&name_words).count() as f32 * 0.3;

    // Positional bonus: terms appearing earlier weigh more.
    let content_len = content_lower.len().max(1) as f32;
    for term in &query_terms {
        if let Some(pos) = content_lower.find(term) {
            score += 0.2 * (1.0 - pos as f32 / content_len).max(0.0);
        }
    }

    // Length penalties.
    if content.len() < 50 {
        score *= 0.8;
    } else if content.len() > 2000 {
        score *= 0.9;
    }

    score
}

/// Content quality signal in [0, 1]: length, structure markers and
/// sentence count.
pub fn quality_score(content: &str) -> f32 {
    let lower = content.to_lowercase();
    let mut score = 0.5f32;

    if (100..=1000).contains(&content.len()) {
        score += 0.2;
    }
    if ["step", "procedure", "process"].iter().any(|m| lower.contains(m)) {
        score += 0.1;
    }
    if ["configure", "install", "setup"].iter().any(|m| lower.contains(m)) {
        score += 0.1;
    }
    if content.matches('.').count() > 2 {
        score += 0.1;
    }

    score.min(1.0)
}

fn truncate_chars(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EngineError;
    use uuid::Uuid;

    fn result(chunk_id: u64, content: &str, dense: f32, fused: f32) -> RankedResult {
        RankedResult {
            chunk_id,
            source_id: Uuid::nil(),
            source_name: "install-guide.pdf".to_string(),
            page: 1,
            content: content.to_string(),
            dense_score: dense,
            lexical_score: None,
            fused_score: Some(fused),
            rerank_score: None,
            final_score: None,
            query_type: None,
        }
    }

    struct FixedEncoder(Vec<f32>);

    #[async_trait]
    impl CrossEncoder for FixedEncoder {
        async fn score(&self, _query: &str, documents: &[String]) -> Result<Vec<f32>> {
            assert!(documents.iter().all(|d| d.len() <= 512));
            Ok(self.0.clone())
        }
    }

    struct FailingEncoder;

    #[async_trait]
    impl CrossEncoder for FailingEncoder {
        async fn score(&self, _query: &str, _documents: &[String]) -> Result<Vec<f32>> {
            Err(EngineError::Transient("model not loaded".to_string()))
        }
    }

    #[test]
    fn test_rule_score_exact_phrase_dominates() {
        let with_phrase = rule_score(
            "pump pressure limit",
            "the pump pressure limit is set in the method editor panel",
            "doc.pdf",
        );
        let without_phrase = rule_score(
            "pump pressure limit",
            "the pressure of the pump has a configured limit somewhere",
            "doc.pdf",
        );
        assert!(with_phrase > without_phrase + 1.0);
    }

    #[test]
    fn test_rule_score_short_content_penalized() {
        let long = rule_score(
            "detector lamp",
            "replace the detector lamp according to the maintenance schedule",
            "doc.pdf",
        );
        let short = rule_score("detector lamp", "detector lamp", "doc.pdf");
        assert!(long > short);
    }

    #[test]
    fn test_rule_score_source_name_terms_count() {
        let named = rule_score("install guide", "some unrelated words", "install-guide.pdf");
        let unnamed = rule_score("install guide", "some unrelated words", "other.pdf");
        // Hyphenated name does not split into terms, so compare with a
        // space-separated name instead.
        let spaced = rule_score("install guide", "some unrelated words", "install guide.pdf");
        assert!(spaced > unnamed);
        assert!(spaced >= named);
    }

    #[test]
    fn test_quality_score_components() {
        let plain = quality_score("short note");
        assert!((plain - 0.5).abs() < 1e-6);

        let structured = quality_score(
            "Step one: configure the instrument. Step two: verify the setup. \
             Step three: run the validation procedure to completion.",
        );
        assert!(structured > 0.9);
        assert!(structured <= 1.0);
    }

    #[tokio::test]
    async fn test_cross_encoder_scores_mapped_to_unit_interval() {
        let reranker = Reranker::new(
            Some(Arc::new(FixedEncoder(vec![1.0, -1.0]))),
            RerankConfig::default(),
        );
        let (results, degraded) = reranker
            .rerank(
                "query",
                vec![result(1, "first chunk", 0.5, 0.02), result(2, "second chunk", 0.4, 0.02)],
                true,
            )
            .await;

        assert!(degraded.is_none());
        let first = results.iter().find(|r| r.chunk_id == 1).unwrap();
        let second = results.iter().find(|r| r.chunk_id == 2).unwrap();
        assert_eq!(first.rerank_score, Some(1.0));
        assert_eq!(second.rerank_score, Some(0.0));
        assert!(first.final_score.unwrap() > second.final_score.unwrap());
    }

    #[tokio::test]
    async fn test_failing_cross_encoder_falls_back_to_rules() {
        let reranker = Reranker::new(Some(Arc::new(FailingEncoder)), RerankConfig::default());
        let (results, degraded) = reranker
            .rerank(
                "detector lamp",
                vec![result(1, "replace the detector lamp assembly", 0.5, 0.02)],
                true,
            )
            .await;

        assert_eq!(degraded.as_deref(), Some("cross_encoder_unavailable"));
        assert!(results[0].rerank_score.unwrap() > 0.0);
        assert!(results[0].final_score.is_some());
    }

    #[tokio::test]
    async fn test_absent_cross_encoder_uses_rules() {
        let reranker = Reranker::new(None, RerankConfig::default());
        let (results, degraded) = reranker
            .rerank(
                "pump seal",
                vec![result(1, "inspect the pump seal weekly", 0.5, 0.02)],
                true,
            )
            .await;
        assert!(degraded.is_none());
        assert!(results[0].rerank_score.is_some());
        assert!(results[0].final_score.is_some());
    }

    #[tokio::test]
    async fn test_composite_ties_broken_by_dense_then_id() {
        // Identical content and fused scores produce identical composites;
        // the higher dense score must come first, then the lower id.
        let reranker = Reranker::new(None, RerankConfig::default());
        let (results, _) = reranker
            .rerank(
                "query",
                vec![
                    result(3, "same text", 0.5, 0.02),
                    result(1, "same text", 0.9, 0.02),
                    result(2, "same text", 0.5, 0.02),
                ],
                false,
            )
            .await;

        assert_eq!(results[0].chunk_id, 1);
        assert_eq!(results[1].chunk_id, 2);
        assert_eq!(results[2].chunk_id, 3);
    }

    #[tokio::test]
    async fn test_cross_encoder_skipped_when_not_allowed() {
        // Even with an encoder wired in, a profile may disallow it.
        let reranker = Reranker::new(
            Some(Arc::new(FixedEncoder(vec![1.0]))),
            RerankConfig::default(),
        );
        let (results, degraded) = reranker
            .rerank(
                "pump seal",
                vec![result(1, "inspect the pump seal weekly", 0.5, 0.02)],
                false,
            )
            .await;
        assert!(degraded.is_none());
        // Rule-based score, not the encoder's mapped 1.0.
        assert_ne!(results[0].rerank_score, Some(1.0));
    }
}
