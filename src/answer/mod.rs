//! Answer assembly: abstain gating, context packing, prompt construction
//! and response cleanup.
//!
//! The abstain gate refuses to answer when the evidence is too weak and
//! produces a clarification prompt instead. The context optimizer packs
//! selected chunks into a length-bounded, source-grouped context window.
//! The prompt builder enforces grounding rules through prompt text; the
//! response cleaner strips markdown artifacts from generated answers.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::AbstainConfig;
use crate::types::{QueryType, RankedResult};

/// Canonical sentence for information absent from the corpus.
pub const NOT_AVAILABLE_MESSAGE: &str =
    "This information is not available in the provided documentation.";

// ============================================================================
// Abstain Gate
// ============================================================================

/// Why the engine declined to answer.
#[derive(Debug, Clone, PartialEq)]
pub enum AbstainReason {
    /// Nothing matched at all.
    NoResults,
    /// Fewer results than the configured minimum.
    TooFewResults(usize),
    /// Mean and max composite scores both under threshold.
    LowRelevance {
        /// Mean composite score of the result set.
        avg: f32,
        /// Best composite score of the result set.
        max: f32,
    },
    /// Mean fused score under the hybrid threshold.
    LowHybrid(f32),
}

impl std::fmt::Display for AbstainReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoResults => write!(f, "no results found in the knowledge base"),
            Self::TooFewResults(count) => write!(
                f,
                "only {} result(s) found, insufficient for a confident answer",
                count
            ),
            Self::LowRelevance { avg, max } => write!(
                f,
                "low relevance scores (avg: {:.3}, max: {:.3})",
                avg, max
            ),
            Self::LowHybrid(avg) => write!(f, "low hybrid relevance score (avg: {:.3})", avg),
        }
    }
}

/// Threshold-based refusal gate.
#[derive(Debug, Clone)]
pub struct AbstainGate {
    min_similarity: f32,
    min_results: usize,
    min_hybrid: f32,
    fused_scale: f32,
}

impl AbstainGate {
    /// Build a gate from configuration, with the profile-resolved
    /// composite threshold.
    ///
    /// `fused_scale` is the maximum attainable fused score under the
    /// fusion mode that produced the results: 1.0 for the weighted sum,
    /// `2 / (k + 1)` for two-ranking RRF. The hybrid threshold compares
    /// against fused scores divided by this scale, so `min_hybrid` keeps
    /// its [0, 1] meaning regardless of fusion mode.
    pub fn new(config: &AbstainConfig, min_similarity: f32, fused_scale: f32) -> Self {
        Self {
            min_similarity,
            min_results: config.min_results,
            min_hybrid: config.min_hybrid,
            fused_scale: if fused_scale > 0.0 { fused_scale } else { 1.0 },
        }
    }

    /// Evaluate the result set; `Some` means abstain.
    pub fn evaluate(&self, results: &[RankedResult]) -> Option<AbstainReason> {
        if results.is_empty() {
            return Some(AbstainReason::NoResults);
        }
        if results.len() < self.min_results {
            return Some(AbstainReason::TooFewResults(results.len()));
        }

        let scores: Vec<f32> = results.iter().map(|r| r.relevance()).collect();
        let avg = scores.iter().sum::<f32>() / scores.len() as f32;
        let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        if avg < self.min_similarity && max < self.min_similarity * 1.5 {
            return Some(AbstainReason::LowRelevance { avg, max });
        }

        let hybrid: Vec<f32> = results
            .iter()
            .filter_map(|r| r.fused_score.filter(|s| *s > 0.0))
            .map(|s| s / self.fused_scale)
            .collect();
        if !hybrid.is_empty() {
            let avg_hybrid = hybrid.iter().sum::<f32>() / hybrid.len() as f32;
            if avg_hybrid < self.min_hybrid {
                return Some(AbstainReason::LowHybrid(avg_hybrid));
            }
        }

        None
    }

    /// Clarification prompt explaining the refusal and suggesting next
    /// steps.
    pub fn clarification(&self, query: &str, reason: &AbstainReason) -> String {
        format!(
            "I found limited information for your question: '{}'. Reason: {}. Could you:\n\
             1. Rephrase your question with more specific terms?\n\
             2. Specify the product, version, or document type?\n\
             3. Try breaking down your question into smaller parts?",
            query, reason
        )
    }
}

// ============================================================================
// Context Optimizer
// ============================================================================

/// Natural break points preferred when truncating a chunk, tried in order.
const BREAK_POINTS: &[&str] = &[". ", ".\n", ":\n", "\n\n"];

/// Minimum share of a chunk that must survive truncation.
const MIN_KEEP_RATIO: f32 = 0.6;

/// A packed context window.
#[derive(Debug, Clone)]
pub struct AssembledContext {
    /// The packed, source-grouped context text.
    pub text: String,
    /// Number of distinct sources that made it into the window.
    pub sources_used: usize,
}

/// Packs chunks into a length-bounded, source-grouped context window.
#[derive(Debug, Clone)]
pub struct ContextOptimizer {
    max_context_chars: usize,
}

impl ContextOptimizer {
    /// Create an optimizer with the given character budget.
    pub fn new(max_context_chars: usize) -> Self {
        Self { max_context_chars }
    }

    /// Assemble the context window from selected results. Results are
    /// grouped by source (groups ordered by first appearance, which is
    /// final-rank order), sorted by final score within each group, and
    /// packed until the budget runs out.
    pub fn assemble(&self, results: &[RankedResult]) -> AssembledContext {
        if results.is_empty() {
            return AssembledContext {
                text: String::new(),
                sources_used: 0,
            };
        }

        // Group by source, preserving first-appearance order.
        let mut order: Vec<&str> = Vec::new();
        let mut groups: HashMap<&str, Vec<&RankedResult>> = HashMap::new();
        for result in results {
            let name = result.source_name.as_str();
            if !groups.contains_key(name) {
                order.push(name);
            }
            groups.entry(name).or_default().push(result);
        }

        let mut sections: Vec<String> = Vec::new();
        let mut total = 0usize;
        let mut sources_used = 0usize;

        for name in order {
            if total >= self.max_context_chars {
                break;
            }
            let mut group = groups.remove(name).unwrap_or_default();
            group.sort_by(|a, b| {
                b.relevance()
                    .partial_cmp(&a.relevance())
                    .unwrap_or(std::cmp::Ordering::Equal)
            });

            let header = format!("\n=== SOURCE: {} ===\n", name);
            let mut parts: Vec<String> = Vec::new();

            for result in group {
                let available = self
                    .max_context_chars
                    .saturating_sub(total + header.len() + 100);
                if available == 0 {
                    break;
                }

                let content = truncate_at_boundary(&result.content, available);
                if content.is_empty() {
                    break;
                }

                let part = format!(
                    "[Page {}, Relevance: {:.3}]\n{}",
                    result.page,
                    result.relevance(),
                    content
                );
                total += part.len() + 10;
                parts.push(part);

                if total >= self.max_context_chars {
                    break;
                }
            }

            if !parts.is_empty() {
                sections.push(format!("{}{}", header, parts.join("\n\n")));
                sources_used += 1;
            }
        }

        AssembledContext {
            text: sections.join("\n\n"),
            sources_used,
        }
    }
}

/// Truncate `content` to at most `available` characters, preferring a
/// natural boundary as long as at least 60% of the intended text is kept.
fn truncate_at_boundary(content: &str, available: usize) -> String {
    if content.len() <= available {
        return content.to_string();
    }

    let mut end = available;
    while end > 0 && !content.is_char_boundary(end) {
        end -= 1;
    }
    let hard = &content[..end];

    for break_point in BREAK_POINTS {
        if let Some(pos) = hard.rfind(break_point) {
            let keep = pos + break_point.len();
            if keep as f32 > available as f32 * MIN_KEEP_RATIO {
                return hard[..keep].trim_end().to_string();
            }
        }
    }
    hard.trim_end().to_string()
}

// ============================================================================
// Prompt Builder
// ============================================================================

/// Build the generation prompt: strict grounding rules, a query-type
/// clause, the packed context and the question.
pub fn build_prompt(
    query: &str,
    context: &AssembledContext,
    query_type: QueryType,
    comprehensive: bool,
) -> String {
    let grounding = format!(
        "You are a technical documentation assistant. Your only source of information \
         is the context below.\n\n\
         Rules:\n\
         1. Answer strictly from the provided context; use no external knowledge.\n\
         2. Do not guess, infer beyond the text, or invent examples.\n\
         3. Cite every claim with a bracketed reference number or as \
         [Source: name, Page N].\n\
         4. If the context does not contain the answer, reply exactly: \"{}\"\n\
         5. Use technical terms exactly as they appear in the documents.\n",
        NOT_AVAILABLE_MESSAGE
    );

    let type_clause = match query_type {
        QueryType::Procedural => {
            "Present the answer as ordered steps, in the exact order the documents give \
             them. Include prerequisites, warnings and verification steps when present."
        }
        QueryType::Definitional => {
            "Give a complete definition: what the term is, its characteristics, and how it \
             relates to nearby concepts, as far as the documents state them."
        }
        QueryType::Troubleshooting => {
            "Structure the answer as a diagnostic flow: symptoms, possible causes, and the \
             resolution steps the documents give for each cause."
        }
        QueryType::Locational => {
            "State precisely where the requested item is found, naming the documents and \
             pages that say so."
        }
        QueryType::General => {
            "Address every aspect of the question the documents cover, and nothing they do \
             not."
        }
    };

    let depth_clause = if comprehensive {
        "\nBe exhaustive: use every relevant detail the context provides.\n"
    } else {
        ""
    };

    format!(
        "{}\n{}\n{}\nSOURCES AVAILABLE: {}\n\nCONTEXT:\n{}\n\nQUESTION: {}\n\nANSWER:",
        grounding, type_clause, depth_clause, context.sources_used, context.text, query
    )
}

// ============================================================================
// Response Cleaner
// ============================================================================

static MD_HEADERS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^#{1,6}\s+").unwrap());
static STAR_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*{3,}").unwrap());
static DASH_RULES: Lazy<Regex> = Lazy::new(|| Regex::new(r"-{3,}").unwrap());
static EQUALS_RULES: Lazy<Regex> = Lazy::new(|| Regex::new(r"={3,}").unwrap());
static EXCESS_NEWLINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

/// Strip markdown artifacts from a generated answer: headers, `*`/`-`/`=`
/// rule runs, and runs of three or more newlines.
pub fn clean_response(response: &str) -> String {
    if response.is_empty() {
        return String::new();
    }

    let cleaned = MD_HEADERS.replace_all(response, "");
    let cleaned = STAR_RUNS.replace_all(&cleaned, "");
    let cleaned = DASH_RULES.replace_all(&cleaned, "");
    let cleaned = EQUALS_RULES.replace_all(&cleaned, "");
    let cleaned = EXCESS_NEWLINES.replace_all(&cleaned, "\n\n");
    cleaned.trim().to_string()
}

// ============================================================================
// Tests
// ============================================================================
