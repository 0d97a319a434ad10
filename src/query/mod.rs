//! Query processing: normalization, classification, adaptive expansion and
//! filter extraction.
//!
//! Everything here is deterministic. Normalization canonicalizes product
//! aliases, error codes (`m8401` → `M8401`) and version mentions
//! (`version 3.6` → `v3.6`) and is idempotent. Expansion appends intent
//! synonyms only when the policy allows it - never for quoted phrases,
//! very short or very long queries, exact-term queries or specific
//! question shapes. Classification buckets the query into one of five
//! intents by keyword, earliest bucket wins.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::{MetadataFilters, QueryContext, QueryType};

static ERROR_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b([kmKM])[-\s]?([0-9]{3,6}[A-Za-z]?)\b").unwrap());
static VERSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:v|ver\.?\s*|version\s+)([0-9]+(?:\.[0-9]+){0,2})\b").unwrap());
static WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[a-zA-Z]{2,}\b").unwrap());
static SPECIFIC_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"^what is (the )?\w+$").unwrap(),
        Regex::new(r"^where is (the )?\w+$").unwrap(),
        Regex::new(r"^when did \w+").unwrap(),
    ]
});

/// Common words ignored when counting significant query terms.
const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by", "is",
    "are", "was", "were", "be", "been", "have", "has", "had", "do", "does", "did", "will", "would",
    "could", "should", "may", "might", "can", "this", "that", "these", "those", "i", "you", "he",
    "she", "it", "we", "they", "me", "him", "her", "us", "them",
];

/// Intent synonym groups, applied in this order for stable expansion.
const SYNONYMS: &[(&str, &[&str])] = &[
    ("install", &["installation", "setup", "configure", "deploy"]),
    ("error", &["problem", "issue", "failure", "bug"]),
    ("configure", &["configuration", "setup", "setting", "config"]),
    ("connect", &["connection", "link", "attach", "join"]),
    ("start", &["begin", "launch", "run", "execute"]),
    ("stop", &["end", "terminate", "halt", "shutdown"]),
    ("update", &["upgrade", "modify", "change", "refresh"]),
];

/// Markers of queries whose terms must match exactly.
const EXACT_TERM_MARKERS: &[&str] = &["version", "ip", "url", "api", "id", "uuid", "hash"];

/// Default product/software alias table, alias → canonical.
const DEFAULT_ALIASES: &[(&str, &str)] = &[
    ("openlab cds", "OpenLab CDS"),
    ("openlab content management", "OpenLab ECM"),
    ("ol cds", "OpenLab CDS"),
    ("ol ecm", "OpenLab ECM"),
    ("7890b gc", "7890B GC"),
    ("masshunter", "MassHunter"),
];

/// Query-text keywords that imply a document type filter.
const DOC_TYPE_KEYWORDS: &[(&str, &str)] = &[
    ("installation", "installation_guide"),
    ("troubleshooting", "troubleshooting_guide"),
    ("release notes", "release_notes"),
    ("manual", "manual"),
    ("faq", "faq"),
];

/// Deterministic query normalizer, classifier and expander.
pub struct QueryProcessor {
    aliases: Vec<(String, String, Regex)>,
}

impl Default for QueryProcessor {
    fn default() -> Self {
        Self::with_aliases(
            DEFAULT_ALIASES
                .iter()
                .map(|(a, c)| (a.to_string(), c.to_string())),
        )
    }
}

impl QueryProcessor {
    /// Create a processor with a custom alias table.
    pub fn with_aliases(aliases: impl IntoIterator<Item = (String, String)>) -> Self {
        let aliases = aliases
            .into_iter()
            .filter_map(|(alias, canonical)| {
                let pattern = format!(r"(?i)\b{}\b", regex::escape(&alias));
                Regex::new(&pattern).ok().map(|re| (alias, canonical, re))
            })
            .collect();
        Self { aliases }
    }

    /// Build the immutable per-request [`QueryContext`].
    pub fn process(&self, raw: &str, caller_filters: MetadataFilters) -> QueryContext {
        let (normalized, entities) = self.normalize(raw);
        let query_type = classify(&normalized);

        let expansion_applied = should_expand(&normalized);
        let expanded = expansion_applied.then(|| expand(&normalized));

        let mut filters = extract_filters(&normalized);
        // Caller-supplied filters win over extracted ones.
        if caller_filters.version.is_some() {
            filters.version = caller_filters.version;
        }
        if caller_filters.document_type.is_some() {
            filters.document_type = caller_filters.document_type;
        }
        filters.source_ids = caller_filters.source_ids;
        filters.kinds = caller_filters.kinds;

        QueryContext {
            raw: raw.to_string(),
            normalized,
            expanded,
            entities,
            query_type,
            expansion_applied,
            filters,
        }
    }

    /// Canonicalize entities in free text. Returns the rewritten text and
    /// the alias → canonical mapping of entities found. Idempotent.
    pub fn normalize(&self, text: &str) -> (String, HashMap<String, String>) {
        let mut result = text.trim().to_string();
        let mut entities = HashMap::new();

        for (alias, canonical, pattern) in &self.aliases {
            if pattern.is_match(&result) {
                entities.insert(alias.clone(), canonical.clone());
                result = pattern.replace_all(&result, canonical.as_str()).to_string();
            }
        }

        result = ERROR_CODE
            .replace_all(&result, |caps: &regex::Captures<'_>| {
                format!("{}{}", caps[1].to_uppercase(), caps[2].to_uppercase())
            })
            .to_string();

        result = VERSION.replace_all(&result, "v$1").to_string();

        (result, entities)
    }
}

/// Significant (non-stop) words of a query, lowercased.
pub fn significant_terms(query: &str) -> Vec<String> {
    WORD.find_iter(&query.to_lowercase())
        .map(|m| m.as_str().to_string())
        .filter(|w| !STOP_WORDS.contains(&w.as_str()))
        .collect()
}

/// Whether the expansion policy permits synonym expansion.
///
/// All of the following must hold: no double-quoted substring, between 3
/// and 8 significant words, no exact-term markers, and no specific
/// question shape.
pub fn should_expand(query: &str) -> bool {
    if query.contains('"') {
        return false;
    }

    let count = significant_terms(query).len();
    if !(3..=8).contains(&count) {
        return false;
    }

    let lower = query.to_lowercase();
    if EXACT_TERM_MARKERS.iter().any(|m| lower.contains(m)) {
        return false;
    }

    !SPECIFIC_PATTERNS.iter().any(|p| p.is_match(&lower))
}

/// Append unique intent synonyms to the query's token stream. Original
/// tokens are never reordered; given the same query and synonym table the
/// output is identical.
pub fn expand(query: &str) -> String {
    let lower = query.to_lowercase();
    let existing: Vec<&str> = lower.split_whitespace().collect();

    let mut tokens: Vec<String> = query.split_whitespace().map(String::from).collect();
    let mut appended: Vec<String> = Vec::new();

    for (root, synonyms) in SYNONYMS {
        if existing.contains(root) {
            for synonym in *synonyms {
                if !existing.contains(synonym) && !appended.iter().any(|a| a == synonym) {
                    appended.push((*synonym).to_string());
                }
            }
        }
    }

    tokens.extend(appended);
    tokens.join(" ")
}

/// Classify a query into an intent bucket. Buckets are checked in order;
/// the earliest match wins.
pub fn classify(query: &str) -> QueryType {
    let lower = query.to_lowercase();
    let contains_any = |words: &[&str]| words.iter().any(|w| lower.contains(w));

    if contains_any(&["how to", "how do", "steps", "process", "procedure"]) {
        QueryType::Procedural
    } else if contains_any(&["what is", "what are", "define", "definition"]) {
        QueryType::Definitional
    } else if contains_any(&["error", "problem", "issue", "troubleshoot", "fix"]) {
        QueryType::Troubleshooting
    } else if contains_any(&["where", "location", "find"]) {
        QueryType::Locational
    } else {
        QueryType::General
    }
}

/// Extract metadata filters implied by the (normalized) query text.
pub fn extract_filters(query: &str) -> MetadataFilters {
    let lower = query.to_lowercase();
    let mut filters = MetadataFilters::default();

    if let Some(caps) = VERSION.captures(&lower) {
        filters.version = Some(format!("v{}", &caps[1]));
    }

    for (keyword, doc_type) in DOC_TYPE_KEYWORDS {
        if lower.contains(keyword) {
            filters.document_type = Some((*doc_type).to_string());
            break;
        }
    }

    filters
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn processor() -> QueryProcessor {
        QueryProcessor::default()
    }

    #[test]
    fn test_alias_normalization() {
        let (normalized, entities) = processor().normalize("how to install ol cds");
        assert_eq!(normalized, "how to install OpenLab CDS");
        assert_eq!(entities.get("ol cds").map(String::as_str), Some("OpenLab CDS"));
    }

    #[test]
    fn test_error_code_normalization() {
        let (normalized, _) = processor().normalize("m8401 database connection error");
        assert!(normalized.starts_with("M8401"));

        let (normalized, _) = processor().normalize("seeing k-2101a on boot");
        assert!(normalized.contains("K2101A"));
    }

    #[rstest]
    #[case("install version 3.6", "v3.6")]
    #[case("install ver. 2.8", "v2.8")]
    #[case("install v2.8.1", "v2.8.1")]
    fn test_version_normalization(#[case] query: &str, #[case] expected: &str) {
        let (normalized, _) = processor().normalize(query);
        assert!(normalized.contains(expected), "got: {}", normalized);
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let queries = [
            "how to install ol cds version 3.6",
            "m8401 database connection error",
            "masshunter ver. 2.8 setup on 7890b gc",
            "plain query with nothing special",
        ];
        let p = processor();
        for query in queries {
            let (once, _) = p.normalize(query);
            let (twice, _) = p.normalize(&once);
            assert_eq!(once, twice, "not idempotent for: {}", query);
        }
    }

    #[rstest]
    #[case("how to install the detector module", QueryType::Procedural)]
    #[case("what is a chromatography data system", QueryType::Definitional)]
    #[case("fix license server error", QueryType::Troubleshooting)]
    #[case("where is the configuration file", QueryType::Locational)]
    #[case("tell me about the sequence editor", QueryType::General)]
    fn test_classification(#[case] query: &str, #[case] expected: QueryType) {
        assert_eq!(classify(query), expected);
    }

    #[test]
    fn test_classification_earliest_bucket_wins() {
        // Contains both procedural and troubleshooting markers; the
        // procedural bucket is checked first.
        assert_eq!(classify("steps to fix the pump error"), QueryType::Procedural);
    }

    #[test]
    fn test_expansion_skipped_for_quoted_query() {
        assert!(!should_expand("configure the \"exact phrase\" here"));
    }

    #[test]
    fn test_expansion_skipped_for_short_and_long_queries() {
        assert!(!should_expand("install cds"));
        assert!(!should_expand(
            "install configure deploy monitor calibrate validate document archive review approve"
        ));
    }

    #[test]
    fn test_expansion_skipped_for_exact_term_markers() {
        assert!(!should_expand("api token rotation schedule details"));
        assert!(!should_expand("change server ip address safely"));
    }

    #[test]
    fn test_expansion_skipped_for_specific_patterns() {
        assert!(!should_expand("what is the aic"));
        assert!(!should_expand("where is the datastore"));
    }

    #[test]
    fn test_expansion_allowed_for_midsize_query() {
        assert!(should_expand("install detector module on workstation"));
    }

    #[test]
    fn test_expand_appends_synonyms_without_reordering() {
        let expanded = expand("install detector module");
        assert!(expanded.starts_with("install detector module"));
        for synonym in ["installation", "setup", "configure", "deploy"] {
            assert!(expanded.contains(synonym), "missing {}", synonym);
        }
    }

    #[test]
    fn test_expand_is_deterministic() {
        let query = "install and configure the error reporting";
        let a = expand(query);
        let b = expand(query);
        assert_eq!(a, b);
        // Stable order: install group precedes error group precedes
        // configure group.
        let setup_pos = a.find("setup").unwrap();
        let failure_pos = a.find("failure").unwrap();
        assert!(setup_pos < failure_pos);
    }

    #[test]
    fn test_expand_no_duplicate_synonyms() {
        // "setup" appears in both install and configure groups.
        let expanded = expand("install and configure detector");
        assert_eq!(expanded.matches("setup").count(), 1);
    }

    #[test]
    fn test_extract_filters_version_and_doc_type() {
        let filters = extract_filters("installation guide for v3.6");
        assert_eq!(filters.version.as_deref(), Some("v3.6"));
        assert_eq!(filters.document_type.as_deref(), Some("installation_guide"));
    }

    #[test]
    fn test_process_builds_context() {
        let context = processor().process(
            "how to install OpenLab CDS v3.6",
            MetadataFilters::default(),
        );
        assert_eq!(context.query_type, QueryType::Procedural);
        assert_eq!(context.filters.version.as_deref(), Some("v3.6"));
        // "version"-marker rule does not fire for the bare v-form, but the
        // significant-word count (install, openlab, cds) sits in range, so
        // expansion applies.
        assert!(context.expansion_applied);
        assert!(context.search_text().contains("installation"));
    }

    #[test]
    fn test_process_caller_filters_win() {
        let caller = MetadataFilters {
            version: Some("v2.8".to_string()),
            ..Default::default()
        };
        let context = processor().process("install guide for v3.6", caller);
        assert_eq!(context.filters.version.as_deref(), Some("v2.8"));
    }

    #[test]
    fn test_definitional_exact_query_not_expanded() {
        let context = processor().process("what is BGE-M3", MetadataFilters::default());
        assert_eq!(context.query_type, QueryType::Definitional);
        assert!(!context.expansion_applied);
        assert_eq!(context.search_text(), "what is BGE-M3");
    }
}
