//! Semantic text chunking for ingest.
//!
//! Pages are cleaned (whitespace, page-header boilerplate), then split at
//! sentence boundaries into chunks of at most `chunk_size` characters
//! (plus a small boundary tolerance) with `chunk_overlap` characters of
//! overlap. Two extras improve retrieval quality:
//!
//! - **Section stamping**: chunks carry the nearest preceding section
//!   header (`Chapter 3`, `2. Installation`, ALL-CAPS headings).
//! - **Definition micro-chunks**: small snippets around `X is ...`
//!   sentences and acronym neighborhoods, which lift definitional recall.
//!
//! A hard per-source cap bounds pathological documents; overflow is
//! reported as truncation with a coverage percentage.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::ChunkingConfig;

/// How far past `chunk_size` a sentence boundary may stretch a chunk.
const BOUNDARY_TOLERANCE: usize = 100;

static SENTENCE_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.!?]+\s+").unwrap());
static PAGE_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?im)^\s*page\s+\d+.*$|^\s*\d+\s*$").unwrap());
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static SECTION_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:Chapter|Section|Part)\s+\d+[^.\n]{0,60}|\b\d+\.\s+[A-Z][A-Za-z]+(?: [A-Za-z]+){0,5}")
        .unwrap()
});
static ALL_CAPS_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Z][A-Z ]{5,}[A-Z]\b").unwrap());
static DEFINITION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Z][A-Za-z0-9_/-]{1,30}\s+(?:is|are)\s+[^.]{10,200}\.").unwrap());
static ACRONYM: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[A-Z]{2,5}\b").unwrap());

/// A chunk of page text, before embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct TextChunk {
    /// Cleaned chunk content.
    pub content: String,
    /// 1-based page number the chunk came from.
    pub page: usize,
    /// Nearest preceding section header, when detected.
    pub section: Option<String>,
}

/// Result of chunking a whole source.
#[derive(Debug, Clone)]
pub struct ChunkingOutcome {
    /// Chunks in document order (micro-chunks follow their page's chunks).
    pub chunks: Vec<TextChunk>,
    /// True when the per-source cap cut the document short.
    pub is_truncated: bool,
    /// Percentage of the input text covered by emitted chunks.
    pub coverage_percent: f32,
}

/// Sentence-aware chunker with definition micro-chunks.
#[derive(Debug, Clone)]
pub struct SemanticChunker {
    config: ChunkingConfig,
}

impl SemanticChunker {
    /// Create a chunker with the given configuration.
    pub fn new(config: ChunkingConfig) -> Self {
        Self { config }
    }

    /// Clean raw page text: strip page-number boilerplate, collapse
    /// whitespace runs.
    pub fn preprocess(&self, text: &str) -> String {
        let without_headers = PAGE_HEADER.replace_all(text, "");
        WHITESPACE
            .replace_all(&without_headers, " ")
            .trim()
            .to_string()
    }

    /// Chunk all pages of a source, applying the per-source cap.
    pub fn chunk_pages(&self, pages: &[String]) -> ChunkingOutcome {
        let total_chars: usize = pages.iter().map(|p| p.len()).sum();
        let mut chunks: Vec<TextChunk> = Vec::new();
        let mut covered_chars = 0usize;
        let mut is_truncated = false;

        for (index, page_text) in pages.iter().enumerate() {
            if page_text.trim().is_empty() {
                covered_chars += page_text.len();
                continue;
            }
            if chunks.len() >= self.config.max_chunks_per_source {
                is_truncated = true;
                break;
            }

            let page = index + 1;
            let remaining = self.config.max_chunks_per_source - chunks.len();
            let (mut page_chunks, page_complete) = self.chunk_page(page_text, page, remaining);

            if self.config.definition_microchunks && page_complete {
                let budget = self
                    .config
                    .max_chunks_per_source
                    .saturating_sub(chunks.len() + page_chunks.len());
                let mut micro = self.definition_microchunks(page_text, page);
                micro.truncate(budget);
                page_chunks.extend(micro);
            }

            chunks.extend(page_chunks);
            if page_complete {
                covered_chars += page_text.len();
            } else {
                is_truncated = true;
                // Rough share of the page that made it into chunks.
                let emitted: usize = chunks
                    .iter()
                    .filter(|c| c.page == page)
                    .map(|c| c.content.len())
                    .sum();
                covered_chars += emitted.min(page_text.len());
                break;
            }
        }

        let coverage_percent = if total_chars == 0 {
            100.0
        } else {
            (covered_chars as f32 / total_chars as f32 * 100.0).min(100.0)
        };

        ChunkingOutcome {
            chunks,
            is_truncated,
            coverage_percent,
        }
    }

    /// Chunk a single page at sentence boundaries. Returns the chunks and
    /// whether the whole page was consumed before hitting `budget`.
    fn chunk_page(&self, text: &str, page: usize, budget: usize) -> (Vec<TextChunk>, bool) {
        let clean = self.preprocess(text);
        if clean.is_empty() {
            return (Vec::new(), true);
        }

        let sections = find_sections(&clean);

        if clean.len() <= self.config.chunk_size {
            let chunk = TextChunk {
                section: section_for(&sections, 0),
                content: clean,
                page,
            };
            return (vec![chunk], budget >= 1);
        }

        let boundaries = sentence_boundaries(&clean);
        let mut chunks = Vec::new();
        let mut start = 0usize;

        while start < clean.len() {
            if chunks.len() >= budget {
                return (chunks, false);
            }

            let hard_end = (start + self.config.chunk_size).min(clean.len());
            let flex_end = (hard_end + BOUNDARY_TOLERANCE).min(clean.len());
            // Prefer the furthest sentence boundary within the tolerance
            // window; fall back to a hard cut.
            let end = boundaries
                .iter()
                .copied()
                .filter(|b| *b > start && *b <= flex_end)
                .next_back()
                .unwrap_or(hard_end)
                .max(start + 1);

            let content = clean[char_floor(&clean, start)..char_ceil(&clean, end)].trim();
            if !content.is_empty() {
                chunks.push(TextChunk {
                    content: content.to_string(),
                    page,
                    section: section_for(&sections, start),
                });
            }

            if end >= clean.len() {
                break;
            }
            start = end.saturating_sub(self.config.chunk_overlap).max(start + 1);
        }

        (chunks, true)
    }

    /// Extract small definition-like snippets for acronyms and terms.
    fn definition_microchunks(&self, text: &str, page: usize) -> Vec<TextChunk> {
        let clean = self.preprocess(text);
        if clean.is_empty() {
            return Vec::new();
        }

        let mut micro: Vec<TextChunk> = Vec::new();
        let mut seen: Vec<String> = Vec::new();
        let mut push = |snippet: &str| {
            let snippet = snippet.trim().to_string();
            if !seen.contains(&snippet) {
                seen.push(snippet.clone());
                micro.push(TextChunk {
                    content: snippet,
                    page,
                    section: None,
                });
            }
        };

        for m in DEFINITION.find_iter(&clean) {
            let start = char_floor(&clean, m.start().saturating_sub(20));
            let end = char_ceil(&clean, (m.end() + 20).min(clean.len()));
            let snippet = &clean[start..end];
            if (80..=180).contains(&snippet.len()) {
                push(snippet);
            }
        }

        // Acronym neighborhoods near the start of the page.
        let head_end = char_ceil(&clean, 800.min(clean.len()));
        for m in ACRONYM.find_iter(&clean[..head_end]) {
            let start = char_floor(&clean, m.start().saturating_sub(60));
            let end = char_ceil(&clean, (m.end() + 120).min(clean.len()));
            let snippet = &clean[start..end];
            if (60..=160).contains(&snippet.len()) {
                push(snippet);
            }
        }

        micro
    }
}

fn sentence_boundaries(text: &str) -> Vec<usize> {
    SENTENCE_END
        .find_iter(text)
        .map(|m| m.end())
        .filter(|end| *end < text.len())
        .collect()
}

/// (offset, title) pairs for detected section headers, ascending.
fn find_sections(text: &str) -> Vec<(usize, String)> {
    let mut sections: Vec<(usize, String)> = SECTION_HEADER
        .find_iter(text)
        .map(|m| (m.start(), m.as_str().trim().to_string()))
        .chain(
            ALL_CAPS_HEADER
                .find_iter(text)
                .map(|m| (m.start(), m.as_str().trim().to_string())),
        )
        .collect();
    sections.sort_by(|a, b| a.0.cmp(&b.0));
    sections
}

fn section_for(sections: &[(usize, String)], offset: usize) -> Option<String> {
    sections
        .iter()
        .rev()
        .find(|(pos, _)| *pos <= offset)
        .map(|(_, title)| title.clone())
}

/// Largest char boundary <= index.
fn char_floor(text: &str, mut index: usize) -> usize {
    index = index.min(text.len());
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// Smallest char boundary >= index.
fn char_ceil(text: &str, mut index: usize) -> usize {
    index = index.min(text.len());
    while index < text.len() && !text.is_char_boundary(index) {
        index += 1;
    }
    index
}

// ============================================================================
// Tests
// ============================================================================
