//! End-to-end pipeline tests against mocked embedding and generator
//! services.
//!
//! The embedding mock projects each prompt's words onto a fixed-dimension
//! vector (bag-of-words hashing), so texts sharing vocabulary get high
//! cosine similarity. That keeps dense retrieval deterministic without a
//! real model. The generator mock returns canned grounded answers.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use quarry::types::{MetadataFilters, QueryType, SourceKind};
use quarry::{Engine, EngineConfig, PipelineProfile, QueryRequest, SourceDescriptor};

const DIM: usize = 32;

/// Deterministic bag-of-words embedding service.
struct WordHashEmbedder;

impl Respond for WordHashEmbedder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        let prompt = body["prompt"].as_str().unwrap_or_default();

        let mut vector = vec![0.0f32; DIM];
        for word in prompt
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let mut hasher = DefaultHasher::new();
            word.hash(&mut hasher);
            vector[(hasher.finish() % DIM as u64) as usize] += 1.0;
        }
        // A constant component keeps zero-overlap texts at small positive
        // similarity instead of a rejected zero-norm vector.
        vector[0] += 0.1;

        ResponseTemplate::new(200).set_body_json(serde_json::json!({ "embedding": vector }))
    }
}

async fn services(answer_text: &str) -> (MockServer, MockServer) {
    let embedding = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embeddings"))
        .respond_with(WordHashEmbedder)
        .mount(&embedding)
        .await;

    let generator = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "message": { "content": answer_text }
        })))
        .mount(&generator)
        .await;

    (embedding, generator)
}

fn engine_for(embedding: &MockServer, generator: &MockServer) -> Engine {
    let mut config = EngineConfig::default();
    config.services.embedding_url = embedding.uri();
    config.services.generator_url = generator.uri();
    config.embedding.dimension = DIM;
    config.embedding.retries = 0;
    config.embedding.timeout_secs = 5;
    config.chunking.definition_microchunks = false;
    Engine::new(config).unwrap()
}

async fn ingest(engine: &Engine, name: &str, pages: &[&str]) {
    engine
        .ingest(
            SourceDescriptor {
                name: name.to_string(),
                kind: SourceKind::File,
            },
            pages.iter().map(|p| p.to_string()).collect(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
}

// ============================================================================
// Scenario: exact-phrase definition
// ============================================================================

#[tokio::test]
async fn definition_query_finds_defining_chunk() {
    let (embedding, generator) =
        services("BGE-M3 is a multilingual embedding model [1].").await;
    let engine = engine_for(&embedding, &generator);

    ingest(
        &engine,
        "models.pdf",
        &[
            "BGE-M3 is a multilingual embedding model.",
            "The pump module requires quarterly seal inspection and cleaning.",
            "Column conditioning takes thirty minutes at operating temperature.",
        ],
    )
    .await;

    let answer = engine
        .query(QueryRequest::new("what is BGE-M3"), &CancellationToken::new())
        .await
        .unwrap();

    assert!(!answer.abstained, "should not abstain: {:?}", answer.stats);
    assert_eq!(answer.stats.query_type, QueryType::Definitional);
    assert!(!answer.stats.expansion_applied);
    assert!(answer.sources[0].name.contains("models.pdf"));
    assert!(answer.text.contains("[1]"));
    assert!(answer.text.contains("BGE-M3"));
}

#[tokio::test]
async fn definition_query_baseline_composite_is_strong() {
    let (embedding, generator) = services("BGE-M3 is a multilingual embedding model [1].").await;
    let engine = engine_for(&embedding, &generator);

    ingest(
        &engine,
        "models.pdf",
        &[
            "BGE-M3 is a multilingual embedding model.",
            "Unrelated maintenance text about pump seals and tubing.",
        ],
    )
    .await;

    let answer = engine
        .query(
            QueryRequest::new("what is BGE-M3").with_profile(PipelineProfile::Baseline),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(!answer.abstained);
    assert!(
        answer.sources[0].score >= 0.7,
        "composite too low: {}",
        answer.sources[0].score
    );
}

// ============================================================================
// Scenario: procedural query with version filter
// ============================================================================

#[tokio::test]
async fn version_filter_keeps_only_matching_source() {
    let (embedding, generator) = services("Run the v3.6 installer [1].").await;
    let engine = engine_for(&embedding, &generator);

    ingest(
        &engine,
        "cds-v2.8-install.pdf",
        &["To install OpenLab CDS v2.8 run the legacy installer and reboot the host."],
    )
    .await;
    ingest(
        &engine,
        "cds-v3.6-install.pdf",
        &["To install OpenLab CDS v3.6 run the unified installer and activate licensing."],
    )
    .await;

    let answer = engine
        .query(
            QueryRequest::new("how to install OpenLab CDS v3.6")
                .with_profile(PipelineProfile::Advanced),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(!answer.abstained);
    assert_eq!(answer.stats.query_type, QueryType::Procedural);
    assert!(!answer.sources.is_empty());
    for source in &answer.sources {
        assert!(
            source.name.contains("v3.6"),
            "v2.8 chunk survived the filter: {}",
            source.name
        );
    }
}

// ============================================================================
// Scenario: troubleshooting with error code
// ============================================================================

#[tokio::test]
async fn error_code_query_is_normalized_and_boosted() {
    let (embedding, generator) = services("Check the database service [1].").await;
    let engine = engine_for(&embedding, &generator);

    ingest(
        &engine,
        "errors.pdf",
        &[
            "M8401 database connection error indicates the shared services host is unreachable.",
            "The oven door interlock prevents operation above safe temperature.",
            "Sample injection requires a primed syringe and a sealed vial.",
        ],
    )
    .await;

    let answer = engine
        .query(
            QueryRequest::new("m8401 database connection error")
                .with_profile(PipelineProfile::Advanced),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(!answer.abstained);
    assert_eq!(answer.stats.query_type, QueryType::Troubleshooting);
    assert!(!answer.sources.is_empty());
    // The M8401 chunk wins on lexical evidence.
    assert_eq!(answer.sources[0].page, 1);
}

// ============================================================================
// Scenario: abstain on low relevance
// ============================================================================

#[tokio::test]
async fn off_topic_query_abstains_without_calling_generator() {
    let embedding = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embeddings"))
        .respond_with(WordHashEmbedder)
        .mount(&embedding)
        .await;

    // A generator that must never be called.
    let generator = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "message": { "content": "should never appear" }
        })))
        .expect(0)
        .mount(&generator)
        .await;

    let engine = engine_for(&embedding, &generator);
    ingest(
        &engine,
        "recipes.pdf",
        &[
            "Simmer the tomato sauce gently while whisking in the fresh basil.",
            "Fold the egg whites into the batter before baking at low heat.",
            "Season the roasted vegetables generously and serve warm.",
        ],
    )
    .await;

    let answer = engine
        .query(
            QueryRequest::new("install OpenLab CDS"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(answer.abstained);
    assert!(answer.text.is_empty());
    let clarification = answer.clarification.unwrap();
    assert!(
        clarification.to_lowercase().contains("low relevance")
            || clarification.to_lowercase().contains("no results"),
        "unexpected clarification: {}",
        clarification
    );
}

// ============================================================================
// Degraded generation
// ============================================================================

#[tokio::test]
async fn generation_failure_returns_retrieval_results_with_error_code() {
    let embedding = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embeddings"))
        .respond_with(WordHashEmbedder)
        .mount(&embedding)
        .await;

    let generator = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&generator)
        .await;

    let engine = engine_for(&embedding, &generator);
    ingest(
        &engine,
        "manual.pdf",
        &["The detector lamp replacement procedure requires a cooled lamp housing."],
    )
    .await;

    let answer = engine
        .query(
            QueryRequest::new("detector lamp replacement procedure"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(!answer.abstained);
    assert!(answer.text.is_empty());
    assert_eq!(answer.error.as_deref(), Some("generation_unavailable"));
    assert!(!answer.sources.is_empty(), "retrieval results must survive");
}

// ============================================================================
// Caching and idempotence
// ============================================================================

#[tokio::test]
async fn repeated_query_hits_search_cache_with_identical_results() {
    let (embedding, generator) = services("The seals are inspected weekly [1].").await;
    let engine = engine_for(&embedding, &generator);

    ingest(
        &engine,
        "maintenance.pdf",
        &[
            "Pump seals are inspected weekly and replaced at the first sign of wear.",
            "Detector flow cells are flushed with isopropanol monthly.",
        ],
    )
    .await;

    let request = QueryRequest::new("how often are pump seals inspected");
    let first = engine
        .query(request.clone(), &CancellationToken::new())
        .await
        .unwrap();
    let second = engine
        .query(request, &CancellationToken::new())
        .await
        .unwrap();

    assert!(!first.stats.cache_hit);
    assert!(second.stats.cache_hit);

    let first_ids: Vec<u64> = first.sources.iter().map(|s| s.chunk_id).collect();
    let second_ids: Vec<u64> = second.sources.iter().map(|s| s.chunk_id).collect();
    assert_eq!(first_ids, second_ids);

    let analytics = engine.analytics();
    assert_eq!(analytics.queries, 2);
    assert_eq!(analytics.search_cache_hits, 1);
}

#[tokio::test]
async fn delete_then_reingest_restores_identical_ranking() {
    let (embedding, generator) = services("Grounded answer [1].").await;
    let engine = engine_for(&embedding, &generator);

    let pages = [
        "Sequence acquisition starts after the instrument passes its readiness checks.",
        "The audit trail records every method change with a timestamp.",
    ];
    ingest(&engine, "doc.pdf", &pages).await;

    let request = QueryRequest::new("when does sequence acquisition start");
    let before = engine
        .query(request.clone(), &CancellationToken::new())
        .await
        .unwrap();

    let sources = engine.sources().await.unwrap();
    engine.delete(sources[0].id).await.unwrap();
    ingest(&engine, "doc.pdf", &pages).await;

    let after = engine
        .query(request, &CancellationToken::new())
        .await
        .unwrap();

    let before_pages: Vec<usize> = before.sources.iter().map(|s| s.page).collect();
    let after_pages: Vec<usize> = after.sources.iter().map(|s| s.page).collect();
    assert_eq!(before_pages, after_pages);
    assert_eq!(before.sources.len(), after.sources.len());
}

#[tokio::test]
async fn deleted_source_disappears_from_results() {
    let (embedding, generator) = services("answer [1]").await;
    let engine = engine_for(&embedding, &generator);

    ingest(
        &engine,
        "doomed.pdf",
        &["Transient content about calibration weights and balances."],
    )
    .await;

    let sources = engine.sources().await.unwrap();
    engine.delete(sources[0].id).await.unwrap();

    let answer = engine
        .query(
            QueryRequest::new("calibration weights and balances"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(answer.abstained);
    assert!(answer.sources.is_empty());
}

// ============================================================================
// Filters supplied by the caller
// ============================================================================

#[tokio::test]
async fn caller_source_filter_restricts_results() {
    let (embedding, generator) = services("answer [1]").await;
    let engine = engine_for(&embedding, &generator);

    ingest(&engine, "alpha.pdf", &["The alpha module handles injection timing."]).await;
    ingest(&engine, "beta.pdf", &["The beta module handles injection timing."]).await;

    let sources = engine.sources().await.unwrap();
    let alpha_id = sources
        .iter()
        .find(|s| s.name == "alpha.pdf")
        .unwrap()
        .id;

    let answer = engine
        .query(
            QueryRequest::new("which module handles injection timing").with_filters(
                MetadataFilters {
                    source_ids: Some(vec![alpha_id]),
                    ..Default::default()
                },
            ),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(!answer.sources.is_empty());
    for source in &answer.sources {
        assert_eq!(source.source_id, alpha_id);
    }
}

// ============================================================================
// Comprehensive profile
// ============================================================================

#[tokio::test]
async fn comprehensive_profile_returns_wider_results() {
    let (embedding, generator) = services("Wide answer [1].").await;
    let engine = engine_for(&embedding, &generator);

    // Many sources so the per-source cap does not bound the result count.
    for i in 0..12 {
        let name = format!("doc-{}.pdf", i);
        let page = format!(
            "Calibration procedure part {} covers the detector response factors.",
            i
        );
        ingest(&engine, &name, &[page.as_str()]).await;
    }

    let standard = engine
        .query(
            QueryRequest::new("calibration procedure detector response"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    let comprehensive = engine
        .query(
            QueryRequest::new("calibration procedure detector response")
                .with_profile(PipelineProfile::Comprehensive),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(comprehensive.sources.len() >= standard.sources.len());
    assert_eq!(comprehensive.stats.profile, PipelineProfile::Comprehensive);
}
