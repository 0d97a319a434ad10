//! Concurrency behavior: independent sources ingest in parallel, readers
//! are never blocked by writers, and only ready sources are searchable.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use quarry::types::SourceKind;
use quarry::{Engine, EngineConfig, QueryRequest, SourceDescriptor};

const DIM: usize = 32;

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
        vector[0] += 0.1;

        ResponseTemplate::new(200).set_body_json(serde_json::json!({ "embedding": vector }))
    }
}

async fn engine_with_services() -> (Engine, MockServer, MockServer) {
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
            "message": { "content": "Grounded answer [1]." }
        })))
        .mount(&generator)
        .await;

    let mut config = EngineConfig::default();
    config.services.embedding_url = embedding.uri();
    config.services.generator_url = generator.uri();
    config.embedding.dimension = DIM;
    config.embedding.retries = 0;
    config.embedding.timeout_secs = 5;
    config.chunking.definition_microchunks = false;

    (Engine::new(config).unwrap(), embedding, generator)
}

#[tokio::test]
async fn concurrent_ingests_all_reach_ready() {
    let (engine, _embedding, _generator) = engine_with_services().await;
    let engine = Arc::new(engine);
    let cancel = CancellationToken::new();

    let mut handles = Vec::new();
    for i in 0..8 {
        let engine = Arc::clone(&engine);
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            engine
                .ingest(
                    SourceDescriptor {
                        name: format!("doc-{}.pdf", i),
                        kind: SourceKind::File,
                    },
                    vec![format!(
                        "Independent source number {} describes the detector alignment steps.",
                        i
                    )],
                    &cancel,
                )
                .await
        }));
    }

    for handle in handles {
        let source = handle.await.unwrap().unwrap();
        assert_eq!(source.chunk_count, 1);
        assert_eq!(source.embedding_count, 1);
    }

    let sources = engine.sources().await.unwrap();
    assert_eq!(sources.len(), 8);
    assert!(sources
        .iter()
        .all(|s| s.state == quarry::types::ProcessingState::Ready));
}

#[tokio::test]
async fn concurrent_queries_share_the_engine() {
    let (engine, _embedding, _generator) = engine_with_services().await;
    let engine = Arc::new(engine);
    let cancel = CancellationToken::new();

    engine
        .ingest(
            SourceDescriptor {
                name: "manual.pdf".to_string(),
                kind: SourceKind::File,
            },
            vec![
                "Detector alignment requires the reference cell to warm up first.".to_string(),
                "The autosampler tray holds one hundred vials in four quadrants.".to_string(),
            ],
            &cancel,
        )
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..6 {
        let engine = Arc::clone(&engine);
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            engine
                .query(
                    QueryRequest::new("how does detector alignment start"),
                    &cancel,
                )
                .await
        }));
    }

    let mut answers = Vec::new();
    for handle in handles {
        answers.push(handle.await.unwrap().unwrap());
    }

    // All callers see the same ranking (cache or not).
    let reference: Vec<u64> = answers[0].sources.iter().map(|s| s.chunk_id).collect();
    for answer in &answers[1..] {
        let ids: Vec<u64> = answer.sources.iter().map(|s| s.chunk_id).collect();
        assert_eq!(ids, reference);
    }
}
