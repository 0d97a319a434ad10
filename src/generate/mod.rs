//! Generator client: the chat-model collaborator that turns an assembled
//! prompt into answer text.
//!
//! Request shape: `{ model, messages: [{role, content}], stream: false,
//! options: {...} }`; response shape: `{ message: { content } }`. Sampling
//! options come from the per-query-type table; the comprehensive profile
//! widens output and context budgets and its own timeout. Responses are
//! cached by (model, query type, prompt hash). Any transport error
//! surfaces as [`EngineError::GenerationUnavailable`]; no substitute text
//! is ever fabricated.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::{hash_key, TtlCache};
use crate::config::{GeneratorConfig, ProfileParams, SamplingParams};
use crate::types::{EngineError, PipelineProfile, QueryType, Result};

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    num_predict: i32,
    temperature: f32,
    top_p: f32,
    top_k: i32,
    repeat_penalty: f32,
    num_ctx: i32,
}

impl From<SamplingParams> for ChatOptions {
    fn from(params: SamplingParams) -> Self {
        Self {
            num_predict: params.num_predict,
            temperature: params.temperature,
            top_p: params.top_p,
            top_k: params.top_k,
            repeat_penalty: params.repeat_penalty,
            num_ctx: params.num_ctx,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ChatResponseMessage,
}

/// HTTP chat client with query-type-tuned sampling and a response cache.
pub struct GeneratorClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    config: GeneratorConfig,
    cache: Arc<TtlCache<String>>,
}

impl GeneratorClient {
    /// Create a client for the given service endpoint and model.
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        config: GeneratorConfig,
        cache: Arc<TtlCache<String>>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder().build().map_err(|e| {
            EngineError::GenerationUnavailable(format!("failed to build http client: {}", e))
        })?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            config,
            cache,
        })
    }

    /// The model identifier this client is pinned to.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Generate answer text for a fully built prompt.
    pub async fn generate(
        &self,
        prompt: &str,
        query_type: QueryType,
        params: &ProfileParams,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let key = hash_key(&[&self.model, query_type.as_str(), prompt]);
        if let Some(cached) = self.cache.get(&key) {
            debug!("generator response served from cache");
            return Ok(cached);
        }

        let comprehensive = params.profile == PipelineProfile::Comprehensive;
        let sampling = self.config.sampling_for(query_type, comprehensive);

        let text = tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            outcome = self.request(prompt, sampling, params.generator_timeout) => outcome?,
        };

        if !cancel.is_cancelled() {
            self.cache
                .insert_with_ttl(&key, text.clone(), params.response_ttl);
        }
        Ok(text)
    }

    async fn request(
        &self,
        prompt: &str,
        sampling: SamplingParams,
        timeout: Duration,
    ) -> Result<String> {
        let url = format!("{}/api/chat", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            stream: false,
            options: sampling.into(),
        };

        let response = self
            .http
            .post(&url)
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::GenerationUnavailable(format!("request error: {}", e)))?
            .error_for_status()
            .map_err(|e| EngineError::GenerationUnavailable(format!("status error: {}", e)))?;

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| EngineError::GenerationUnavailable(format!("decode error: {}", e)))?;
        Ok(parsed.message.content)
    }
}

// ============================================================================
// Tests
// ============================================================================
