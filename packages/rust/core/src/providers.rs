//! Embedding and generation collaborators.
//!
//! Both are plain async request/response calls behind traits so the indexer
//! and retriever can be driven by in-process fakes in tests. A provider
//! makes one attempt per call; [`embed_with_retry`] adds the timeout and
//! backoff shared by indexing and query embedding.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use sitekb_shared::{
    EmbeddingSettings, GenerationSettings, IndexConfig, Result, SiteKbError, read_api_key,
};
use tracing::{debug, instrument, warn};

const USER_AGENT: &str = concat!("SiteKB/", env!("CARGO_PKG_VERSION"));

const ANTHROPIC_MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

const SYSTEM_PROMPT: &str = "You answer questions about a website using only the numbered \
sources provided. Cite sources by their number. If the sources do not contain the answer, say so.";

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Turns texts into fixed-length vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier, recorded in the generation manifest.
    fn model(&self) -> &str;

    /// Embed `texts`, returning one vector per input in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Options passed through to the language model.
#[derive(Debug, Clone)]
pub struct GenerationOptions {
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self::from(&GenerationSettings::default())
    }
}

impl From<&GenerationSettings> for GenerationOptions {
    fn from(settings: &GenerationSettings) -> Self {
        Self {
            max_tokens: settings.max_tokens,
            temperature: settings.temperature,
        }
    }
}

/// Produces an answer from assembled context and the raw question.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    async fn generate(
        &self,
        context: &str,
        question: &str,
        options: &GenerationOptions,
    ) -> Result<String>;
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// Attempts, backoff and per-attempt timeout for embedding calls.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&IndexConfig::default())
    }
}

impl From<&IndexConfig> for RetryPolicy {
    fn from(config: &IndexConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff_ms: config.backoff_ms,
            request_timeout_secs: config.request_timeout_secs,
        }
    }
}

/// Embed `texts`, retrying with exponential backoff
/// (`backoff_ms * 2^(attempt-1)`). Each attempt is bounded by
/// `request_timeout_secs`; a response with the wrong vector count counts as
/// a failed attempt. `label` names the call in logs and the final error.
pub async fn embed_with_retry(
    provider: &dyn EmbeddingProvider,
    texts: &[String],
    policy: &RetryPolicy,
    label: &str,
) -> Result<Vec<Vec<f32>>> {
    let attempts = policy.max_attempts.max(1);
    let timeout = Duration::from_secs(policy.request_timeout_secs.max(1));
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        let outcome = match tokio::time::timeout(timeout, provider.embed(texts)).await {
            Ok(Ok(vectors)) if vectors.len() == texts.len() => return Ok(vectors),
            Ok(Ok(vectors)) => format!(
                "provider returned {} vectors for {} inputs",
                vectors.len(),
                texts.len()
            ),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {}s", timeout.as_secs()),
        };

        warn!(call = label, attempt, error = %outcome, "embedding call failed");
        last_error = outcome;

        if attempt < attempts {
            let backoff = policy.backoff_ms.saturating_mul(1 << (attempt - 1).min(10));
            tokio::time::sleep(Duration::from_millis(backoff)).await;
        }
    }

    Err(SiteKbError::Provider(format!(
        "{label} failed after {attempts} attempts: {last_error}"
    )))
}

// ---------------------------------------------------------------------------
// OpenAI-compatible embeddings
// ---------------------------------------------------------------------------

/// Client for any `/embeddings` endpoint speaking the OpenAI wire format
/// (OpenAI, Ollama, vLLM, LM Studio, ...).
#[derive(Debug, Clone)]
pub struct HttpEmbedder {
    client: Client,
    endpoint: String,
    model: String,
}

impl HttpEmbedder {
    /// `api_key` may be `None` for local servers that do not check it.
    pub fn new(
        base_url: &str,
        model: &str,
        api_key: Option<&str>,
        request_timeout_secs: u64,
    ) -> Result<Self> {
        if model.trim().is_empty() {
            return Err(SiteKbError::config("embedding model name is empty"));
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = api_key {
            let auth = format!("Bearer {}", key.trim());
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&auth)
                    .map_err(|_| SiteKbError::config("invalid embedding API key"))?,
            );
        }

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .timeout(Duration::from_secs(request_timeout_secs.max(1)))
            .build()
            .map_err(|e| SiteKbError::Provider(format!("failed to build embedding client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", base_url.trim_end_matches('/')),
            model: model.to_string(),
        })
    }

    /// Build from the `[embedding]` config section, reading the key from its
    /// env var when set.
    pub fn from_settings(settings: &EmbeddingSettings) -> Result<Self> {
        let key = read_api_key(&settings.api_key_env).ok();
        if key.is_none() {
            debug!(var = %settings.api_key_env, "no embedding API key set, sending unauthenticated");
        }
        Self::new(
            &settings.base_url,
            &settings.model,
            key.as_deref(),
            settings.request_timeout_secs,
        )
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[async_trait]
impl EmbeddingProvider for HttpEmbedder {
    fn model(&self) -> &str {
        &self.model
    }

    #[instrument(skip_all, fields(inputs = texts.len()))]
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(&self.endpoint)
            .json(&EmbeddingRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await
            .map_err(|e| SiteKbError::Provider(format!("{}: {e}", self.endpoint)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(SiteKbError::Provider(format!(
                "embeddings request failed ({status}): {body}"
            )));
        }

        let mut parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| SiteKbError::Provider(format!("invalid embeddings response: {e}")))?;
        parsed.data.sort_by_key(|d| d.index);

        if parsed.data.len() != texts.len() {
            return Err(SiteKbError::Provider(format!(
                "embeddings endpoint returned {} vectors for {} inputs",
                parsed.data.len(),
                texts.len()
            )));
        }
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

// ---------------------------------------------------------------------------
// Anthropic Messages API
// ---------------------------------------------------------------------------

/// Generation via the Anthropic Messages API.
#[derive(Debug, Clone)]
pub struct AnthropicGenerator {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl AnthropicGenerator {
    pub fn new(api_key: &str, model: &str, request_timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(request_timeout_secs.max(1)))
            .build()
            .map_err(|e| SiteKbError::Provider(format!("failed to build Anthropic client: {e}")))?;

        Ok(Self {
            client,
            endpoint: ANTHROPIC_MESSAGES_URL.to_string(),
            api_key: api_key.trim().to_string(),
            model: model.to_string(),
        })
    }

    pub fn from_settings(settings: &GenerationSettings) -> Result<Self> {
        let key = read_api_key(&settings.api_key_env)?;
        Self::new(&key, &settings.model, settings.request_timeout_secs)
    }

    /// Point the client at a different messages endpoint (proxies, tests).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    system: &'a str,
    messages: Vec<AnthropicMessage>,
}

#[derive(Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicResponseBlock>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicResponseBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[async_trait]
impl GenerationProvider for AnthropicGenerator {
    #[instrument(skip_all, fields(model = %self.model, context_chars = context.len()))]
    async fn generate(
        &self,
        context: &str,
        question: &str,
        options: &GenerationOptions,
    ) -> Result<String> {
        let api_key = HeaderValue::from_str(&self.api_key)
            .map_err(|_| SiteKbError::config("invalid Anthropic API key"))?;

        let body = AnthropicRequest {
            model: &self.model,
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            system: SYSTEM_PROMPT,
            messages: vec![AnthropicMessage {
                role: "user",
                content: format!("Sources:\n\n{context}\n\nQuestion: {question}"),
            }],
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| SiteKbError::Provider(format!("Anthropic request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(SiteKbError::Provider(format!("Anthropic returned {status}: {text}")));
        }

        let parsed: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| SiteKbError::Provider(format!("invalid Anthropic response: {e}")))?;

        let answer = parsed
            .content
            .into_iter()
            .filter_map(|block| match block {
                AnthropicResponseBlock::Text { text } => Some(text),
                AnthropicResponseBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("\n");

        if answer.trim().is_empty() {
            return Err(SiteKbError::Provider("Anthropic response had no text content".into()));
        }
        Ok(answer)
    }
}
