//! Provider Adapter (C1): translates a neutral `ExecRequest` into each
//! provider's wire format, honors parameter-compatibility profiles, and
//! parses the response back into tokens/cost/latency.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::{Error, Result};
use crate::provider::types::{
    assemble_wire_params, effective_temperature, ExecRequest, ExecResult, ParameterProfile,
    Pricing, Provider, Role, StopReason, TokenUsage,
};

/// Per-provider transport settings. Deliberately carries no credential: the
/// Credential Vault (C2) resolves a tenant-scoped `api_key` fresh for every
/// call, and the Adapter never caches or decides which key to use.
#[derive(Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub timeout: Duration,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(120),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

fn build_http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// The Provider Adapter contract (spec §4.1). Implementations must have no
/// side effects beyond the outbound HTTP call.
#[async_trait]
pub trait LLMClient: Send + Sync {
    async fn execute(
        &self,
        api_key: &str,
        request: &ExecRequest,
        profile: &ParameterProfile,
        pricing: Pricing,
    ) -> Result<ExecResult>;

    fn provider(&self) -> Provider;
}

/// Anthropic Messages API (`/v1/messages`), Profile P1/P4-shaped families.
pub struct AnthropicClient {
    http: reqwest::Client,
    config: ClientConfig,
}

impl AnthropicClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            http: build_http_client(config.timeout),
            config,
        }
    }
}

#[derive(Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct AnthropicResponseBody {
    content: Vec<AnthropicContentBlock>,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
    model: Option<String>,
    id: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicContentBlock {
    #[serde(rename = "type")]
    #[allow(dead_code)]
    kind: String,
    text: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[async_trait]
impl LLMClient for AnthropicClient {
    #[instrument(skip(self, api_key, request), fields(model = %request.model, provider = "anthropic"))]
    async fn execute(
        &self,
        api_key: &str,
        request: &ExecRequest,
        profile: &ParameterProfile,
        pricing: Pricing,
    ) -> Result<ExecResult> {
        let params = assemble_wire_params(request, profile);

        let system = request
            .messages
            .iter()
            .find(|m| matches!(m.role, Role::System))
            .map(|m| m.content.clone());
        let messages: Vec<AnthropicMessage> = request
            .messages
            .iter()
            .filter(|m| !matches!(m.role, Role::System))
            .map(|m| AnthropicMessage {
                role: if matches!(m.role, Role::Assistant) {
                    "assistant"
                } else {
                    "user"
                },
                content: m.content.clone(),
            })
            .collect();

        let mut body = serde_json::json!({
            "model": request.model,
            "messages": messages,
        });
        if let Some(system) = system {
            body["system"] = serde_json::json!(system);
        }
        for (key, value) in params.iter() {
            if *key != "model" {
                body[*key] = value.clone();
            }
        }

        let url = format!("{}/v1/messages", self.config.base_url);
        let start = Instant::now();
        let response = self
            .http
            .post(&url)
            .header("x-api-key", api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport_error("anthropic", 1, e))?;
        let duration_ms = start.elapsed().as_millis() as u64;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(Error::auth_error("anthropic", status.to_string()));
        }
        if status.is_server_error() {
            return Err(Error::transient("anthropic", 1, status.to_string()));
        }
        if status.is_client_error() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::provider_error("anthropic", format!("{status}: {text}")));
        }

        let parsed: AnthropicResponseBody = response
            .json()
            .await
            .map_err(|e| Error::provider_error("anthropic", e.to_string()))?;

        let content = parsed
            .content
            .into_iter()
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");
        if content.is_empty() {
            return Err(Error::provider_error("anthropic", "empty response content"));
        }

        let usage = TokenUsage {
            input_tokens: parsed.usage.input_tokens,
            output_tokens: parsed.usage.output_tokens,
        };
        let (input_cost, output_cost, total_cost) = pricing.cost(usage);

        debug!(duration_ms, total_tokens = usage.total(), "anthropic call completed");

        Ok(ExecResult {
            content,
            usage,
            input_cost,
            output_cost,
            total_cost,
            duration_ms,
            finish_reason: map_stop_reason(parsed.stop_reason.as_deref()),
            model_version: parsed.model.unwrap_or_else(|| request.model.clone()),
            provider_request_id: parsed.id,
        })
    }

    fn provider(&self) -> Provider {
        Provider::Anthropic
    }
}

/// OpenAI-compatible Chat Completions API (`/v1/chat/completions`).
pub struct OpenAIClient {
    http: reqwest::Client,
    config: ClientConfig,
}

impl OpenAIClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            http: build_http_client(config.timeout),
            config,
        }
    }
}

#[derive(Deserialize)]
struct OpenAIResponseBody {
    choices: Vec<OpenAIChoice>,
    usage: OpenAIUsage,
    model: Option<String>,
    id: Option<String>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAIMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAIUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[async_trait]
impl LLMClient for OpenAIClient {
    #[instrument(skip(self, api_key, request), fields(model = %request.model, provider = "openai"))]
    async fn execute(
        &self,
        api_key: &str,
        request: &ExecRequest,
        profile: &ParameterProfile,
        pricing: Pricing,
    ) -> Result<ExecResult> {
        let params = assemble_wire_params(request, profile);

        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                };
                serde_json::json!({ "role": role, "content": m.content })
            })
            .collect();

        let mut body = serde_json::json!({ "messages": messages });
        for (key, value) in params.iter() {
            body[*key] = value.clone();
        }

        let url = format!("{}/v1/chat/completions", self.config.base_url);
        let start = Instant::now();
        let response = self
            .http
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport_error("openai", 1, e))?;
        let duration_ms = start.elapsed().as_millis() as u64;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(Error::auth_error("openai", status.to_string()));
        }
        if status.is_server_error() {
            return Err(Error::transient("openai", 1, status.to_string()));
        }
        if status.is_client_error() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::provider_error("openai", format!("{status}: {text}")));
        }

        let parsed: OpenAIResponseBody = response
            .json()
            .await
            .map_err(|e| Error::provider_error("openai", e.to_string()))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::provider_error("openai", "no choices in response"))?;
        let content = choice.message.content.unwrap_or_default();
        if content.is_empty() {
            return Err(Error::provider_error("openai", "empty response content"));
        }

        let usage = TokenUsage {
            input_tokens: parsed.usage.prompt_tokens,
            output_tokens: parsed.usage.completion_tokens,
        };
        let (input_cost, output_cost, total_cost) = pricing.cost(usage);

        Ok(ExecResult {
            content,
            usage,
            input_cost,
            output_cost,
            total_cost,
            duration_ms,
            finish_reason: map_stop_reason(choice.finish_reason.as_deref()),
            model_version: parsed.model.unwrap_or_else(|| request.model.clone()),
            provider_request_id: parsed.id,
        })
    }

    fn provider(&self) -> Provider {
        Provider::OpenAI
    }
}

/// Google Generative Language API (`generateContent`).
#[cfg(feature = "gemini")]
pub struct GoogleClient {
    http: reqwest::Client,
    config: ClientConfig,
}

#[cfg(feature = "gemini")]
impl GoogleClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            http: build_http_client(config.timeout),
            config,
        }
    }
}

#[cfg(feature = "gemini")]
#[derive(Deserialize)]
struct GoogleResponseBody {
    candidates: Vec<GoogleCandidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: GoogleUsage,
}

#[cfg(feature = "gemini")]
#[derive(Deserialize)]
struct GoogleCandidate {
    content: GoogleContent,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[cfg(feature = "gemini")]
#[derive(Deserialize)]
struct GoogleContent {
    parts: Vec<GooglePart>,
}

#[cfg(feature = "gemini")]
#[derive(Deserialize)]
struct GooglePart {
    text: Option<String>,
}

#[cfg(feature = "gemini")]
#[derive(Deserialize)]
struct GoogleUsage {
    #[serde(rename = "promptTokenCount")]
    prompt_token_count: u32,
    #[serde(rename = "candidatesTokenCount")]
    candidates_token_count: u32,
}

#[cfg(feature = "gemini")]
#[async_trait]
impl LLMClient for GoogleClient {
    #[instrument(skip(self, api_key, request), fields(model = %request.model, provider = "google"))]
    async fn execute(
        &self,
        api_key: &str,
        request: &ExecRequest,
        profile: &ParameterProfile,
        pricing: Pricing,
    ) -> Result<ExecResult> {
        let params = assemble_wire_params(request, profile);

        let system = request
            .messages
            .iter()
            .find(|m| matches!(m.role, Role::System))
            .map(|m| m.content.clone());
        let contents: Vec<serde_json::Value> = request
            .messages
            .iter()
            .filter(|m| !matches!(m.role, Role::System))
            .map(|m| {
                let role = if matches!(m.role, Role::Assistant) { "model" } else { "user" };
                serde_json::json!({ "role": role, "parts": [{ "text": m.content }] })
            })
            .collect();

        let mut generation_config = serde_json::json!({});
        if let Some(t) = params.get("temperature") {
            generation_config["temperature"] = t.clone();
        }
        if let Some(p) = params.get("top_p") {
            generation_config["topP"] = p.clone();
        }
        generation_config["maxOutputTokens"] = serde_json::json!(request.max_tokens);

        let mut body = serde_json::json!({
            "contents": contents,
            "generationConfig": generation_config,
        });
        if let Some(system) = system {
            body["systemInstruction"] = serde_json::json!({ "parts": [{ "text": system }] });
        }

        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.config.base_url, request.model, api_key
        );
        let start = Instant::now();
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport_error("google", 1, e))?;
        let duration_ms = start.elapsed().as_millis() as u64;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(Error::auth_error("google", status.to_string()));
        }
        if status.is_server_error() {
            return Err(Error::transient("google", 1, status.to_string()));
        }
        if status.is_client_error() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::provider_error("google", format!("{status}: {text}")));
        }

        let parsed: GoogleResponseBody = response
            .json()
            .await
            .map_err(|e| Error::provider_error("google", e.to_string()))?;

        let candidate = parsed
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| Error::provider_error("google", "no candidates in response"))?;
        let content = candidate
            .content
            .parts
            .into_iter()
            .filter_map(|p| p.text)
            .collect::<Vec<_>>()
            .join("");
        if content.is_empty() {
            return Err(Error::provider_error("google", "empty response content"));
        }

        let usage = TokenUsage {
            input_tokens: parsed.usage_metadata.prompt_token_count,
            output_tokens: parsed.usage_metadata.candidates_token_count,
        };
        let (input_cost, output_cost, total_cost) = pricing.cost(usage);

        Ok(ExecResult {
            content,
            usage,
            input_cost,
            output_cost,
            total_cost,
            duration_ms,
            finish_reason: map_stop_reason(candidate.finish_reason.as_deref()),
            model_version: request.model.clone(),
            provider_request_id: None,
        })
    }

    fn provider(&self) -> Provider {
        Provider::Google
    }
}

fn map_stop_reason(raw: Option<&str>) -> StopReason {
    match raw {
        Some("end_turn") | Some("stop") | Some("STOP") => StopReason::Stop,
        Some("max_tokens") | Some("length") | Some("MAX_TOKENS") => StopReason::MaxTokens,
        Some("content_filter") | Some("SAFETY") => StopReason::ContentFilter,
        Some("tool_use") | Some("tool_calls") => StopReason::ToolUse,
        _ => StopReason::Stop,
    }
}

/// Classify a `reqwest` transport failure per spec §4.1: connection/timeout
/// errors are transient and retryable.
fn classify_transport_error(provider: &str, attempt: u32, err: reqwest::Error) -> Error {
    if err.is_timeout() || err.is_connect() {
        Error::transient(provider, attempt, err.to_string())
    } else {
        Error::provider_error(provider, err.to_string())
    }
}

/// Aggregates one `LLMClient` per `Provider`, dispatching by the model's
/// catalog-resolved provider.
#[derive(Clone, Default)]
pub struct MultiProviderClient {
    clients: HashMap<Provider, Arc<dyn LLMClient>>,
}

impl MultiProviderClient {
    pub fn new() -> Self {
        Self {
            clients: HashMap::new(),
        }
    }

    pub fn with_client(mut self, provider: Provider, client: Arc<dyn LLMClient>) -> Self {
        self.clients.insert(provider, client);
        self
    }

    pub fn get_client(&self, provider: Provider) -> Option<Arc<dyn LLMClient>> {
        self.clients.get(&provider).cloned()
    }

    pub async fn execute(
        &self,
        provider: Provider,
        api_key: &str,
        request: &ExecRequest,
        profile: &ParameterProfile,
        pricing: Pricing,
    ) -> Result<ExecResult> {
        let client = self
            .get_client(provider)
            .ok_or_else(|| Error::provider_error(provider.to_string(), "no client configured"))?;
        client.execute(api_key, request, profile, pricing).await
    }
}
