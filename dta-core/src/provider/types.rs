//! Neutral request/result types and per-model parameter-compatibility profiles
//! for the Provider Adapter (spec §4.1).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Upstream LLM provider identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Anthropic,
    OpenAI,
    Google,
}

impl Provider {
    pub fn env_prefix(&self) -> &'static str {
        match self {
            Provider::Anthropic => "anthropic",
            Provider::OpenAI => "openai",
            Provider::Google => "google",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            Provider::Anthropic => "https://api.anthropic.com",
            Provider::OpenAI => "https://api.openai.com",
            Provider::Google => "https://generativelanguage.googleapis.com",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.env_prefix())
    }
}

/// Tagged parameter-compatibility family a catalog entry belongs to (spec §6,
/// §9 "Provider heterogeneity").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderFamily {
    /// Legacy chat: output cap key `max_tokens`; temperature and top_p both accepted.
    P1,
    /// Newer chat: output cap key `max_completion_tokens`; temperature and top_p both accepted.
    P2,
    /// Reasoning: output cap key `max_completion_tokens`; temperature forced to 1.0;
    /// top_p omitted; accepts `reasoning_effort`.
    P3,
    /// Mutually-exclusive sampling: exactly one of temperature/top_p, prefer temperature.
    P4,
}

/// A sampling parameter the adapter may forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SamplingParam {
    Temperature,
    TopP,
    MaxTokens,
    ReasoningEffort,
}

/// Per-model-family record describing which sampling parameters are
/// supported, forced, or mutually exclusive, and which wire field names the
/// provider expects (spec §4.1 table).
#[derive(Debug, Clone)]
pub struct ParameterProfile {
    pub family: ProviderFamily,
    /// Wire field name carrying the output-token cap.
    pub max_tokens_name: &'static str,
    /// Parameters this family actually forwards.
    pub supported_params: Vec<SamplingParam>,
    /// Values forcibly set regardless of the caller's request.
    pub fixed_overrides: Vec<(SamplingParam, f64)>,
    /// Pairs at most one of which may appear on the wire.
    pub mutually_exclusive: Vec<(SamplingParam, SamplingParam)>,
    pub supports_response_format: bool,
}

impl ParameterProfile {
    pub fn for_family(family: ProviderFamily) -> Self {
        use SamplingParam::*;
        match family {
            ProviderFamily::P1 => Self {
                family,
                max_tokens_name: "max_tokens",
                supported_params: vec![Temperature, TopP, MaxTokens],
                fixed_overrides: vec![],
                mutually_exclusive: vec![],
                supports_response_format: true,
            },
            ProviderFamily::P2 => Self {
                family,
                max_tokens_name: "max_completion_tokens",
                supported_params: vec![Temperature, TopP, MaxTokens],
                fixed_overrides: vec![],
                mutually_exclusive: vec![],
                supports_response_format: true,
            },
            ProviderFamily::P3 => Self {
                family,
                max_tokens_name: "max_completion_tokens",
                supported_params: vec![Temperature, MaxTokens, ReasoningEffort],
                fixed_overrides: vec![(Temperature, 1.0)],
                mutually_exclusive: vec![],
                supports_response_format: false,
            },
            ProviderFamily::P4 => Self {
                family,
                max_tokens_name: "max_tokens",
                supported_params: vec![Temperature, TopP, MaxTokens],
                fixed_overrides: vec![],
                mutually_exclusive: vec![(Temperature, TopP)],
                supports_response_format: true,
            },
        }
    }
}

/// Reasoning-effort hint for Profile-P3 (reasoning) models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

/// Chat role for a message in an `ExecRequest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Structured-output hint (spec §4.1's `response_format?`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFormat {
    pub kind: String,
    pub schema: Option<serde_json::Value>,
}

/// Neutral execution request, independent of any single provider's wire format.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: u32,
    pub reasoning_effort: Option<ReasoningEffort>,
    pub response_format: Option<ResponseFormat>,
}

impl ExecRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: 0.7,
            top_p: 0.95,
            max_tokens: 1024,
            reasoning_effort: None,
            response_format: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        // spec.md §3: temperature in [0, 2] for stage_params.
        self.temperature = temperature.clamp(0.0, 2.0);
        self
    }

    pub fn with_top_p(mut self, top_p: f64) -> Self {
        self.top_p = top_p.clamp(0.0, 1.0);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens.max(1);
        self
    }

    pub fn with_reasoning_effort(mut self, effort: ReasoningEffort) -> Self {
        self.reasoning_effort = Some(effort);
        self
    }

    pub fn with_response_format(mut self, format: ResponseFormat) -> Self {
        self.response_format = Some(format);
        self
    }
}

/// Token usage for a single exec call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// Why the provider stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Stop,
    MaxTokens,
    ContentFilter,
    ToolUse,
}

/// Neutral execution result, parsed from whichever provider answered.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub content: String,
    pub usage: TokenUsage,
    pub input_cost: f64,
    pub output_cost: f64,
    pub total_cost: f64,
    pub duration_ms: u64,
    pub finish_reason: StopReason,
    pub model_version: String,
    pub provider_request_id: Option<String>,
}

impl ExecResult {
    pub fn total_tokens(&self) -> u32 {
        self.usage.total()
    }
}

/// Per-model wire-level parameter assembly order (spec §4.1):
/// (1) `{model, messages}` (2) apply fixed_overrides (3) forward requested
/// params that are supported, not overridden, and not blocked by a
/// mutually-exclusive rule (preferring temperature on conflict).
pub fn assemble_wire_params(
    request: &ExecRequest,
    profile: &ParameterProfile,
) -> HashMap<&'static str, serde_json::Value> {
    use SamplingParam::*;

    let mut forced: HashMap<SamplingParam, f64> = HashMap::new();
    for (param, value) in &profile.fixed_overrides {
        forced.insert(*param, *value);
    }

    let mut blocked: Vec<SamplingParam> = Vec::new();
    for (a, b) in &profile.mutually_exclusive {
        // Prefer temperature when both members of the pair are requested.
        if *a == Temperature || *b == Temperature {
            let other = if *a == Temperature { *b } else { *a };
            blocked.push(other);
        } else {
            blocked.push(*b);
        }
    }

    let mut out = HashMap::new();
    out.insert("model", serde_json::json!(request.model));

    let effective_temp = forced.get(&Temperature).copied().unwrap_or(request.temperature);
    if profile.supported_params.contains(&Temperature)
        && !blocked.contains(&Temperature)
    {
        out.insert("temperature", serde_json::json!(effective_temp));
    }

    let effective_top_p = forced.get(&TopP).copied().unwrap_or(request.top_p);
    if profile.supported_params.contains(&TopP) && !blocked.contains(&TopP) {
        out.insert("top_p", serde_json::json!(effective_top_p));
    }

    if profile.supported_params.contains(&MaxTokens) {
        out.insert(profile.max_tokens_name, serde_json::json!(request.max_tokens));
    }

    if profile.supported_params.contains(&ReasoningEffort) {
        if let Some(effort) = request.reasoning_effort {
            out.insert("reasoning_effort", serde_json::json!(effort));
        }
    }

    out
}

/// Per-million-token USD pricing, as carried by a Model Catalog entry and
/// consumed by the adapter's cost computation (spec §4.1).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Pricing {
    pub input_per_m: f64,
    pub output_per_m: f64,
}

impl Pricing {
    /// `cost = (input_tokens * input_price + output_tokens * output_price) / 1e6`,
    /// rounded to 1e-9 USD (spec §4.1).
    pub fn cost(&self, usage: TokenUsage) -> (f64, f64, f64) {
        let input_cost = round_to_nano(usage.input_tokens as f64 * self.input_per_m / 1e6);
        let output_cost = round_to_nano(usage.output_tokens as f64 * self.output_per_m / 1e6);
        let total = round_to_nano(input_cost + output_cost);
        (input_cost, output_cost, total)
    }
}

fn round_to_nano(value: f64) -> f64 {
    (value * 1e9).round() / 1e9
}

/// The effective temperature actually sent on the wire for this profile —
/// used to persist `stage_params.temperature` as the *effective* value
/// (spec §4.5 tie-break).
pub fn effective_temperature(request: &ExecRequest, profile: &ParameterProfile) -> f64 {
    profile
        .fixed_overrides
        .iter()
        .find(|(p, _)| *p == SamplingParam::Temperature)
        .map(|(_, v)| *v)
        .unwrap_or(request.temperature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temperature_clamps_to_spec_range() {
        let req = ExecRequest::new("m", vec![]).with_temperature(3.5);
        assert_eq!(req.temperature, 2.0);
        let req = ExecRequest::new("m", vec![]).with_temperature(-1.0);
        assert_eq!(req.temperature, 0.0);
    }

    #[test]
    fn profile_p3_forces_temperature_and_omits_top_p() {
        let profile = ParameterProfile::for_family(ProviderFamily::P3);
        let req = ExecRequest::new("reasoning-model", vec![])
            .with_temperature(0.2)
            .with_top_p(0.9)
            .with_max_tokens(500);
        let params = assemble_wire_params(&req, &profile);
        assert_eq!(params.get("temperature"), Some(&serde_json::json!(1.0)));
        assert!(!params.contains_key("top_p"));
        assert_eq!(params.get("max_completion_tokens"), Some(&serde_json::json!(500)));
        assert_eq!(effective_temperature(&req, &profile), 1.0);
    }

    #[test]
    fn profile_p4_prefers_temperature_over_top_p() {
        let profile = ParameterProfile::for_family(ProviderFamily::P4);
        let req = ExecRequest::new("m", vec![])
            .with_temperature(0.5)
            .with_top_p(0.8);
        let params = assemble_wire_params(&req, &profile);
        assert!(params.contains_key("temperature"));
        assert!(!params.contains_key("top_p"));
    }

    #[test]
    fn profile_p1_uses_max_tokens_key() {
        let profile = ParameterProfile::for_family(ProviderFamily::P1);
        let req = ExecRequest::new("m", vec![]).with_max_tokens(256);
        let params = assemble_wire_params(&req, &profile);
        assert_eq!(params.get("max_tokens"), Some(&serde_json::json!(256)));
        assert!(!params.contains_key("max_completion_tokens"));
    }

    #[test]
    fn pricing_cost_matches_scenario_s1() {
        // Scenario S1: in=100, out=50, input $1/M, output $2/M -> 0.0000200 per stage.
        let pricing = Pricing {
            input_per_m: 1.0,
            output_per_m: 2.0,
        };
        let (_, _, total) = pricing.cost(TokenUsage {
            input_tokens: 100,
            output_tokens: 50,
        });
        assert!((total - 0.0000200).abs() < 1e-9);
    }

    #[test]
    fn token_usage_total() {
        let usage = TokenUsage {
            input_tokens: 100,
            output_tokens: 50,
        };
        assert_eq!(usage.total(), 150);
    }
}
