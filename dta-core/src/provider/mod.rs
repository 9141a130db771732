//! Provider Adapter (C1) — see spec §4.1.

pub mod client;
pub mod types;

pub use client::{AnthropicClient, ClientConfig, LLMClient, MultiProviderClient, OpenAIClient};
#[cfg(feature = "gemini")]
pub use client::GoogleClient;
pub use types::{
    assemble_wire_params, effective_temperature, ChatMessage, ExecRequest, ExecResult,
    ParameterProfile, Pricing, Provider, ProviderFamily, ReasoningEffort, ResponseFormat, Role,
    SamplingParam, StopReason, TokenUsage,
};
