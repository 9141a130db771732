//! # dta-core
//!
//! Core library for the Dual-Track Analysis (DTA) service: a 3-stage
//! transcript analysis pipeline (facts → insights → summary) plus a
//! blind LLM-judge engine for comparing two analyses against each other.
//!
//! ## Core Components
//!
//! - **Provider Adapter** ([`provider`]): uniform request/response shape across
//!   Anthropic, OpenAI, and Google chat-completion APIs.
//! - **Credential Vault** ([`credential`]): encrypted, tenant-scoped API key storage.
//! - **Model Catalog** ([`catalog`]): known models, pricing, and parameter profiles.
//! - **Trace Recorder** ([`trace`]): parent/span execution traces.
//! - **DTA Pipeline** ([`pipeline`]): the 3-stage analysis engine.
//! - **Judge Engine** ([`judge`]): blind A/B comparison of two analyses.
//! - **Comparison Store & Duplicate Guard** ([`comparison`]): dedup'd comparison persistence.
//! - **Evaluation Hook** ([`evaluation`]): optional post-pipeline evaluator dispatch.

pub mod catalog;
pub mod comparison;
pub mod config;
pub mod credential;
pub mod error;
pub mod evaluation;
pub mod judge;
pub mod pipeline;
pub mod provider;
pub mod trace;

pub use catalog::{CatalogEntry, ModelCatalog};
pub use comparison::{ComparisonStore, DuplicateGuard};
pub use config::{Config, ProviderConfig, StageWeights};
pub use credential::{Credential, CredentialHandle, CredentialVault};
pub use error::{Error, Result};
pub use evaluation::{EvaluationHook, EvaluationResult, EvaluationResultStore, EvaluationStatus, Evaluator};
pub use judge::{Comparison, ComparisonInput, ComparisonMetadata, JudgeEngine, StageVerdict, Winner};
pub use pipeline::{
    delete_analysis_cascading, Analysis, NoopRedactor, PipelineEngine, PipelineInput, Redactor,
    StageConfig, StageParams,
};
pub use provider::{
    assemble_wire_params, effective_temperature, AnthropicClient, ChatMessage, ClientConfig,
    ExecRequest, ExecResult, LLMClient, MultiProviderClient, OpenAIClient, ParameterProfile,
    Pricing, Provider, ProviderFamily, ReasoningEffort, ResponseFormat, Role, SamplingParam,
    StopReason, TokenUsage,
};
#[cfg(feature = "gemini")]
pub use provider::GoogleClient;
pub use trace::{ParentHandle, Span, SpanHandle, SpanType, Status, Trace, TraceRecorder, TraceSource};
