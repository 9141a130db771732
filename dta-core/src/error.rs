//! Error types for dta-core.

use thiserror::Error;

/// Result type alias using dta-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running the DTA pipeline or judge engine.
#[derive(Error, Debug)]
pub enum Error {
    /// Model name not present, inactive, or deprecated-and-blocked in the catalog.
    #[error("unknown model: {0}")]
    UnknownModel(String),

    /// No active credential could be resolved for a (tenant, provider, project) scope.
    #[error("no credential available for provider {provider} (tenant {tenant})")]
    NoCredential { tenant: String, provider: String },

    /// Provider rejected the request's authentication.
    #[error("authentication error with provider {provider}: {message}")]
    AuthError { provider: String, message: String },

    /// Connection/5xx/timeout from a provider; caller may retry.
    #[error("transient error from provider {provider} (attempt {attempt}): {message}")]
    TransientError {
        provider: String,
        attempt: u32,
        message: String,
    },

    /// 4xx from a provider (invalid arguments, model not found); fatal, not retried.
    #[error("provider error from {provider}: {message}")]
    ProviderError { provider: String, message: String },

    /// A DTA pipeline stage aborted after exhausting its retry budget.
    #[error("pipeline failed at stage {stage}: {message}")]
    PipelineError { stage: u8, message: String },

    /// Judge response could not be parsed even after the auto-repair chain.
    #[error("judge response parse error at {call}: {message}")]
    JudgeParseError { call: String, message: String },

    /// The two analyses submitted to the judge do not share byte-equal transcript input.
    #[error("transcript mismatch between analyses {a} and {b}")]
    TranscriptMismatch { a: String, b: String },

    /// The two analyses submitted to the judge belong to different tenants.
    #[error("cross-tenant comparison rejected: {a_tenant} != {b_tenant}")]
    CrossTenant { a_tenant: String, b_tenant: String },

    /// The same analysis id was submitted for both sides of a comparison.
    #[error("cannot compare analysis {0} against itself")]
    SameAnalysis(String),

    /// A comparison already exists for this (tenant, unordered pair, judge_model).
    #[error("duplicate comparison: {existing_id} already covers this pair and judge model")]
    DuplicateConflict { existing_id: String },

    /// A blocking operation exceeded its configured timeout.
    #[error("operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Caller cancelled an in-flight operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Storage (SQLite) error.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Outbound HTTP transport error not otherwise classified.
    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration is missing or invalid (exit code 64 when surfaced to a process).
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn unknown_model(model: impl Into<String>) -> Self {
        Self::UnknownModel(model.into())
    }

    pub fn no_credential(tenant: impl Into<String>, provider: impl Into<String>) -> Self {
        Self::NoCredential {
            tenant: tenant.into(),
            provider: provider.into(),
        }
    }

    pub fn auth_error(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::AuthError {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn transient(provider: impl Into<String>, attempt: u32, message: impl Into<String>) -> Self {
        Self::TransientError {
            provider: provider.into(),
            attempt,
            message: message.into(),
        }
    }

    pub fn provider_error(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProviderError {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn pipeline(stage: u8, message: impl Into<String>) -> Self {
        Self::PipelineError {
            stage,
            message: message.into(),
        }
    }

    pub fn judge_parse(call: impl Into<String>, message: impl Into<String>) -> Self {
        Self::JudgeParseError {
            call: call.into(),
            message: message.into(),
        }
    }

    pub fn duplicate_conflict(existing_id: impl Into<String>) -> Self {
        Self::DuplicateConflict {
            existing_id: existing_id.into(),
        }
    }

    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// POSIX-style exit code for process surfaces (spec §6).
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) => 64,
            Error::Storage(_) => 74,
            Error::ProviderError { .. }
            | Error::TransientError { .. }
            | Error::Http(_)
            | Error::AuthError { .. } => 75,
            _ => 1,
        }
    }
}
