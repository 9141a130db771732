//! Trace and Span entities (spec §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of a trace or span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
    Timeout,
    Cancelled,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::Error => "error",
            Status::Timeout => "timeout",
            Status::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "error" => Status::Error,
            "timeout" => Status::Timeout,
            "cancelled" => Status::Cancelled,
            _ => Status::Ok,
        }
    }
}

/// Required value of `trace_metadata.source` (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceSource {
    DtaPipeline,
    Judge,
    Evaluation,
    Playground,
}

impl TraceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceSource::DtaPipeline => "dta_pipeline",
            TraceSource::Judge => "judge",
            TraceSource::Evaluation => "evaluation",
            TraceSource::Playground => "playground",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanType {
    Llm,
    Tool,
    Workflow,
}

/// An observability parent trace (spec §3). Owns itself: a business entity
/// (Analysis, Comparison) holds only `id` and looks this up on demand (spec
/// §9, "Cross-entity weak references").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    pub id: String,
    pub otel_trace_id: String,
    pub name: String,
    pub status: Status,
    pub input_data: Value,
    pub output_data: Value,
    pub trace_metadata: Value,
    pub total_tokens: u32,
    pub total_cost: f64,
    pub total_duration_ms: u64,
    pub model_name: Option<String>,
    pub provider: Option<String>,
    pub created_at: DateTime<Utc>,
    pub closed: bool,
}

/// A child span of a trace (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    pub id: String,
    pub otel_span_id: String,
    pub parent_span_id: Option<String>,
    pub trace_id: String,
    pub name: String,
    pub span_type: SpanType,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: Status,
    pub model_name: Option<String>,
    pub model_params: Value,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_cost: f64,
    pub duration_ms: Option<u64>,
    pub attempt_count: u32,
    pub closed: bool,
}

impl Span {
    pub fn total_tokens(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}
