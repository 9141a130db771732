//! Analysis entity and DTA pipeline configuration (spec §3, §4.5).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-stage sampling parameters (spec §3: `temperature∈[0,2], top_p∈[0,1],
/// max_tokens≥1`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StageParams {
    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: u32,
}

impl StageParams {
    pub fn new(temperature: f64, top_p: f64, max_tokens: u32) -> Self {
        Self {
            temperature: temperature.clamp(0.0, 2.0),
            top_p: top_p.clamp(0.0, 1.0),
            max_tokens: max_tokens.max(1),
        }
    }
}

/// Configuration for a single pipeline stage (spec §4.5).
#[derive(Debug, Clone)]
pub struct StageConfig {
    pub model_name: String,
    pub system_prompt: String,
    pub params: StageParams,
}

/// Which evaluator-pluggable pre-filter redacts `transcript` before Stage 1
/// when `redact_pii` is set (an external collaborator per spec §1 Non-goals;
/// this trait is the seam it plugs into).
pub trait Redactor: Send + Sync {
    fn redact(&self, transcript: &str) -> String;
}

/// Identity redactor used when no external redaction pipeline is wired in.
pub struct NoopRedactor;

impl Redactor for NoopRedactor {
    fn redact(&self, transcript: &str) -> String {
        transcript.to_string()
    }
}

/// Inputs to a DTA pipeline run (spec §4.5).
#[derive(Debug, Clone)]
pub struct PipelineInput {
    pub transcript: String,
    pub title: Option<String>,
    pub tenant: String,
    pub creator: String,
    pub project: Option<String>,
    pub redact_pii: bool,
    pub stage_config: [StageConfig; 3],
    pub post_eval_ids: Option<Vec<String>>,
}

/// The stored, immutable-after-creation Analysis artifact (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    pub id: String,
    pub tenant: String,
    pub creator: String,
    pub project: Option<String>,
    pub transcript_title: Option<String>,
    pub transcript_input: String,
    pub pii_redacted: bool,
    pub facts_output: String,
    pub insights_output: String,
    pub summary_output: String,
    pub stage_params: HashMap<String, StageParams>,
    pub system_prompt: [String; 3],
    pub model: [String; 3],
    pub total_tokens: u32,
    pub total_cost: f64,
    pub total_duration_ms: u64,
    pub parent_trace_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_params_clamp_to_spec_ranges() {
        let params = StageParams::new(3.0, 1.5, 0);
        assert_eq!(params.temperature, 2.0);
        assert_eq!(params.top_p, 1.0);
        assert_eq!(params.max_tokens, 1);
    }
}
