//! Evaluator configuration and result types (spec §4.8).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A registered evaluator variant (spec §4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Evaluator {
    LLMJudge {
        model: String,
        criteria: Vec<String>,
        threshold: f64,
    },
    RuleBased {
        rule_id: String,
        config: Value,
    },
    Heuristic {
        implementation_ref: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationStatus {
    Ok,
    Error,
}

/// One evaluator's outcome against a trace/analysis (spec §4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub id: String,
    pub trace_id: String,
    pub analysis_id: Option<String>,
    pub evaluator_id: String,
    pub status: EvaluationStatus,
    pub score: Option<f64>,
    pub passed: Option<bool>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}
