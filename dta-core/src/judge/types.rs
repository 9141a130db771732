//! Comparison entity and judge verdict types (spec §3, §4.6).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which side a judge call favored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Winner {
    A,
    B,
    Tie,
}

impl Winner {
    pub fn from_wire(raw: &str) -> Option<Self> {
        match raw {
            "A" | "a" => Some(Winner::A),
            "B" | "b" => Some(Winner::B),
            "tie" | "Tie" | "TIE" => Some(Winner::Tie),
            _ => None,
        }
    }
}

/// A single judge call's verdict: winner, per-criterion scores for both
/// blind labels, and free-form reasoning (spec §4.6 schema).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageVerdict {
    pub winner: Winner,
    pub scores_a: HashMap<String, f64>,
    pub scores_b: HashMap<String, f64>,
    pub reasoning: String,
}

/// Inputs to a judge run (spec §4.6).
#[derive(Debug, Clone)]
pub struct ComparisonInput {
    pub tenant: String,
    pub creator: String,
    pub analysis_a_id: String,
    pub analysis_b_id: String,
    pub judge_model: String,
    pub judge_temperature: f64,
    pub evaluation_criteria: Vec<String>,
}

/// Cost/quality deltas attached to a persisted Comparison (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonMetadata {
    pub cost_a: f64,
    pub cost_b: f64,
    pub tokens_a: u32,
    pub tokens_b: u32,
    pub total_cost: f64,
    pub duration_ms: u64,
    pub cost_difference_pct: Option<f64>,
    pub quality_improvement_pct: Option<f64>,
    pub implied_winner: Winner,
    pub clamped_fields: Vec<String>,
}

/// The stored, immutable-after-creation Comparison artifact (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comparison {
    pub id: String,
    pub tenant: String,
    pub creator: String,
    pub analysis_a: String,
    pub analysis_b: String,
    pub judge_model: String,
    pub judge_model_version: String,
    pub judge_temperature: f64,
    pub evaluation_criteria: Vec<String>,
    pub stage1: StageVerdict,
    pub stage2: StageVerdict,
    pub stage3: StageVerdict,
    pub overall: StageVerdict,
    pub judge_trace_id: String,
    pub comparison_metadata: ComparisonMetadata,
    pub created_at: DateTime<Utc>,
}
