//! Deterministic judge-response auto-repair chain (spec §4.6 steps 1-4).
//!
//! Structural repair is bounded and observable: every repair leaves a trace
//! in the returned `ParsedVerdict` (`truncated`, `clamped_fields`), never a
//! silent correction.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::judge::types::{StageVerdict, Winner};

#[derive(Deserialize)]
struct RawVerdict {
    winner: String,
    scores: RawScores,
    #[serde(default)]
    reasoning: String,
}

#[derive(Deserialize)]
struct RawScores {
    #[serde(rename = "A")]
    a: HashMap<String, f64>,
    #[serde(rename = "B")]
    b: HashMap<String, f64>,
}

pub struct ParsedVerdict {
    pub verdict: StageVerdict,
    pub clamped_fields: Vec<String>,
    pub truncated: bool,
}

const TRUNCATION_MARKER: &str = "(response truncated)";

/// Applies steps 1-4 of the auto-repair chain to a single judge call's raw
/// response text. Step 5 (retry the call itself with a stricter prompt) is
/// the caller's responsibility since it requires another adapter round-trip.
pub fn parse_with_repair(raw: &str, call: &str) -> Result<ParsedVerdict> {
    let cleaned = strip_code_fences(raw);

    if let Ok(raw_verdict) = serde_json::from_str::<RawVerdict>(&cleaned) {
        return finalize(raw_verdict, false);
    }

    if let Some(truncated) = truncate_to_last_field_boundary(&cleaned) {
        if let Ok(raw_verdict) = serde_json::from_str::<RawVerdict>(&truncated) {
            return finalize(raw_verdict, true);
        }
        if let Some(closed) = close_unbalanced_braces(&truncated) {
            if let Ok(raw_verdict) = serde_json::from_str::<RawVerdict>(&closed) {
                return finalize(raw_verdict, true);
            }
        }
    }

    if let Some(closed) = close_unbalanced_braces(&cleaned) {
        if let Ok(raw_verdict) = serde_json::from_str::<RawVerdict>(&closed) {
            return finalize(raw_verdict, false);
        }
    }

    Err(Error::judge_parse(call, "unrepairable judge response"))
}

fn finalize(raw: RawVerdict, truncated: bool) -> Result<ParsedVerdict> {
    let winner = Winner::from_wire(&raw.winner)
        .ok_or_else(|| Error::judge_parse("parse", format!("invalid winner value {:?}", raw.winner)))?;

    let mut clamped_fields = Vec::new();
    let scores_a = clamp_scores("A", raw.scores.a, &mut clamped_fields);
    let scores_b = clamp_scores("B", raw.scores.b, &mut clamped_fields);

    let mut reasoning = raw.reasoning;
    if truncated && !reasoning.ends_with(TRUNCATION_MARKER) {
        if reasoning.is_empty() {
            reasoning = TRUNCATION_MARKER.to_string();
        } else {
            reasoning = format!("{reasoning} {TRUNCATION_MARKER}");
        }
    }

    Ok(ParsedVerdict {
        verdict: StageVerdict {
            winner,
            scores_a,
            scores_b,
            reasoning,
        },
        clamped_fields,
        truncated,
    })
}

fn clamp_scores(
    side: &str,
    scores: HashMap<String, f64>,
    clamped_fields: &mut Vec<String>,
) -> HashMap<String, f64> {
    scores
        .into_iter()
        .map(|(criterion, value)| {
            let clamped = value.clamp(0.0, 1.0);
            if (clamped - value).abs() > f64::EPSILON {
                clamped_fields.push(format!("{side}.{criterion}"));
            }
            (criterion, clamped)
        })
        .collect()
}

fn strip_code_fences(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_prefix = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_prefix.strip_suffix("```").unwrap_or(without_prefix).trim().to_string()
}

/// Cuts the buffer at the last comma immediately preceding a new top-level
/// key (`,"key"`), discarding whatever unterminated field follows it. This
/// is the practical form of spec §4.6 step 3's "last `\",` boundary".
fn truncate_to_last_field_boundary(s: &str) -> Option<String> {
    s.rfind(",\"").map(|idx| s[..idx].to_string())
}

/// Appends `}` characters equal to the brace deficit, skipping braces inside
/// string literals (spec §4.6 step 4).
fn close_unbalanced_braces(s: &str) -> Option<String> {
    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escaped = false;
    for ch in s.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => depth -= 1,
            _ => {}
        }
    }
    if depth <= 0 {
        return None;
    }
    let mut repaired = s.trim_end().trim_end_matches(',').to_string();
    for _ in 0..depth {
        repaired.push('}');
    }
    Some(repaired)
}
