//! Deterministic post-hoc quality scoring for provider output
//!
//! Scores are heuristic and cheap: no model calls, no network. The same
//! output always produces the same score, so records are reproducible and
//! versioned by [`HEURISTIC_VERSION`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::workflow::Phase;

/// Bumped whenever the heuristics change, so stored scores stay comparable
pub const HEURISTIC_VERSION: u32 = 1;

/// Output below this is treated as a soft failure against the provider
pub const SOFT_FAILURE_THRESHOLD: f64 = 0.5;

const W_STRUCTURE: f64 = 0.4;
const W_SUBSTANCE: f64 = 0.4;
const W_LENGTH: f64 = 0.2;

/// Persisted outcome of scoring one task result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityRecord {
    pub task_id: Uuid,
    pub phase: Phase,
    /// Overall score in [0, 1]
    pub score: f64,
    pub structure: f64,
    pub substance: f64,
    pub length: f64,
    pub heuristic_version: u32,
    pub scored_at: DateTime<Utc>,
}

impl QualityRecord {
    pub fn is_soft_failure(&self) -> bool {
        self.score < SOFT_FAILURE_THRESHOLD
    }
}

/// Deterministic heuristic scorer
#[derive(Debug, Clone, Default)]
pub struct QualityScorer;

impl QualityScorer {
    pub fn new() -> Self {
        Self
    }

    /// Score a task result. Null or empty output scores zero.
    pub fn score(&self, task_id: Uuid, phase: Phase, output: &Value) -> QualityRecord {
        let structure = structure_score(output);
        let substance = substance_score(output);
        let length = length_score(output);
        let score = W_STRUCTURE * structure + W_SUBSTANCE * substance + W_LENGTH * length;
        QualityRecord {
            task_id,
            phase,
            score: score.clamp(0.0, 1.0),
            structure,
            substance,
            length,
            heuristic_version: HEURISTIC_VERSION,
            scored_at: Utc::now(),
        }
    }
}

/// Structured output (objects, arrays) over bare strings over scalars
fn structure_score(output: &Value) -> f64 {
    match output {
        Value::Null => 0.0,
        Value::Object(map) if map.is_empty() => 0.1,
        Value::Object(map) => {
            // Reward nesting and field count up to a point.
            let fields = (map.len() as f64 / 5.0).min(1.0);
            let nested = map
                .values()
                .any(|v| matches!(v, Value::Object(_) | Value::Array(_)));
            0.6 + 0.2 * fields + if nested { 0.2 } else { 0.0 }
        }
        Value::Array(items) if items.is_empty() => 0.1,
        Value::Array(_) => 0.7,
        Value::String(s) if s.trim().is_empty() => 0.0,
        Value::String(_) => 0.5,
        _ => 0.3,
    }
}

/// Penalize refusal/error markers and trivially short text
fn substance_score(output: &Value) -> f64 {
    let text = flatten_text(output);
    if text.trim().is_empty() {
        return 0.0;
    }
    let lower = text.to_lowercase();
    let refusal_markers = ["i cannot", "i can't", "unable to", "as an ai", "error:"];
    if refusal_markers.iter().any(|m| lower.contains(m)) {
        return 0.2;
    }
    // Repetition check: distinct words over total words.
    let words: Vec<&str> = lower.split_whitespace().collect();
    if words.is_empty() {
        return 0.0;
    }
    let distinct: std::collections::HashSet<&str> = words.iter().copied().collect();
    let diversity = distinct.len() as f64 / words.len() as f64;
    (0.5 + diversity * 0.5).min(1.0)
}

/// Full credit between 50 and 20000 characters, ramping at the edges
fn length_score(output: &Value) -> f64 {
    let len = flatten_text(output).len() as f64;
    if len < 1.0 {
        0.0
    } else if len < 50.0 {
        len / 50.0
    } else if len <= 20_000.0 {
        1.0
    } else {
        (40_000.0 - len).max(0.0) / 20_000.0
    }
}

fn flatten_text(output: &Value) -> String {
    match output {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
