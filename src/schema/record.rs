//! Records produced by one generation cycle.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Techniques chosen for one generation attempt and their weights at draw
/// time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelectionResult {
    /// Selector clock value when the draw happened.
    pub cycle: u64,
    /// Distinct technique ids in draw order.
    pub techniques: Vec<String>,
    /// Weight of each technique when it was drawn.
    pub weights: Vec<f32>,
}

/// Metric groups reported by the extractor, each in [0, 1].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct QualityScores {
    pub complexity: f32,
    pub motion: f32,
    pub aesthetic: f32,
    pub composite: f32,
    /// Fraction of sampled frames that decoded.
    pub confidence: f32,
}

/// Why generation failed before producing a score.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    CompileError,
    Timeout,
    ApiError,
    InvalidOutput,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureReason::CompileError => "compile_error",
            FailureReason::Timeout => "timeout",
            FailureReason::ApiError => "api_error",
            FailureReason::InvalidOutput => "invalid_output",
        };
        f.write_str(s)
    }
}

/// Kind of artifact a cycle produced.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Animation,
    Still,
}

/// One generated artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatternRecord {
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    pub selection: SelectionResult,
    pub model: String,
    /// None when generation failed.
    pub kind: Option<ArtifactKind>,
    /// None when generation failed or scoring fell back to the floor.
    pub scores: Option<QualityScores>,
    pub failure: Option<FailureReason>,
    /// Score that drove the statistics update.
    pub composite: f32,
    /// Pattern this one is a variation of.
    pub parent: Option<u64>,
    /// Where the artifact was written, if anywhere.
    #[serde(default)]
    pub location: Option<String>,
}

/// Append-only log line for one completed update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub cycle: u64,
    pub timestamp: DateTime<Utc>,
    pub techniques: Vec<String>,
    pub composite: f32,
    pub scores: Option<QualityScores>,
    pub success: bool,
    pub failure: Option<FailureReason>,
}
