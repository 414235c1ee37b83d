//! Aggregates over the append-only history and pattern log.

use serde::Serialize;

use super::registry::TechniqueRegistry;
use crate::schema::{HistoryEntry, PatternRecord};

/// Composite score at or above which a pattern counts as high scoring.
pub const HIGH_SCORE_THRESHOLD: f32 = 0.75;

/// Least-squares slope of a technique's composite scores over its last
/// `window` appearances. `None` with fewer than two points.
pub fn technique_trend(entries: &[HistoryEntry], id: &str, window: usize) -> Option<f32> {
    let scores: Vec<f32> = entries
        .iter()
        .filter(|e| e.techniques.iter().any(|t| t == id))
        .map(|e| e.composite)
        .collect();
    let start = scores.len().saturating_sub(window.max(2));
    linear_slope(&scores[start..])
}

fn linear_slope(ys: &[f32]) -> Option<f32> {
    if ys.len() < 2 {
        return None;
    }
    let n = ys.len() as f32;
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = ys.iter().sum::<f32>() / n;

    let mut num = 0.0f32;
    let mut den = 0.0f32;
    for (i, &y) in ys.iter().enumerate() {
        let dx = i as f32 - mean_x;
        num += dx * (y - mean_y);
        den += dx * dx;
    }
    Some(num / den)
}

/// Learned statistics for one technique.
#[derive(Debug, Clone, Serialize)]
pub struct TechniqueSummary {
    pub id: String,
    pub average_score: f32,
    pub use_count: u64,
    pub success_rate: f32,
    pub trend: Option<f32>,
}

/// A recorded synergy pair.
#[derive(Debug, Clone, Serialize)]
pub struct SynergyPair {
    pub a: String,
    pub b: String,
    pub synergy: f32,
}

/// Summary of everything generated so far.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    pub total_patterns: usize,
    pub latest_version: Option<u64>,
    pub high_scoring: usize,
    pub failed: usize,
    pub mean_composite: Option<f32>,
    pub mean_complexity: Option<f32>,
    pub mean_motion: Option<f32>,
    pub mean_aesthetic: Option<f32>,
    pub top_techniques: Vec<TechniqueSummary>,
    pub top_synergies: Vec<SynergyPair>,
}

impl SystemStats {
    /// Collect statistics, listing at most `limit` techniques and pairs.
    pub fn collect(
        patterns: &[PatternRecord],
        history: &[HistoryEntry],
        registry: &TechniqueRegistry,
        limit: usize,
    ) -> Self {
        let scored: Vec<_> = patterns.iter().filter_map(|p| p.scores).collect();
        let mean = |values: Vec<f32>| {
            if values.is_empty() {
                None
            } else {
                Some(values.iter().sum::<f32>() / values.len() as f32)
            }
        };

        let mut top_techniques: Vec<TechniqueSummary> = registry
            .all()
            .into_iter()
            .filter(|t| t.use_count > 0)
            .map(|t| TechniqueSummary {
                id: t.id.clone(),
                average_score: t.average_score,
                use_count: t.use_count,
                success_rate: t.success_rate(),
                trend: technique_trend(history, &t.id, 10),
            })
            .collect();
        top_techniques.sort_by(|x, y| y.average_score.total_cmp(&x.average_score));
        top_techniques.truncate(limit);

        let top_synergies = registry
            .top_synergy_pairs(limit)
            .into_iter()
            .map(|(a, b, synergy)| SynergyPair { a, b, synergy })
            .collect();

        Self {
            total_patterns: patterns.len(),
            latest_version: patterns.iter().map(|p| p.version).max(),
            high_scoring: patterns
                .iter()
                .filter(|p| p.failure.is_none() && p.composite >= HIGH_SCORE_THRESHOLD)
                .count(),
            failed: patterns.iter().filter(|p| p.failure.is_some()).count(),
            mean_composite: mean(patterns.iter().map(|p| p.composite).collect()),
            mean_complexity: mean(scored.iter().map(|s| s.complexity).collect()),
            mean_motion: mean(scored.iter().map(|s| s.motion).collect()),
            mean_aesthetic: mean(scored.iter().map(|s| s.aesthetic).collect()),
            top_techniques,
            top_synergies,
        }
    }
}
