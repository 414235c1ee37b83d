//! Heuristic quality metrics for rendered artifacts.
//!
//! Three groups are measured, each in [0, 1]:
//!
//! - **Complexity**: edge density and a local-variance texture estimate.
//! - **Motion** (animations only): inter-frame activity, direction
//!   consistency of the brightness centroid, and loop seamlessness.
//! - **Aesthetic**: quadrant brightness balance and hue-histogram harmony.
//!
//! The composite is a weighted sum of the groups. Still images drop the
//! motion weight and renormalize the rest.

use log::{debug, warn};
use rayon::prelude::*;
use serde::Serialize;

use super::frames::{Frame, FrameSource, HUE_BINS, compute_center_of_mass, sample_indices};
use crate::schema::{MetricsConfig, QualityScores};

/// Activity below this counts as a static loop.
const STATIC_ACTIVITY: f32 = 1e-3;
/// Centroid shifts shorter than this (pixels) carry no direction.
const MIN_DISPLACEMENT: f32 = 1e-3;

const SEAMLESS_WEIGHT: f32 = 0.4;
const ACTIVITY_WEIGHT: f32 = 0.3;
const DIRECTION_WEIGHT: f32 = 0.3;

/// Metric extraction errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MetricsError {
    #[error("Insufficient data: {frames} frame(s), motion needs at least 2")]
    InsufficientData { frames: usize },
    #[error("None of the {attempted} sampled frames could be decoded")]
    NoDecodableFrames { attempted: usize },
    #[error("Metric produced a non-finite value: {0}")]
    NonFinite(&'static str),
}

/// Motion sub-metrics.
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct MotionMetrics {
    pub activity: f32,
    pub direction_consistency: f32,
    pub seamlessness: f32,
    pub score: f32,
}

/// Full result of analyzing one artifact.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub scores: QualityScores,
    pub edge_density: f32,
    pub texture: f32,
    pub balance: f32,
    pub harmony: f32,
    /// None for still images or when fewer than 2 frames decoded.
    pub motion: Option<MotionMetrics>,
    pub sampled_frames: usize,
    pub skipped_frames: usize,
}

/// Scores frame sequences and still images.
#[derive(Debug, Clone)]
pub struct MetricsExtractor {
    config: MetricsConfig,
}

impl MetricsExtractor {
    pub fn new(config: MetricsConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// Analyze every `sample_stride`-th frame of `source`.
    ///
    /// Undecodable frames are skipped and lower `confidence`. For animations
    /// with fewer than two usable frames the motion group falls back to the
    /// neutral score.
    pub fn analyze(
        &self,
        source: &dyn FrameSource,
        animated: bool,
    ) -> Result<AnalysisReport, MetricsError> {
        let indices = if animated {
            sample_indices(source.frame_count(), self.config.sample_stride)
        } else {
            sample_indices(source.frame_count().min(1), 1)
        };

        let decoded: Vec<_> = indices
            .par_iter()
            .map(|&index| (index, source.decode(index)))
            .collect();

        let mut frames = Vec::with_capacity(decoded.len());
        let mut skipped = 0usize;
        for (index, result) in decoded {
            match result {
                Ok(frame) => frames.push(frame),
                Err(e) => {
                    debug!("Skipping frame {}: {}", index, e);
                    skipped += 1;
                }
            }
        }

        if frames.is_empty() {
            return Err(MetricsError::NoDecodableFrames {
                attempted: indices.len(),
            });
        }
        if skipped > 0 {
            warn!(
                "Skipped {} of {} sampled frames; confidence reduced",
                skipped,
                indices.len()
            );
        }

        let confidence = frames.len() as f32 / indices.len() as f32;
        let motion = if animated {
            match compute_motion(&frames, &self.config) {
                Ok(m) => Some(m),
                Err(e) => {
                    warn!("{}; using neutral motion score", e);
                    None
                }
            }
        } else {
            None
        };

        self.build_report(&frames, motion, animated, confidence, skipped)
    }

    /// Reduced scoring path: score the first frame that decodes as a still
    /// and report a neutral motion score.
    ///
    /// Every frame is tried in order, not only the sampled ones.
    pub fn analyze_safe(&self, source: &dyn FrameSource) -> Result<AnalysisReport, MetricsError> {
        let count = source.frame_count();
        for index in 0..count {
            match source.decode(index) {
                Ok(frame) => {
                    let confidence = 1.0 / (index + 1) as f32;
                    return self.build_report(&[frame], None, true, confidence, index);
                }
                Err(e) => debug!("Safe path skipping frame {}: {}", index, e),
            }
        }
        Err(MetricsError::NoDecodableFrames { attempted: count })
    }

    fn build_report(
        &self,
        frames: &[Frame],
        motion: Option<MotionMetrics>,
        weigh_motion: bool,
        confidence: f32,
        skipped: usize,
    ) -> Result<AnalysisReport, MetricsError> {
        let n = frames.len() as f32;
        let edge_density = frames
            .iter()
            .map(|f| compute_edge_density(f, &self.config))
            .sum::<f32>()
            / n;
        let texture = frames.iter().map(compute_texture).sum::<f32>() / n;
        let complexity = (edge_density + texture) / 2.0;

        let balance = frames.iter().map(compute_balance).sum::<f32>() / n;
        let harmony = compute_harmony(frames, &self.config);
        let aesthetic = (balance + harmony) / 2.0;

        let motion_score = motion
            .map(|m| m.score)
            .unwrap_or(self.config.neutral_score);

        let w = self.config.weights.normalized(weigh_motion);
        let composite = (w.complexity * complexity + w.motion * motion_score
            + w.aesthetic * aesthetic)
            .clamp(0.0, 1.0);

        for (name, value) in [
            ("complexity", complexity),
            ("motion", motion_score),
            ("aesthetic", aesthetic),
            ("composite", composite),
        ] {
            if !value.is_finite() {
                return Err(MetricsError::NonFinite(name));
            }
        }

        debug!(
            "Analysis: complexity={:.3} motion={:.3} aesthetic={:.3} composite={:.3}",
            complexity, motion_score, aesthetic, composite
        );

        Ok(AnalysisReport {
            scores: QualityScores {
                complexity,
                motion: motion_score,
                aesthetic,
                composite,
                confidence,
            },
            edge_density,
            texture,
            balance,
            harmony,
            motion,
            sampled_frames: frames.len() + skipped,
            skipped_frames: skipped,
        })
    }
}

/// Fraction of pixels whose forward-difference gradient exceeds the edge
/// threshold, scaled so `edge_density_ceiling` maps to 1.
fn compute_edge_density(frame: &Frame, config: &MetricsConfig) -> f32 {
    let (w, h) = (frame.width, frame.height);
    if w < 2 || h < 2 {
        return 0.0;
    }

    let mut edges = 0usize;
    for y in 0..h - 1 {
        for x in 0..w - 1 {
            let c = frame.luma[y * w + x];
            let gx = frame.luma[y * w + x + 1] - c;
            let gy = frame.luma[(y + 1) * w + x] - c;
            if (gx * gx + gy * gy).sqrt() > config.edge_threshold {
                edges += 1;
            }
        }
    }

    let density = edges as f32 / ((w - 1) * (h - 1)) as f32;
    (density / config.edge_density_ceiling.max(1e-6)).clamp(0.0, 1.0)
}

/// Mean 3x3 local standard deviation, scaled to [0, 1].
fn compute_texture(frame: &Frame) -> f32 {
    let (w, h) = (frame.width, frame.height);
    if w < 3 || h < 3 {
        return 0.0;
    }

    let mut total = 0.0f32;
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let mut sum = 0.0f32;
            let mut sum_sq = 0.0f32;
            for dy in 0..3 {
                for dx in 0..3 {
                    let v = frame.luma[(y + dy - 1) * w + (x + dx - 1)];
                    sum += v;
                    sum_sq += v * v;
                }
            }
            let mean = sum / 9.0;
            total += (sum_sq / 9.0 - mean * mean).max(0.0).sqrt();
        }
    }

    // Local std of values in [0, 1] is at most 0.5.
    (2.0 * total / ((w - 2) * (h - 2)) as f32).clamp(0.0, 1.0)
}

/// Balance from the spread of quadrant mean brightness.
fn compute_balance(frame: &Frame) -> f32 {
    let (w, h) = (frame.width, frame.height);
    let half_w = w.div_ceil(2);
    let half_h = h.div_ceil(2);

    let mut sums = [0.0f32; 4];
    let mut counts = [0usize; 4];
    for y in 0..h {
        for x in 0..w {
            let q = usize::from(x >= half_w) + 2 * usize::from(y >= half_h);
            sums[q] += frame.luma[y * w + x];
            counts[q] += 1;
        }
    }

    let overall = frame.mean_luma();
    let means: Vec<f32> = sums
        .iter()
        .zip(counts.iter())
        .map(|(&s, &c)| if c > 0 { s / c as f32 } else { overall })
        .collect();
    let mean = means.iter().sum::<f32>() / 4.0;
    let std = (means.iter().map(|m| (m - mean).powi(2)).sum::<f32>() / 4.0).sqrt();

    (1.0 - 2.0 * std).clamp(0.0, 1.0)
}

/// Harmony from normalized hue entropy across all frames; peaks when the
/// spread matches `harmony_target_spread`.
fn compute_harmony(frames: &[Frame], config: &MetricsConfig) -> f32 {
    let mut histogram = [0u64; HUE_BINS];
    for frame in frames {
        for (bin, &count) in histogram.iter_mut().zip(frame.hue_histogram.iter()) {
            *bin += count as u64;
        }
    }

    let total: u64 = histogram.iter().sum();
    if total == 0 {
        return config.neutral_score;
    }

    let entropy = histogram
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f32 / total as f32;
            -p * p.ln()
        })
        .sum::<f32>()
        / (HUE_BINS as f32).ln();

    let target = config.harmony_target_spread.clamp(0.0, 1.0);
    let span = target.max(1.0 - target).max(1e-6);
    (1.0 - (entropy - target).abs() / span).clamp(0.0, 1.0)
}

/// Mean absolute luma difference; frames of different size count as fully
/// different.
fn frame_difference(a: &Frame, b: &Frame) -> f32 {
    if a.width != b.width || a.height != b.height || a.luma.is_empty() {
        return 1.0;
    }
    a.luma
        .iter()
        .zip(b.luma.iter())
        .map(|(x, y)| (x - y).abs())
        .sum::<f32>()
        / a.luma.len() as f32
}

fn compute_motion(frames: &[Frame], config: &MetricsConfig) -> Result<MotionMetrics, MetricsError> {
    if frames.len() < 2 {
        return Err(MetricsError::InsufficientData {
            frames: frames.len(),
        });
    }

    let diffs: Vec<f32> = frames
        .windows(2)
        .map(|pair| frame_difference(&pair[0], &pair[1]))
        .collect();
    let mean_diff = diffs.iter().sum::<f32>() / diffs.len() as f32;
    let activity = (mean_diff * config.motion_gain).clamp(0.0, 1.0);

    let direction_consistency = compute_direction_consistency(frames, config.direction_window);

    let loop_gap = frame_difference(&frames[0], &frames[frames.len() - 1]);
    let seamlessness = (config.perfect_loop_score * (1.0 - loop_gap)).clamp(0.0, 1.0);

    let score = if activity < STATIC_ACTIVITY {
        seamlessness
    } else {
        SEAMLESS_WEIGHT * seamlessness
            + ACTIVITY_WEIGHT * activity
            + DIRECTION_WEIGHT * direction_consistency
    };

    Ok(MotionMetrics {
        activity,
        direction_consistency,
        seamlessness,
        score: score.clamp(0.0, 1.0),
    })
}

/// Mean resultant length of unit centroid displacements over sliding
/// windows. Windows without any displacement are ignored; if none move at
/// all the motion is trivially consistent.
fn compute_direction_consistency(frames: &[Frame], window: usize) -> f32 {
    let centroids: Vec<(f32, f32)> = frames.iter().map(compute_center_of_mass).collect();
    let units: Vec<Option<(f32, f32)>> = centroids
        .windows(2)
        .map(|pair| {
            let dx = pair[1].0 - pair[0].0;
            let dy = pair[1].1 - pair[0].1;
            let len = (dx * dx + dy * dy).sqrt();
            (len > MIN_DISPLACEMENT).then(|| (dx / len, dy / len))
        })
        .collect();

    let window = window.clamp(1, units.len().max(1));
    let mut total = 0.0f32;
    let mut counted = 0usize;
    for chunk in units.windows(window) {
        let moving: Vec<(f32, f32)> = chunk.iter().flatten().copied().collect();
        if moving.is_empty() {
            continue;
        }
        let sx: f32 = moving.iter().map(|v| v.0).sum();
        let sy: f32 = moving.iter().map(|v| v.1).sum();
        total += (sx * sx + sy * sy).sqrt() / moving.len() as f32;
        counted += 1;
    }

    if counted == 0 { 1.0 } else { total / counted as f32 }
}
