//! Configuration types for the PRISM generation loop.
//!
//! Every numeric constant that steers scoring or selection lives here as a
//! configurable default. None of them are invariants.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrismConfig {
    /// Directory holding the JSON store.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Frame analysis settings.
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Technique selection policy.
    #[serde(default)]
    pub selection: SelectionConfig,
    /// Statistics update policy.
    #[serde(default)]
    pub learning: LearningConfig,
    /// External renderer settings.
    #[serde(default)]
    pub render: RenderConfig,
    /// Model catalog and selection.
    #[serde(default)]
    pub models: ModelConfig,
    /// Continuous generation settings.
    #[serde(default)]
    pub continuous: ContinuousConfig,
    /// Random seed for reproducibility.
    #[serde(default)]
    pub random_seed: Option<u64>,
}

impl Default for PrismConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            metrics: MetricsConfig::default(),
            selection: SelectionConfig::default(),
            learning: LearningConfig::default(),
            render: RenderConfig::default(),
            models: ModelConfig::default(),
            continuous: ContinuousConfig::default(),
            random_seed: None,
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

// ============================================================================
// Metrics
// ============================================================================

/// Relative weights of the three score groups in the composite.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ScoreWeights {
    pub complexity: f32,
    pub motion: f32,
    pub aesthetic: f32,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            complexity: 0.4,
            motion: 0.3,
            aesthetic: 0.3,
        }
    }
}

impl ScoreWeights {
    /// Weights normalized to sum to 1, optionally dropping the motion group.
    pub fn normalized(&self, include_motion: bool) -> Self {
        let motion = if include_motion { self.motion } else { 0.0 };
        let total = self.complexity + motion + self.aesthetic;
        if total <= f32::EPSILON {
            let share = if include_motion { 1.0 / 3.0 } else { 0.5 };
            return Self {
                complexity: share,
                motion: if include_motion { share } else { 0.0 },
                aesthetic: share,
            };
        }
        Self {
            complexity: self.complexity / total,
            motion: motion / total,
            aesthetic: self.aesthetic / total,
        }
    }
}

/// Frame analysis settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Analyze every Nth frame.
    #[serde(default = "default_sample_stride")]
    pub sample_stride: usize,
    /// Frames larger than this (either side) are downscaled before analysis.
    #[serde(default = "default_max_dimension")]
    pub max_dimension: u32,
    /// Composite weights.
    #[serde(default)]
    pub weights: ScoreWeights,
    /// Score used when a group cannot be measured.
    #[serde(default = "default_neutral_score")]
    pub neutral_score: f32,
    /// Motion score of a loop whose last frame equals its first.
    #[serde(default = "default_perfect_loop_score")]
    pub perfect_loop_score: f32,
    /// Gradient magnitude (luma units) above which a pixel counts as an edge.
    #[serde(default = "default_edge_threshold")]
    pub edge_threshold: f32,
    /// Edge density mapped to a full complexity score.
    #[serde(default = "default_edge_density_ceiling")]
    pub edge_density_ceiling: f32,
    /// Multiplier mapping mean inter-frame difference to [0, 1].
    #[serde(default = "default_motion_gain")]
    pub motion_gain: f32,
    /// Number of consecutive displacement vectors per consistency window.
    #[serde(default = "default_direction_window")]
    pub direction_window: usize,
    /// Preferred normalized hue entropy.
    #[serde(default = "default_harmony_target_spread")]
    pub harmony_target_spread: f32,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            sample_stride: default_sample_stride(),
            max_dimension: default_max_dimension(),
            weights: ScoreWeights::default(),
            neutral_score: default_neutral_score(),
            perfect_loop_score: default_perfect_loop_score(),
            edge_threshold: default_edge_threshold(),
            edge_density_ceiling: default_edge_density_ceiling(),
            motion_gain: default_motion_gain(),
            direction_window: default_direction_window(),
            harmony_target_spread: default_harmony_target_spread(),
        }
    }
}

fn default_sample_stride() -> usize {
    6
}
fn default_max_dimension() -> u32 {
    256
}
fn default_neutral_score() -> f32 {
    0.5
}
fn default_perfect_loop_score() -> f32 {
    1.0
}
fn default_edge_threshold() -> f32 {
    0.12
}
fn default_edge_density_ceiling() -> f32 {
    0.35
}
fn default_motion_gain() -> f32 {
    8.0
}
fn default_direction_window() -> usize {
    3
}
fn default_harmony_target_spread() -> f32 {
    0.45
}

// ============================================================================
// Selection
// ============================================================================

/// Technique selection policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionConfig {
    /// Weight of normalized historical performance.
    #[serde(default = "default_performance_weight")]
    pub performance_weight: f32,
    /// Weight of success rate.
    #[serde(default = "default_success_weight")]
    pub success_weight: f32,
    /// Weight of the innovation factor.
    #[serde(default = "default_innovation_weight")]
    pub innovation_weight: f32,
    /// Upper bound on techniques per selection (at most 4).
    #[serde(default = "default_max_techniques")]
    pub max_techniques: usize,
    /// Probability curve over {1, 2, 3, 4} techniques with no synergy data.
    #[serde(default = "default_early_count_weights")]
    pub early_count_weights: [f32; 4],
    /// Probability curve once synergy confidence is saturated.
    #[serde(default = "default_mature_count_weights")]
    pub mature_count_weights: [f32; 4],
    /// Observed synergy pairs needed for full confidence.
    #[serde(default = "default_synergy_confidence_horizon")]
    pub synergy_confidence_horizon: usize,
    /// Weight multiplier ceiling for proven high-synergy pairs.
    #[serde(default = "default_max_synergy_boost")]
    pub max_synergy_boost: f32,
    /// How fast old uses stop counting against the innovation factor.
    #[serde(default = "default_recency_decay")]
    pub recency_decay: f32,
    /// Success rate assumed before a technique has been used.
    #[serde(default = "default_prior_success_rate")]
    pub prior_success_rate: f32,
    /// Pseudo-observations backing the prior success rate.
    #[serde(default = "default_prior_strength")]
    pub prior_strength: f32,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            performance_weight: default_performance_weight(),
            success_weight: default_success_weight(),
            innovation_weight: default_innovation_weight(),
            max_techniques: default_max_techniques(),
            early_count_weights: default_early_count_weights(),
            mature_count_weights: default_mature_count_weights(),
            synergy_confidence_horizon: default_synergy_confidence_horizon(),
            max_synergy_boost: default_max_synergy_boost(),
            recency_decay: default_recency_decay(),
            prior_success_rate: default_prior_success_rate(),
            prior_strength: default_prior_strength(),
        }
    }
}

fn default_performance_weight() -> f32 {
    0.4
}
fn default_success_weight() -> f32 {
    0.3
}
fn default_innovation_weight() -> f32 {
    0.3
}
fn default_max_techniques() -> usize {
    4
}
fn default_early_count_weights() -> [f32; 4] {
    [0.4, 0.35, 0.15, 0.1]
}
fn default_mature_count_weights() -> [f32; 4] {
    [0.1, 0.3, 0.35, 0.25]
}
fn default_synergy_confidence_horizon() -> usize {
    25
}
fn default_max_synergy_boost() -> f32 {
    0.3
}
fn default_recency_decay() -> f32 {
    0.1
}
fn default_prior_success_rate() -> f32 {
    0.5
}
fn default_prior_strength() -> f32 {
    2.0
}

// ============================================================================
// Learning
// ============================================================================

/// How technique statistics react to scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningConfig {
    /// Average score of a technique that has never been used.
    #[serde(default = "default_initial_score")]
    pub initial_score: f32,
    /// Adaptation rate of a technique that has never been used.
    #[serde(default = "default_initial_adaptation_rate")]
    pub initial_adaptation_rate: f32,
    #[serde(default = "default_min_adaptation_rate")]
    pub min_adaptation_rate: f32,
    #[serde(default = "default_max_adaptation_rate")]
    pub max_adaptation_rate: f32,
    /// Relative change applied to the adaptation rate per update.
    #[serde(default = "default_adaptation_step")]
    pub adaptation_step: f32,
    /// Recent scores kept per technique for volatility.
    #[serde(default = "default_volatility_window")]
    pub volatility_window: usize,
    /// Standard deviation below which recent scores count as stable.
    #[serde(default = "default_stable_std")]
    pub stable_std: f32,
    /// Standard deviation above which recent scores count as volatile.
    #[serde(default = "default_volatile_std")]
    pub volatile_std: f32,
    /// Composite score at or above which a run counts as a success.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: f32,
    /// Score recorded when generation or analysis fails outright.
    #[serde(default = "default_failure_floor")]
    pub failure_floor: f32,
    /// Inclusive synergy range.
    #[serde(default = "default_synergy_bounds")]
    pub synergy_bounds: (f32, f32),
    /// Synergy change per unit of score margin.
    #[serde(default = "default_synergy_learning_rate")]
    pub synergy_learning_rate: f32,
    /// Consecutive cycles whose queued writes could not be flushed before the
    /// store is declared unavailable.
    #[serde(default = "default_max_consecutive_storage_failures")]
    pub max_consecutive_storage_failures: usize,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            initial_score: default_initial_score(),
            initial_adaptation_rate: default_initial_adaptation_rate(),
            min_adaptation_rate: default_min_adaptation_rate(),
            max_adaptation_rate: default_max_adaptation_rate(),
            adaptation_step: default_adaptation_step(),
            volatility_window: default_volatility_window(),
            stable_std: default_stable_std(),
            volatile_std: default_volatile_std(),
            success_threshold: default_success_threshold(),
            failure_floor: default_failure_floor(),
            synergy_bounds: default_synergy_bounds(),
            synergy_learning_rate: default_synergy_learning_rate(),
            max_consecutive_storage_failures: default_max_consecutive_storage_failures(),
        }
    }
}

fn default_initial_score() -> f32 {
    0.5
}
fn default_initial_adaptation_rate() -> f32 {
    0.3
}
fn default_min_adaptation_rate() -> f32 {
    0.05
}
fn default_max_adaptation_rate() -> f32 {
    0.6
}
fn default_adaptation_step() -> f32 {
    0.1
}
fn default_volatility_window() -> usize {
    5
}
fn default_stable_std() -> f32 {
    0.05
}
fn default_volatile_std() -> f32 {
    0.2
}
fn default_success_threshold() -> f32 {
    0.6
}
fn default_failure_floor() -> f32 {
    0.05
}
fn default_synergy_bounds() -> (f32, f32) {
    (-1.0, 1.0)
}
fn default_synergy_learning_rate() -> f32 {
    0.5
}
fn default_max_consecutive_storage_failures() -> usize {
    10
}

// ============================================================================
// Rendering
// ============================================================================

/// External renderer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderConfig {
    /// Renderer executable.
    #[serde(default = "default_render_program")]
    pub program: String,
    /// Renderer arguments; `{sketch}` becomes the sketch folder and
    /// `{output}` the frame directory.
    #[serde(default = "default_render_args")]
    pub args: Vec<String>,
    /// Directory where sketches are written.
    #[serde(default = "default_sketch_dir")]
    pub sketch_dir: PathBuf,
    /// Directory where frame folders are written.
    #[serde(default = "default_renders_dir")]
    pub renders_dir: PathBuf,
    /// Hard wall-clock limit for one render.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Interval between frame-count polls.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Frames per loop.
    #[serde(default = "default_target_frames")]
    pub target_frames: usize,
    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,
    /// Code generation attempts per cycle (with error feedback).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    /// Square canvas edge in pixels.
    #[serde(default = "default_canvas_size")]
    pub canvas_size: u32,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            program: default_render_program(),
            args: default_render_args(),
            sketch_dir: default_sketch_dir(),
            renders_dir: default_renders_dir(),
            timeout_secs: default_timeout_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            target_frames: default_target_frames(),
            frame_rate: default_frame_rate(),
            max_attempts: default_max_attempts(),
            canvas_size: default_canvas_size(),
        }
    }
}

fn default_render_program() -> String {
    "processing-java".to_string()
}
fn default_render_args() -> Vec<String> {
    vec![
        "--sketch={sketch}".to_string(),
        "--output={sketch}/build".to_string(),
        "--force".to_string(),
        "--run".to_string(),
    ]
}
fn default_sketch_dir() -> PathBuf {
    PathBuf::from("sketches")
}
fn default_renders_dir() -> PathBuf {
    PathBuf::from("renders")
}
fn default_timeout_secs() -> u64 {
    180
}
fn default_poll_interval_secs() -> u64 {
    2
}
fn default_target_frames() -> usize {
    360
}
fn default_frame_rate() -> u32 {
    60
}
fn default_max_attempts() -> usize {
    3
}
fn default_canvas_size() -> u32 {
    1080
}

// ============================================================================
// Models
// ============================================================================

/// A model the orchestrator may call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub name: String,
    pub weight: f32,
}

/// How a model is picked each cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "mode", content = "model")]
pub enum ModelSelection {
    /// Weighted random over `available`.
    #[default]
    Weighted,
    /// Always the named model.
    Fixed(String),
}

/// Model catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_available_models")]
    pub available: Vec<ModelEntry>,
    #[serde(default)]
    pub selection: ModelSelection,
    /// External command producing sketch code. Receives the prompt on stdin
    /// and the model name in `PRISM_MODEL`; writes code to stdout.
    #[serde(default)]
    pub command: Option<Vec<String>>,
    /// Limit for one model call.
    #[serde(default = "default_model_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            available: default_available_models(),
            selection: ModelSelection::default(),
            command: None,
            timeout_secs: default_model_timeout_secs(),
        }
    }
}

fn default_available_models() -> Vec<ModelEntry> {
    vec![
        ModelEntry {
            name: "4o".to_string(),
            weight: 0.34,
        },
        ModelEntry {
            name: "o1".to_string(),
            weight: 0.33,
        },
        ModelEntry {
            name: "o1-mini".to_string(),
            weight: 0.33,
        },
    ]
}
fn default_model_timeout_secs() -> u64 {
    120
}

// ============================================================================
// Continuous mode
// ============================================================================

/// Continuous generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinuousConfig {
    /// Idle time between cycles.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Stop after this many cycles.
    #[serde(default)]
    pub max_cycles: Option<usize>,
}

impl Default for ContinuousConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            max_cycles: None,
        }
    }
}

fn default_interval_secs() -> u64 {
    600
}

// ============================================================================
// Validation
// ============================================================================

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Sample stride must be at least 1")]
    InvalidStride,
    #[error("Invalid weight: {0}")]
    InvalidWeight(String),
    #[error("Max techniques must be between 1 and 4, got {0}")]
    InvalidTechniqueCount(usize),
    #[error("Invalid bounds: {0}")]
    InvalidBounds(String),
    #[error("Invalid threshold: {0}")]
    InvalidThreshold(String),
    #[error("Render timeout and poll interval must be positive")]
    InvalidRenderTiming,
    #[error("No models configured")]
    NoModels,
    #[error("Fixed model {0} is not in the model list")]
    UnknownModel(String),
}

impl PrismConfig {
    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.metrics.sample_stride == 0 {
            return Err(ConfigError::InvalidStride);
        }

        let weights = self.metrics.weights;
        for (name, w) in [
            ("complexity", weights.complexity),
            ("motion", weights.motion),
            ("aesthetic", weights.aesthetic),
            ("performance", self.selection.performance_weight),
            ("success", self.selection.success_weight),
            ("innovation", self.selection.innovation_weight),
            ("max_synergy_boost", self.selection.max_synergy_boost),
        ] {
            if !(w >= 0.0 && w.is_finite()) {
                return Err(ConfigError::InvalidWeight(format!(
                    "{} weight {} must be non-negative",
                    name, w
                )));
            }
        }

        let curves = self
            .selection
            .early_count_weights
            .iter()
            .chain(self.selection.mature_count_weights.iter());
        for &w in curves {
            if !(w >= 0.0 && w.is_finite()) {
                return Err(ConfigError::InvalidWeight(format!(
                    "count weight {} must be non-negative",
                    w
                )));
            }
        }

        if !(1..=4).contains(&self.selection.max_techniques) {
            return Err(ConfigError::InvalidTechniqueCount(
                self.selection.max_techniques,
            ));
        }

        let learning = &self.learning;
        if learning.min_adaptation_rate <= 0.0
            || learning.min_adaptation_rate > learning.max_adaptation_rate
            || learning.max_adaptation_rate > 1.0
        {
            return Err(ConfigError::InvalidBounds(format!(
                "adaptation rate bounds ({}, {}) must satisfy 0 < min <= max <= 1",
                learning.min_adaptation_rate, learning.max_adaptation_rate
            )));
        }
        if learning.synergy_bounds.0 > learning.synergy_bounds.1 {
            return Err(ConfigError::InvalidBounds(format!(
                "synergy min ({}) > max ({})",
                learning.synergy_bounds.0, learning.synergy_bounds.1
            )));
        }
        for (name, value) in [
            ("success_threshold", learning.success_threshold),
            ("failure_floor", learning.failure_floor),
            ("initial_score", learning.initial_score),
            ("prior_success_rate", self.selection.prior_success_rate),
            ("neutral_score", self.metrics.neutral_score),
            ("perfect_loop_score", self.metrics.perfect_loop_score),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidThreshold(format!(
                    "{} {} must be within [0, 1]",
                    name, value
                )));
            }
        }
        if learning.failure_floor >= learning.success_threshold {
            return Err(ConfigError::InvalidThreshold(format!(
                "failure floor {} must be below success threshold {}",
                learning.failure_floor, learning.success_threshold
            )));
        }

        if self.render.timeout_secs == 0 || self.render.poll_interval_secs == 0 {
            return Err(ConfigError::InvalidRenderTiming);
        }

        if self.models.available.is_empty() {
            return Err(ConfigError::NoModels);
        }
        if let ModelSelection::Fixed(name) = &self.models.selection
            && !self.models.available.iter().any(|m| &m.name == name)
        {
            return Err(ConfigError::UnknownModel(name.clone()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        assert!(PrismConfig::default().validate().is_ok());
    }

    #[test]
    fn test_serialization() {
        let config = PrismConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: PrismConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.metrics.sample_stride, config.metrics.sample_stride);
        assert_eq!(parsed.models.selection, ModelSelection::Weighted);
    }

    #[test]
    fn test_partial_document_uses_defaults() {
        let parsed: PrismConfig =
            serde_json::from_str(r#"{"metrics": {"sample_stride": 3}}"#).unwrap();
        assert_eq!(parsed.metrics.sample_stride, 3);
        assert_eq!(parsed.render.timeout_secs, 180);
        assert!((parsed.metrics.weights.complexity - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_weights_renormalized_without_motion() {
        let weights = ScoreWeights::default().normalized(false);
        assert_eq!(weights.motion, 0.0);
        assert!((weights.complexity + weights.aesthetic - 1.0).abs() < 1e-6);
        assert!((weights.complexity - 0.4 / 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_rejects_inverted_adaptation_bounds() {
        let mut config = PrismConfig::default();
        config.learning.min_adaptation_rate = 0.8;
        config.learning.max_adaptation_rate = 0.2;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBounds(_))
        ));
    }

    #[test]
    fn test_rejects_unknown_fixed_model() {
        let mut config = PrismConfig::default();
        config.models.selection = ModelSelection::Fixed("gpt-x".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownModel(_))
        ));
    }
}
