//! Technique catalog and per-technique performance statistics.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};

use super::LearningConfig;

/// Category a technique belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Geometry,
    Motion,
    Patterns,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Geometry => "geometry",
            Category::Motion => "motion",
            Category::Patterns => "patterns",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named generative building block and its learned statistics.
///
/// `average_score` is an exponential moving average; only the last few
/// scores are retained (`recent_scores`) to estimate volatility.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Technique {
    pub id: String,
    pub category: Category,
    pub use_count: u64,
    pub success_count: u64,
    pub average_score: f32,
    pub adaptation_rate: f32,
    #[serde(default)]
    pub recent_scores: VecDeque<f32>,
    /// Selector clock value at the most recent use.
    #[serde(default)]
    pub last_used_cycle: Option<u64>,
    /// Pairwise affinity with other techniques, keyed by technique id.
    #[serde(default)]
    pub synergy: BTreeMap<String, f32>,
}

impl Technique {
    /// A never-used technique.
    pub fn new(id: impl Into<String>, category: Category, learning: &LearningConfig) -> Self {
        Self {
            id: id.into(),
            category,
            use_count: 0,
            success_count: 0,
            average_score: learning.initial_score,
            adaptation_rate: learning.initial_adaptation_rate,
            recent_scores: VecDeque::new(),
            last_used_cycle: None,
            synergy: BTreeMap::new(),
        }
    }

    /// Raw success ratio; zero for an unused technique.
    pub fn success_rate(&self) -> f32 {
        if self.use_count == 0 {
            0.0
        } else {
            self.success_count as f32 / self.use_count as f32
        }
    }

    /// Success rate pulled toward `prior` by `strength` pseudo-observations.
    ///
    /// Unlike the raw ratio this is defined before the first use and strictly
    /// decreases on every failure.
    pub fn smoothed_success_rate(&self, prior: f32, strength: f32) -> f32 {
        let strength = strength.max(0.0);
        let denom = self.use_count as f32 + strength;
        if denom <= 0.0 {
            return prior;
        }
        (self.success_count as f32 + prior * strength) / denom
    }

    /// Population standard deviation of the retained recent scores.
    pub fn recent_std(&self) -> Option<f32> {
        if self.recent_scores.len() < 2 {
            return None;
        }
        let n = self.recent_scores.len() as f32;
        let mean = self.recent_scores.iter().sum::<f32>() / n;
        let var = self
            .recent_scores
            .iter()
            .map(|s| (s - mean).powi(2))
            .sum::<f32>()
            / n;
        Some(var.sqrt())
    }

    pub fn synergy_with(&self, other: &str) -> f32 {
        self.synergy.get(other).copied().unwrap_or(0.0)
    }
}

const GEOMETRY: &[&str] = &[
    "circle_packing",
    "voronoi_diagrams",
    "delaunay_triangulation",
    "fibonacci_spiral",
    "lissajous_curves",
    "cardioids",
    "superellipse",
    "hypocycloid",
    "rose_curves",
    "phyllotaxis",
    "polygon_morphing",
    "spirograph",
    "golden_ratio",
    "tesselation",
    "meander_patterns",
    "star_polygons",
    "truchet_tiles",
    "hyperbolic_tiling",
    "kaleidoscopic_transforms",
    "l_system_fractals",
    "strange_attractors",
    "chladni_patterns",
    "dla_growth",
    "procedural_terrain",
];

const MOTION: &[&str] = &[
    "harmonic_motion",
    "wave_interference",
    "flow_fields",
    "parametric_motion",
    "brownian_motion",
    "particle_systems",
    "spring_physics",
    "orbital_motion",
    "pendulum_motion",
    "circular_motion",
    "wave_propagation",
    "perlin_noise_motion",
    "elastic_motion",
    "spiral_motion",
    "oscillation",
    "lerp_transitions",
    "flocking_boids",
    "swarm_intelligence",
    "advanced_physics",
    "agent_based_drawing",
    "temporal_shifts",
    "emergent_behavior",
    "collective_motion",
];

const PATTERNS: &[&str] = &[
    "cellular_automata",
    "fractals",
    "recursive_patterns",
    "stroke_variations",
    "reaction_diffusion",
    "noise_landscapes",
    "moire_patterns",
    "tiling_systems",
    "interference_patterns",
    "mandala_patterns",
    "maze_generation",
    "dot_patterns",
    "grid_deformation",
    "symmetry_patterns",
    "line_weaving",
    "halftone_patterns",
    "l_systems",
    "pixel_sorting",
    "glitch_effects",
    "feedback_loops",
    "blend_modes",
    "color_harmonies",
    "resonance_patterns",
];

/// The built-in catalog as `(id, category)` pairs in declaration order.
pub fn default_catalog() -> Vec<(String, Category)> {
    let mut catalog = Vec::with_capacity(GEOMETRY.len() + MOTION.len() + PATTERNS.len());
    for (names, category) in [
        (GEOMETRY, Category::Geometry),
        (MOTION, Category::Motion),
        (PATTERNS, Category::Patterns),
    ] {
        catalog.extend(names.iter().map(|n| (n.to_string(), category)));
    }
    catalog
}
