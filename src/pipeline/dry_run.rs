//! Synthetic artifact generation for dry runs and tests.

use std::collections::{BTreeMap, VecDeque};
use std::f32::consts::TAU;

use log::debug;
use rand::prelude::*;
use rand_distr::StandardNormal;

use super::{Artifact, GenerationError, GenerationRequest, Orchestrator};
use crate::compute::frames::{Frame, FrameBuffer};
use crate::schema::{Category, FailureReason};

/// Per-technique drawing parameters derived from its id.
#[derive(Debug, Clone, Copy)]
struct Blob {
    hue: f32,
    radius: f32,
    orbit: f32,
    /// Whole revolutions per loop, so the last frame leads into the first.
    speed: f32,
    phase: f32,
    ring: bool,
}

impl Blob {
    fn new(id: &str, category: Category) -> Self {
        let mut rng = StdRng::seed_from_u64(fnv1a(id));
        let speed = match category {
            Category::Motion => rng.gen_range(2..=3),
            Category::Geometry | Category::Patterns => rng.gen_range(0..=1),
        };
        Self {
            hue: rng.gen_range(0.0..360.0),
            radius: rng.gen_range(0.08..0.2),
            orbit: rng.gen_range(0.1..0.35),
            speed: speed as f32,
            phase: rng.gen_range(0.0..TAU),
            ring: category == Category::Patterns,
        }
    }

    /// Coverage of the pixel at normalized `(x, y)` at loop position `t`.
    fn coverage(&self, x: f32, y: f32, t: f32) -> f32 {
        let angle = self.phase + TAU * self.speed * t;
        let cx = 0.5 + self.orbit * angle.cos();
        let cy = 0.5 + self.orbit * angle.sin();
        let d = ((x - cx).powi(2) + (y - cy).powi(2)).sqrt();
        if self.ring {
            let band = (d - self.radius).abs();
            (1.0 - band / 0.02).max(0.0)
        } else {
            (1.0 - d / self.radius).clamp(0.0, 1.0).sqrt()
        }
    }
}

fn fnv1a(s: &str) -> u64 {
    s.bytes().fold(0xcbf2_9ce4_8422_2325u64, |hash, b| {
        (hash ^ b as u64).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

fn hue_to_rgb(hue: f32) -> [f32; 3] {
    let h = (hue.rem_euclid(360.0)) / 60.0;
    let x = 1.0 - (h % 2.0 - 1.0).abs();
    match h as u32 {
        0 => [1.0, x, 0.0],
        1 => [x, 1.0, 0.0],
        2 => [0.0, 1.0, x],
        3 => [0.0, x, 1.0],
        4 => [x, 0.0, 1.0],
        _ => [1.0, 0.0, x],
    }
}

/// Renders deterministic frames from the technique set, without any
/// external tools.
///
/// Each technique becomes a coloured disc (or a ring for pattern
/// techniques) orbiting the canvas a whole number of times per loop.
/// Frames for a given pattern version are reproducible for a fixed seed.
#[derive(Debug, Clone)]
pub struct SyntheticOrchestrator {
    seed: u64,
    size: usize,
    frames: usize,
    noise: f32,
    still: bool,
    queued_failures: VecDeque<FailureReason>,
    technique_failures: BTreeMap<String, FailureReason>,
    generated: usize,
}

impl SyntheticOrchestrator {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            size: 64,
            frames: 24,
            noise: 0.02,
            still: false,
            queued_failures: VecDeque::new(),
            technique_failures: BTreeMap::new(),
            generated: 0,
        }
    }

    /// Canvas edge and frames per loop.
    pub fn with_size(mut self, size: usize, frames: usize) -> Self {
        self.size = size.max(4);
        self.frames = frames.max(1);
        self
    }

    /// Standard deviation of the per-channel Gaussian noise.
    pub fn with_noise(mut self, sigma: f32) -> Self {
        self.noise = sigma.max(0.0);
        self
    }

    /// Produce single still images instead of animations.
    pub fn stills(mut self) -> Self {
        self.still = true;
        self
    }

    /// Fail the next generation with `reason`. Calls queue up.
    pub fn fail_next(&mut self, reason: FailureReason) {
        self.queued_failures.push_back(reason);
    }

    /// Fail every generation that includes `id`.
    pub fn fail_technique(&mut self, id: impl Into<String>, reason: FailureReason) {
        self.technique_failures.insert(id.into(), reason);
    }

    pub fn clear_failures(&mut self) {
        self.queued_failures.clear();
        self.technique_failures.clear();
    }

    /// Artifacts produced so far.
    pub fn generated(&self) -> usize {
        self.generated
    }

    fn render_frame(&self, blobs: &[Blob], t: f32, rng: &mut StdRng) -> Result<Frame, GenerationError> {
        let n = self.size;
        let mut rgb = Vec::with_capacity(n * n * 3);
        for py in 0..n {
            for px in 0..n {
                let x = (px as f32 + 0.5) / n as f32;
                let y = (py as f32 + 0.5) / n as f32;
                let mut color = [0.0f32; 3];
                for blob in blobs {
                    let c = blob.coverage(x, y, t);
                    if c > 0.0 {
                        let hue = hue_to_rgb(blob.hue);
                        for (acc, h) in color.iter_mut().zip(hue) {
                            *acc += c * h;
                        }
                    }
                }
                for channel in color {
                    let noise: f32 = rng.sample(StandardNormal);
                    let value = (channel + noise * self.noise).clamp(0.0, 1.0);
                    rgb.push((value * 255.0).round() as u8);
                }
            }
        }
        Frame::from_rgb(n, n, &rgb).map_err(|e| GenerationError::invalid(e.to_string()))
    }

    fn injected_failure(&mut self, request: &GenerationRequest) -> Option<GenerationError> {
        if let Some(reason) = self.queued_failures.pop_front() {
            return Some(GenerationError::new(reason, "injected failure"));
        }
        request.technique_ids().into_iter().find_map(|id| {
            self.technique_failures
                .get(id)
                .map(|&reason| GenerationError::new(reason, format!("injected failure for {}", id)))
        })
    }
}

impl Orchestrator for SyntheticOrchestrator {
    fn generate(&mut self, request: &GenerationRequest) -> Result<Artifact, GenerationError> {
        if let Some(error) = self.injected_failure(request) {
            debug!("v{}: {}", request.version, error);
            return Err(error);
        }

        let blobs: Vec<Blob> = request
            .techniques
            .iter()
            .map(|(id, category)| Blob::new(id, *category))
            .collect();
        let mut rng = StdRng::seed_from_u64(self.seed ^ request.version.wrapping_mul(0x9e37_79b9_7f4a_7c15));

        let count = if self.still { 1 } else { self.frames };
        let frames = (0..count)
            .map(|i| self.render_frame(&blobs, i as f32 / count as f32, &mut rng))
            .collect::<Result<Vec<_>, _>>()?;
        self.generated += 1;

        let source = Box::new(FrameBuffer::new(frames));
        Ok(if self.still {
            Artifact::still(source, None)
        } else {
            Artifact::animation(source, 30, count, None)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::frames::FrameSource;
    use crate::compute::metrics::MetricsExtractor;
    use crate::schema::MetricsConfig;

    fn request(version: u64, ids: &[(&str, Category)]) -> GenerationRequest {
        GenerationRequest {
            version,
            cycle: version,
            techniques: ids.iter().map(|(id, c)| (id.to_string(), *c)).collect(),
            model: "4o".to_string(),
            parent: None,
        }
    }

    fn frames(artifact: &Artifact) -> Vec<Frame> {
        (0..artifact.frames.frame_count())
            .map(|i| artifact.frames.decode(i).unwrap())
            .collect()
    }

    #[test]
    fn test_deterministic_per_version() {
        let req = request(3, &[("flow_fields", Category::Motion), ("spirals", Category::Geometry)]);
        let a = SyntheticOrchestrator::new(7).with_size(16, 6).generate(&req).unwrap();
        let b = SyntheticOrchestrator::new(7).with_size(16, 6).generate(&req).unwrap();
        assert_eq!(frames(&a), frames(&b));
        assert_eq!(a.frames.frame_count(), 6);
        assert!(a.is_animation());
    }

    #[test]
    fn test_techniques_change_the_image() {
        let mut orch = SyntheticOrchestrator::new(1).with_size(16, 2).with_noise(0.0);
        let a = orch.generate(&request(1, &[("fractals", Category::Patterns)])).unwrap();
        let b = orch.generate(&request(1, &[("particle_systems", Category::Motion)])).unwrap();
        assert_ne!(frames(&a), frames(&b));
        assert_eq!(orch.generated(), 2);
    }

    #[test]
    fn test_injected_failures() {
        let mut orch = SyntheticOrchestrator::new(1).with_size(8, 2);
        orch.fail_next(FailureReason::ApiError);
        orch.fail_technique("fractals", FailureReason::Timeout);

        let err = orch.generate(&request(1, &[("spirals", Category::Geometry)])).unwrap_err();
        assert_eq!(err.reason, FailureReason::ApiError);

        let err = orch
            .generate(&request(2, &[("spirals", Category::Geometry), ("fractals", Category::Patterns)]))
            .unwrap_err();
        assert_eq!(err.reason, FailureReason::Timeout);

        assert!(orch.generate(&request(3, &[("spirals", Category::Geometry)])).is_ok());

        orch.clear_failures();
        assert!(orch.generate(&request(4, &[("fractals", Category::Patterns)])).is_ok());
        assert_eq!(orch.generated(), 2);
    }

    #[test]
    fn test_still_mode() {
        let mut orch = SyntheticOrchestrator::new(2).with_size(16, 10).stills();
        let artifact = orch.generate(&request(1, &[("mandalas", Category::Patterns)])).unwrap();
        assert!(!artifact.is_animation());
        assert_eq!(artifact.frames.frame_count(), 1);
    }

    #[test]
    fn test_synthetic_frames_score_in_range() {
        let mut orch = SyntheticOrchestrator::new(5).with_size(32, 12);
        let artifact = orch
            .generate(&request(1, &[("flow_fields", Category::Motion), ("voronoi_diagrams", Category::Geometry)]))
            .unwrap();
        let report = MetricsExtractor::new(MetricsConfig::default())
            .analyze(artifact.frames.as_ref(), true)
            .unwrap();
        let s = report.scores;
        for v in [s.complexity, s.motion, s.aesthetic, s.composite] {
            assert!((0.0..=1.0).contains(&v));
        }
        assert!(report.motion.is_some());
    }

    #[test]
    fn test_hue_to_rgb_primaries() {
        assert_eq!(hue_to_rgb(0.0), [1.0, 0.0, 0.0]);
        assert_eq!(hue_to_rgb(120.0), [0.0, 1.0, 0.0]);
        assert_eq!(hue_to_rgb(240.0), [0.0, 0.0, 1.0]);
    }
}
