//! Generation pipeline: the orchestrator boundary and the cycle loop.
//!
//! One cycle is strictly sequential: select techniques, pick a model,
//! generate and render an artifact, score it, update statistics, and record
//! the pattern. Generation failures become failure-floor scores rather than
//! errors; only storage exhaustion and selector misuse stop the loop.

mod dry_run;
mod model;
mod prompt;
mod render;
mod runner;

use std::fmt;
use std::path::PathBuf;

use crate::compute::evolution::SelectorError;
use crate::compute::frames::FrameSource;
use crate::schema::{ArtifactKind, Category, FailureReason};
use crate::store::StorageError;

pub use dry_run::SyntheticOrchestrator;
pub use model::{CodeModel, CommandModel, ModelSelector};
pub use prompt::{build_prompt, clean_code, feedback_prompt, sketch_template, validate_code};
pub use render::ProcessingOrchestrator;
pub use runner::{ContinuousSummary, CycleReport, CycleRunner, StopReason};

/// What the orchestrator is asked to produce.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Pattern version the artifact will be recorded as.
    pub version: u64,
    pub cycle: u64,
    /// Selected techniques in draw order, with their categories.
    pub techniques: Vec<(String, Category)>,
    pub model: String,
    pub parent: Option<u64>,
}

impl GenerationRequest {
    pub fn technique_ids(&self) -> Vec<&str> {
        self.techniques.iter().map(|(id, _)| id.as_str()).collect()
    }
}

/// A generated artifact ready for analysis.
pub struct Artifact {
    pub kind: ArtifactKind,
    /// Frames per second (animations).
    pub frame_rate: u32,
    /// Frames the renderer was asked for (animations).
    pub target_frames: usize,
    pub frames: Box<dyn FrameSource>,
    /// Where the artifact lives on disk, if anywhere.
    pub location: Option<PathBuf>,
}

impl Artifact {
    pub fn animation(
        frames: Box<dyn FrameSource>,
        frame_rate: u32,
        target_frames: usize,
        location: Option<PathBuf>,
    ) -> Self {
        Self {
            kind: ArtifactKind::Animation,
            frame_rate,
            target_frames,
            frames,
            location,
        }
    }

    pub fn still(frames: Box<dyn FrameSource>, location: Option<PathBuf>) -> Self {
        Self {
            kind: ArtifactKind::Still,
            frame_rate: 0,
            target_frames: 1,
            frames,
            location,
        }
    }

    pub fn is_animation(&self) -> bool {
        self.kind == ArtifactKind::Animation
    }
}

impl fmt::Debug for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Artifact")
            .field("kind", &self.kind)
            .field("frame_rate", &self.frame_rate)
            .field("target_frames", &self.target_frames)
            .field("frame_count", &self.frames.frame_count())
            .field("location", &self.location)
            .finish()
    }
}

/// Generation failed before an artifact existed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{reason}: {message}")]
pub struct GenerationError {
    pub reason: FailureReason,
    pub message: String,
}

impl GenerationError {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    pub fn compile(message: impl Into<String>) -> Self {
        Self::new(FailureReason::CompileError, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureReason::Timeout, message)
    }

    pub fn api(message: impl Into<String>) -> Self {
        Self::new(FailureReason::ApiError, message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(FailureReason::InvalidOutput, message)
    }
}

/// Produces artifacts for a technique set.
pub trait Orchestrator {
    fn generate(&mut self, request: &GenerationRequest) -> Result<Artifact, GenerationError>;
}

/// Errors that end a run.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Store unavailable after {0} failed flush rounds")]
    StorageUnavailable(usize),
    #[error(transparent)]
    Selector(#[from] SelectorError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("Pattern v{0} not found")]
    UnknownPattern(u64),
}
