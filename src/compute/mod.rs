//! Compute module - frame decoding, metric extraction, and technique
//! evolution.

pub mod evolution;
pub mod frames;
pub mod metrics;

pub use frames::{Frame, FrameBuffer, FrameDir, FrameError, FrameSource, ImageFile};
pub use metrics::{AnalysisReport, MetricsError, MetricsExtractor, MotionMetrics};
