//! Frame decoding and sampling.
//!
//! Frames are decoded lazily from a [`FrameSource`]; re-reading a source
//! means decoding it again. Decoded frames are reduced to a luma plane and a
//! coarse hue histogram, which is all the metrics need.

use std::fs;
use std::path::{Path, PathBuf};

use image::DynamicImage;
use image::imageops::FilterType;

/// Number of hue histogram bins (30 degrees each).
pub const HUE_BINS: usize = 12;

/// Saturation below which a pixel is treated as grey.
const CHROMA_SATURATION: f32 = 0.2;
/// Value below which a pixel is treated as black.
const CHROMA_VALUE: f32 = 0.1;

/// Errors decoding a single frame. Never fatal to an analysis.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("Failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to decode {}: {source}", .path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("Frame index {index} out of range ({count} frames)")]
    OutOfRange { index: usize, count: usize },
    #[error("Frame has invalid dimensions {width}x{height}")]
    InvalidDimensions { width: usize, height: usize },
}

/// A decoded frame reduced to what the metrics need.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub width: usize,
    pub height: usize,
    /// Perceived brightness per pixel in [0, 1], row-major.
    pub luma: Vec<f32>,
    /// Counts of chromatic pixels per hue bin.
    pub hue_histogram: [u32; HUE_BINS],
}

impl Frame {
    /// Greyscale frame from a luma plane.
    pub fn from_luma(width: usize, height: usize, luma: Vec<f32>) -> Result<Self, FrameError> {
        if width == 0 || height == 0 || luma.len() != width * height {
            return Err(FrameError::InvalidDimensions { width, height });
        }
        Ok(Self {
            width,
            height,
            luma,
            hue_histogram: [0; HUE_BINS],
        })
    }

    /// Frame from interleaved 8-bit RGB.
    pub fn from_rgb(width: usize, height: usize, rgb: &[u8]) -> Result<Self, FrameError> {
        if width == 0 || height == 0 || rgb.len() != width * height * 3 {
            return Err(FrameError::InvalidDimensions { width, height });
        }

        let mut luma = Vec::with_capacity(width * height);
        let mut hue_histogram = [0u32; HUE_BINS];

        for px in rgb.chunks_exact(3) {
            let r = px[0] as f32 / 255.0;
            let g = px[1] as f32 / 255.0;
            let b = px[2] as f32 / 255.0;
            luma.push(0.299 * r + 0.587 * g + 0.114 * b);

            if let Some(hue) = chromatic_hue(r, g, b) {
                let bin = ((hue / 360.0) * HUE_BINS as f32) as usize;
                hue_histogram[bin.min(HUE_BINS - 1)] += 1;
            }
        }

        Ok(Self {
            width,
            height,
            luma,
            hue_histogram,
        })
    }

    /// Convert a decoded image, downscaling so neither side exceeds
    /// `max_dimension`.
    pub fn from_image(img: &DynamicImage, max_dimension: u32) -> Result<Self, FrameError> {
        let max_dimension = max_dimension.max(1);
        let img = if img.width() > max_dimension || img.height() > max_dimension {
            img.resize(max_dimension, max_dimension, FilterType::Triangle)
        } else {
            img.clone()
        };
        let rgb = img.to_rgb8();
        let (width, height) = rgb.dimensions();
        Self::from_rgb(width as usize, height as usize, rgb.as_raw())
    }

    pub fn mean_luma(&self) -> f32 {
        if self.luma.is_empty() {
            return 0.0;
        }
        self.luma.iter().sum::<f32>() / self.luma.len() as f32
    }

    pub fn chromatic_pixels(&self) -> u32 {
        self.hue_histogram.iter().sum()
    }
}

/// Hue in degrees for pixels that carry colour.
fn chromatic_hue(r: f32, g: f32, b: f32) -> Option<f32> {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;
    if max < CHROMA_VALUE || delta / max.max(1e-6) < CHROMA_SATURATION {
        return None;
    }

    let hue = if max == r {
        60.0 * ((g - b) / delta).rem_euclid(6.0)
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };
    Some(hue.rem_euclid(360.0))
}

/// Brightness-weighted centroid of a frame.
pub fn compute_center_of_mass(frame: &Frame) -> (f32, f32) {
    let mut total = 0.0f32;
    let mut cx = 0.0f32;
    let mut cy = 0.0f32;

    for y in 0..frame.height {
        for x in 0..frame.width {
            let m = frame.luma[y * frame.width + x];
            if m > 0.0 {
                total += m;
                cx += x as f32 * m;
                cy += y as f32 * m;
            }
        }
    }

    if total > 1e-6 {
        (cx / total, cy / total)
    } else {
        (frame.width as f32 / 2.0, frame.height as f32 / 2.0)
    }
}

/// A finite, re-decodable sequence of frames.
pub trait FrameSource: Send + Sync {
    fn frame_count(&self) -> usize;

    /// Decode one frame. Sources may be read in any order and concurrently.
    fn decode(&self, index: usize) -> Result<Frame, FrameError>;
}

/// Indices analyzed for a source of `count` frames: every `stride`-th frame,
/// plus the last frame so loop seamlessness compares the true endpoints.
pub fn sample_indices(count: usize, stride: usize) -> Vec<usize> {
    if count == 0 {
        return Vec::new();
    }
    let stride = stride.max(1);
    let mut indices: Vec<usize> = (0..count).step_by(stride).collect();
    if indices.last() != Some(&(count - 1)) {
        indices.push(count - 1);
    }
    indices
}

/// Frames already held in memory.
#[derive(Debug, Clone, Default)]
pub struct FrameBuffer {
    frames: Vec<Frame>,
}

impl FrameBuffer {
    pub fn new(frames: Vec<Frame>) -> Self {
        Self { frames }
    }
}

impl FrameSource for FrameBuffer {
    fn frame_count(&self) -> usize {
        self.frames.len()
    }

    fn decode(&self, index: usize) -> Result<Frame, FrameError> {
        self.frames
            .get(index)
            .cloned()
            .ok_or(FrameError::OutOfRange {
                index,
                count: self.frames.len(),
            })
    }
}

/// Image files in a render directory, ordered by file name.
#[derive(Debug, Clone)]
pub struct FrameDir {
    dir: PathBuf,
    paths: Vec<PathBuf>,
    max_dimension: u32,
}

impl FrameDir {
    /// List the frames currently in `dir`.
    pub fn open(dir: impl AsRef<Path>, max_dimension: u32) -> Result<Self, FrameError> {
        let dir = dir.as_ref().to_path_buf();
        let paths = list_frames(&dir)?;
        Ok(Self {
            dir,
            paths,
            max_dimension,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl FrameSource for FrameDir {
    fn frame_count(&self) -> usize {
        self.paths.len()
    }

    fn decode(&self, index: usize) -> Result<Frame, FrameError> {
        let path = self.paths.get(index).ok_or(FrameError::OutOfRange {
            index,
            count: self.paths.len(),
        })?;
        decode_file(path, self.max_dimension)
    }
}

/// A single still image.
#[derive(Debug, Clone)]
pub struct ImageFile {
    path: PathBuf,
    max_dimension: u32,
}

impl ImageFile {
    pub fn new(path: impl Into<PathBuf>, max_dimension: u32) -> Self {
        Self {
            path: path.into(),
            max_dimension,
        }
    }
}

impl FrameSource for ImageFile {
    fn frame_count(&self) -> usize {
        1
    }

    fn decode(&self, index: usize) -> Result<Frame, FrameError> {
        if index != 0 {
            return Err(FrameError::OutOfRange { index, count: 1 });
        }
        decode_file(&self.path, self.max_dimension)
    }
}

fn decode_file(path: &Path, max_dimension: u32) -> Result<Frame, FrameError> {
    let img = image::open(path).map_err(|source| FrameError::Decode {
        path: path.to_path_buf(),
        source,
    })?;
    Frame::from_image(&img, max_dimension)
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| matches!(e.to_ascii_lowercase().as_str(), "png" | "jpg" | "jpeg"))
        .unwrap_or(false)
}

/// Image files directly under `dir`, sorted by name.
pub fn list_frames(dir: &Path) -> Result<Vec<PathBuf>, FrameError> {
    let entries = fs::read_dir(dir).map_err(|source| FrameError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| FrameError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.is_file() && is_image(&path) {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}
