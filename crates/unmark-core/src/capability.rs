//! Collaborator interfaces consumed by the pipeline.
//!
//! Storage and media calls are async because they wrap network requests or
//! subprocesses. Detection and inpainting are CPU bound and synchronous; the
//! runner moves them onto the blocking pool.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use image::{GrayImage, RgbImage};
use serde::{Deserialize, Serialize};
use tracing::debug;
use unmark_types::{ParamSet, VideoInfo};

use crate::error::{DetectError, InpaintError, MediaError, StorageError};

/// Object storage addressed by key.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Upload `local` under `key` and return its public location.
    async fn upload(&self, local: &Path, key: &str) -> Result<String, StorageError>;

    async fn download(&self, key: &str, local: &Path) -> Result<(), StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// Tag `key` so that it expires after `days`. Backends without lifecycle
    /// support leave the object alone.
    async fn mark_for_expiration(&self, key: &str, days: u32) -> Result<(), StorageError> {
        debug!(key, days, "storage backend has no expiration support");
        Ok(())
    }

    /// Cheap reachability probe used at startup and by the health check.
    async fn check(&self) -> Result<(), StorageError>;
}

/// Frames written by [`MediaTool::extract_frames`], in playback order.
#[derive(Debug, Clone, Default)]
pub struct ExtractedFrames {
    pub count: usize,
    pub paths: Vec<PathBuf>,
}

impl ExtractedFrames {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self {
            count: paths.len(),
            paths,
        }
    }
}

/// The external frame extraction / muxing tool.
#[async_trait]
pub trait MediaTool: Send + Sync {
    async fn probe(&self, video: &Path) -> Result<VideoInfo, MediaError>;

    /// Split `video` into numbered stills in `out_dir`, keeping every
    /// `stride`-th frame.
    async fn extract_frames(
        &self,
        video: &Path,
        out_dir: &Path,
        stride: u32,
    ) -> Result<ExtractedFrames, MediaError>;

    /// Mux `frame_%06d.png` (numbered from 1) in `frames_dir` into `out_path`
    /// at `fps`, copying the audio of `audio_source` when given.
    async fn render(
        &self,
        frames_dir: &Path,
        out_path: &Path,
        audio_source: Option<&Path>,
        fps: f64,
    ) -> Result<(), MediaError>;
}

/// Axis-aligned box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    pub class_id: usize,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x1,
            y1,
            x2,
            y2,
            confidence: 1.0,
            class_id: 0,
        }
    }

    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 { 0.0 } else { inter / union }
    }
}

/// Thresholds handed to the detector, taken from the effective [`ParamSet`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectOptions {
    pub conf: f32,
    pub iou: f32,
    pub max_det: Option<u32>,
    pub agnostic_nms: bool,
}

impl From<&ParamSet> for DetectOptions {
    fn from(p: &ParamSet) -> Self {
        Self {
            conf: p.conf,
            iou: p.iou,
            max_det: p.max_det,
            agnostic_nms: p.agnostic_nms,
        }
    }
}

pub trait Detector: Send + Sync {
    /// Identifier recorded as `model_used` on the task.
    fn model_id(&self) -> &str;

    fn detect(&self, frame: &RgbImage, opts: &DetectOptions) -> Result<Vec<BoundingBox>, DetectError>;
}

pub trait Inpainter: Send + Sync {
    /// Reconstruct the pixels where `mask` is non-zero. `blend_alpha` weights
    /// the reconstruction against the original pixel.
    fn inpaint(
        &self,
        frame: &RgbImage,
        mask: &GrayImage,
        blend_alpha: f32,
    ) -> Result<RgbImage, InpaintError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let b = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        assert!((b.iou(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(20.0, 20.0, 30.0, 30.0);
        assert_eq!(a.iou(&b), 0.0);
    }
}
