//! Concrete collaborators for the unmark pipeline.
//!
//! - [`ffmpeg::FfmpegTool`]: probe, frame extraction and muxing through the
//!   `ffmpeg` / `ffprobe` binaries.
//! - [`detector::YoloDetector`]: YOLO-style ONNX watermark detector.
//! - [`inpaint::DiffusionInpainter`]: boundary diffusion fill.
//! - [`s3::S3Storage`]: S3-compatible object storage.

pub mod detector;
pub mod ffmpeg;
pub mod inpaint;
pub mod s3;

pub use detector::{DetectorConfig, YoloDetector};
pub use ffmpeg::FfmpegTool;
pub use inpaint::DiffusionInpainter;
pub use s3::{S3Config, S3Storage};
