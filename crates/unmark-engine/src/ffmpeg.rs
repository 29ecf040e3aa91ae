//! `ffmpeg` / `ffprobe` driven as subprocesses.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};
use unmark_core::capability::{ExtractedFrames, MediaTool};
use unmark_core::error::MediaError;
use unmark_types::VideoInfo;

/// Pattern shared by extraction output and render input.
pub const FRAME_PATTERN: &str = "frame_%06d.png";

#[derive(Debug, Clone)]
pub struct FfmpegTool {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl FfmpegTool {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    /// Resolve the binaries the way `ffmpeg-sidecar` does (next to the
    /// executable first, then `PATH`), downloading a static build when
    /// `auto_download` is set and none is found. Fails when either binary
    /// does not answer `-version`.
    pub async fn discover(auto_download: bool) -> Result<Self, MediaError> {
        if auto_download && !ffmpeg_sidecar::command::ffmpeg_is_installed() {
            info!("ffmpeg not found, downloading a static build");
            tokio::task::spawn_blocking(ffmpeg_sidecar::download::auto_download)
                .await
                .map_err(|e| MediaError::Probe(format!("ffmpeg download task failed: {e}")))?
                .map_err(|e| MediaError::Probe(format!("ffmpeg download failed: {e}")))?;
        }

        let tool = Self::new(
            ffmpeg_sidecar::paths::ffmpeg_path(),
            ffmpeg_sidecar::ffprobe::ffprobe_path(),
        );
        tool.verify().await?;
        Ok(tool)
    }

    /// Run `-version` on both binaries.
    pub async fn verify(&self) -> Result<(), MediaError> {
        for bin in [&self.ffmpeg, &self.ffprobe] {
            let out = run(Command::new(bin).arg("-version")).await?;
            let banner = String::from_utf8_lossy(&out);
            info!(
                path = %bin.display(),
                version = banner.lines().next().unwrap_or_default(),
                "media tool available"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl MediaTool for FfmpegTool {
    async fn probe(&self, video: &Path) -> Result<VideoInfo, MediaError> {
        let stdout = run(Command::new(&self.ffprobe)
            .args(["-v", "error", "-print_format", "json", "-show_streams", "-show_format"])
            .arg(video))
        .await?;
        parse_probe(&stdout)
    }

    async fn extract_frames(
        &self,
        video: &Path,
        out_dir: &Path,
        stride: u32,
    ) -> Result<ExtractedFrames, MediaError> {
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(["-hide_banner", "-y", "-i"])
            .arg(video)
            .args(["-vsync", "0", "-qscale:v", "2"]);
        if stride > 1 {
            cmd.arg("-vf").arg(select_filter(stride));
        }
        cmd.arg(out_dir.join(FRAME_PATTERN));
        run(&mut cmd).await?;

        let paths = collect_frames(out_dir).await?;
        debug!(count = paths.len(), stride, "frames written");
        Ok(ExtractedFrames::new(paths))
    }

    async fn render(
        &self,
        frames_dir: &Path,
        out_path: &Path,
        audio_source: Option<&Path>,
        fps: f64,
    ) -> Result<(), MediaError> {
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(["-hide_banner", "-y", "-framerate"])
            .arg(format_fps(fps))
            .args(["-start_number", "1", "-i"])
            .arg(frames_dir.join(FRAME_PATTERN));
        match audio_source {
            Some(audio) => {
                cmd.arg("-i")
                    .arg(audio)
                    .args(["-map", "0:v:0", "-map", "1:a?", "-c:a", "copy", "-shortest"]);
            }
            None => {
                cmd.arg("-an");
            }
        }
        cmd.args(["-c:v", "libx264", "-pix_fmt", "yuv420p"])
            .arg(out_path);
        run(&mut cmd).await?;
        Ok(())
    }
}

/// Run to completion and return stdout. A nonzero exit carries stderr.
async fn run(cmd: &mut Command) -> Result<Vec<u8>, MediaError> {
    let tool = Path::new(cmd.as_std().get_program())
        .file_name()
        .and_then(OsStr::to_str)
        .unwrap_or("ffmpeg")
        .to_owned();
    debug!(tool = %tool, args = ?cmd.as_std().get_args().collect::<Vec<_>>(), "spawning");

    let output = cmd
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| MediaError::Spawn {
            tool: tool.clone(),
            source,
        })?;

    if output.status.success() {
        return Ok(output.stdout);
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
    warn!(tool = %tool, code = ?output.status.code(), "media tool failed");
    Err(MediaError::ToolFailed {
        tool,
        code: output.status.code(),
        stderr,
    })
}

fn select_filter(stride: u32) -> String {
    format!("select=not(mod(n\\,{stride}))")
}

fn format_fps(fps: f64) -> String {
    if fps.is_finite() && fps > 0.0 {
        format!("{fps}")
    } else {
        "30".to_owned()
    }
}

async fn collect_frames(dir: &Path) -> Result<Vec<PathBuf>, MediaError> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("frame_") && name.ends_with(".png") {
            paths.push(entry.path());
        }
    }
    paths.sort();
    Ok(paths)
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

fn parse_probe(json: &[u8]) -> Result<VideoInfo, MediaError> {
    let probe: ProbeOutput =
        serde_json::from_slice(json).map_err(|e| MediaError::Probe(e.to_string()))?;

    let video = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| MediaError::Probe("no video stream".to_owned()))?;
    let has_audio = probe
        .streams
        .iter()
        .any(|s| s.codec_type.as_deref() == Some("audio"));

    let fps = [&video.r_frame_rate, &video.avg_frame_rate]
        .into_iter()
        .flatten()
        .find_map(|r| parse_rate(r))
        .ok_or_else(|| MediaError::Probe("video stream has no frame rate".to_owned()))?;

    let duration_seconds = video
        .duration
        .as_deref()
        .or(probe.format.as_ref().and_then(|f| f.duration.as_deref()))
        .and_then(|d| d.parse::<f64>().ok());

    Ok(VideoInfo {
        width: video.width.unwrap_or(0),
        height: video.height.unwrap_or(0),
        fps,
        has_audio,
        duration_seconds,
    })
}

/// `"30000/1001"` or `"25"`. Zero or malformed rates are `None`.
fn parse_rate(raw: &str) -> Option<f64> {
    let rate = match raw.split_once('/') {
        Some((num, den)) => {
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num.trim().parse::<f64>().ok()? / den
        }
        None => raw.trim().parse().ok()?,
    };
    (rate.is_finite() && rate > 0.0).then_some(rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROBE: &str = r#"{
        "streams": [
            {"index": 0, "codec_type": "video", "width": 1280, "height": 720,
             "r_frame_rate": "30000/1001", "avg_frame_rate": "30000/1001", "duration": "4.004"},
            {"index": 1, "codec_type": "audio", "r_frame_rate": "0/0"}
        ],
        "format": {"duration": "4.010000"}
    }"#;

    #[test]
    fn frame_rates() {
        assert_eq!(parse_rate("25"), Some(25.0));
        assert_eq!(parse_rate("50/2"), Some(25.0));
        assert!((parse_rate("30000/1001").unwrap() - 29.97).abs() < 0.01);
        assert_eq!(parse_rate("0/0"), None);
        assert_eq!(parse_rate("abc"), None);
    }

    #[test]
    fn probe_reads_video_and_audio_streams() {
        let info = parse_probe(PROBE.as_bytes()).unwrap();
        assert_eq!((info.width, info.height), (1280, 720));
        assert!((info.fps - 29.97).abs() < 0.01);
        assert!(info.has_audio);
        assert_eq!(info.duration_seconds, Some(4.004));
    }

    #[test]
    fn probe_falls_back_to_container_duration() {
        let json = r#"{"streams":[{"codec_type":"video","width":2,"height":2,"r_frame_rate":"24/1"}],
                       "format":{"duration":"1.5"}}"#;
        let info = parse_probe(json.as_bytes()).unwrap();
        assert!(!info.has_audio);
        assert_eq!(info.duration_seconds, Some(1.5));
    }

    #[test]
    fn probe_without_video_is_an_error() {
        let json = r#"{"streams":[{"codec_type":"audio"}]}"#;
        assert!(matches!(
            parse_probe(json.as_bytes()),
            Err(MediaError::Probe(_))
        ));
    }

    #[test]
    fn stride_filter_keeps_every_nth_frame() {
        assert_eq!(select_filter(5), r"select=not(mod(n\,5))");
        assert_eq!(format_fps(f64::NAN), "30");
        assert_eq!(format_fps(25.0), "25");
    }

    #[tokio::test]
    async fn frames_are_listed_in_order() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["frame_000002.png", "frame_000001.png", "notes.txt", "frame_000010.png"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let names: Vec<_> = collect_frames(dir.path())
            .await
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["frame_000001.png", "frame_000002.png", "frame_000010.png"]);
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let tool = FfmpegTool::new("/nonexistent/ffmpeg", "/nonexistent/ffprobe");
        let err = tool.verify().await.unwrap_err();
        assert!(matches!(err, MediaError::Spawn { ref tool, .. } if tool == "ffmpeg"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_carries_stderr() {
        let err = run(Command::new("sh").args(["-c", "echo 'moov atom not found' >&2; exit 3"]))
            .await
            .unwrap_err();
        match err {
            MediaError::ToolFailed { tool, code, stderr } => {
                assert_eq!(tool, "sh");
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "moov atom not found");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
