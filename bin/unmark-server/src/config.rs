//! Server configuration, loaded from environment variables at startup.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use unmark_types::ParamDefaults;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{key}={value} is out of range")]
    OutOfRange { key: &'static str, value: u64 },
}

/// Runtime configuration for unmark-server.
///
/// Every field has a default so the server starts without any environment
/// variables beyond the storage credentials.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address to bind (default: `"0.0.0.0:8000"`).
    pub bind_address: String,

    /// `tracing` filter string, e.g. `"info"` or `"debug,tower_http=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// Directory for a daily rolling log file, in addition to stdout.
    pub log_dir: Option<PathBuf>,

    /// Redis URL shared by the status store and the job queue. Unset means
    /// both run in-process.
    pub redis_url: Option<String>,
    pub status_prefix: String,
    pub queue_key: String,
    pub status_file: PathBuf,
    pub task_ttl: Duration,

    /// Pipeline runs executing at once in this process.
    pub concurrency: usize,
    pub work_dir: PathBuf,

    pub max_upload_bytes: u64,
    pub allowed_mime: Vec<String>,
    /// Comma separated origin list; unset allows any origin.
    pub cors_origins: Option<String>,

    pub s3_endpoint: Option<String>,
    pub s3_region: String,
    pub s3_bucket: String,
    pub s3_access_key: String,
    pub s3_secret_key: String,
    pub s3_public_base: Option<String>,
    pub s3_prefix: String,
    /// Upload with the `public-read` ACL so result URLs open without signing.
    pub s3_public_read: bool,
    pub expire_after_days: u32,

    pub model_path: PathBuf,
    pub model_input_size: u32,
    pub ffmpeg_auto_download: bool,
    pub housekeeping_interval: Duration,

    pub defaults: ParamDefaults,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    /// Unparseable values take the default; values that overflow once
    /// converted to seconds or bytes are rejected.
    pub fn from_env() -> Result<Self, ConfigError> {
        let base = ParamDefaults::default();
        Ok(Self {
            bind_address: env_or("UNMARK_BIND", "0.0.0.0:8000"),
            log_level: env_or("UNMARK_LOG", "info"),
            log_json: parse_bool("UNMARK_LOG_JSON"),
            log_dir: env_opt("UNMARK_LOG_DIR").map(PathBuf::from),

            redis_url: env_opt("UNMARK_REDIS_URL"),
            status_prefix: env_or("UNMARK_STATUS_PREFIX", "unmark:status:"),
            queue_key: env_or("UNMARK_QUEUE_KEY", "unmark:jobs"),
            status_file: PathBuf::from(env_or("UNMARK_STATUS_FILE", "./data/status.json")),
            task_ttl: Duration::from_secs(scaled(
                "UNMARK_TASK_TTL_HOURS",
                parse_env("UNMARK_TASK_TTL_HOURS", 72u64),
                3600,
            )?),

            concurrency: parse_env("UNMARK_CONCURRENCY", 2usize).max(1),
            work_dir: env_opt("UNMARK_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| std::env::temp_dir().join("unmark")),

            max_upload_bytes: scaled(
                "UNMARK_MAX_UPLOAD_MB",
                parse_env("UNMARK_MAX_UPLOAD_MB", 800u64),
                1024 * 1024,
            )?,
            allowed_mime: env_or(
                "UNMARK_ALLOWED_MIME",
                "video/mp4,video/quicktime,video/x-msvideo",
            )
            .split(',')
            .map(|m| m.trim().to_ascii_lowercase())
            .filter(|m| !m.is_empty())
            .collect(),
            cors_origins: env_opt("UNMARK_CORS_ORIGINS"),

            s3_endpoint: env_opt("UNMARK_S3_ENDPOINT"),
            s3_region: env_or("UNMARK_S3_REGION", "us-east-1"),
            s3_bucket: env_or("UNMARK_S3_BUCKET", "unmark"),
            s3_access_key: env_or("UNMARK_S3_ACCESS_KEY", ""),
            s3_secret_key: env_or("UNMARK_S3_SECRET_KEY", ""),
            s3_public_base: env_opt("UNMARK_S3_PUBLIC_BASE"),
            s3_prefix: env_or("UNMARK_S3_PREFIX", ""),
            s3_public_read: std::env::var("UNMARK_S3_PUBLIC_READ")
                .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
                .unwrap_or(true),
            expire_after_days: parse_env("UNMARK_EXPIRE_AFTER_DAYS", 7),

            model_path: PathBuf::from(env_or("UNMARK_MODEL_PATH", "./models/watermark.onnx")),
            model_input_size: parse_env("UNMARK_MODEL_INPUT_SIZE", 640),
            ffmpeg_auto_download: parse_bool("UNMARK_FFMPEG_AUTO_DOWNLOAD"),
            housekeeping_interval: Duration::from_secs(
                parse_env("UNMARK_HOUSEKEEPING_SECS", 3600u64).max(1),
            ),

            defaults: ParamDefaults {
                conf: parse_env("UNMARK_DEFAULT_CONF", base.conf),
                iou: parse_env("UNMARK_DEFAULT_IOU", base.iou),
                mask_expand: parse_env("UNMARK_DEFAULT_MASK_EXPAND", base.mask_expand),
                frame_stride: parse_env("UNMARK_DEFAULT_FRAME_STRIDE", base.frame_stride),
                max_det: env_opt("UNMARK_DEFAULT_MAX_DET").and_then(|v| v.parse().ok()),
                agnostic_nms: base.agnostic_nms,
                blend_alpha: parse_env("UNMARK_DEFAULT_BLEND_ALPHA", base.blend_alpha),
            },
        })
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// `value * factor`, or an error naming `key` when it does not fit in `u64`.
fn scaled(key: &'static str, value: u64, factor: u64) -> Result<u64, ConfigError> {
    value
        .checked_mul(factor)
        .ok_or(ConfigError::OutOfRange { key, value })
}

fn parse_bool(key: &str) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
