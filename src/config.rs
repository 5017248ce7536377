use crate::assets::*;
use crate::convert::DownscalePolicy;
use crate::media::{OpenOptions, PixelFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Pixel format handed to the consumer, a packed RGB layout
    pub pixel_format: PixelFormat,
    pub downscale: DownscalePolicy,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            pixel_format: PixelFormat::Bgra,
            downscale: DownscalePolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Frames kept per stream before the oldest is replaced
    pub frame_depth: usize,
    /// Frame drop rate, in percent, above which a stream raises a health alert
    pub drop_alert_percent: f64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            frame_depth: DEFAULT_FRAME_DEPTH,
            drop_alert_percent: DROP_ALERT_PERCENT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub open_timeout_ms: u64,
    pub read_timeout_ms: u64,
    /// Extra open attempts for live sources
    pub open_retries: u32,
    pub open_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            open_timeout_ms: OPEN_TIMEOUT_MS,
            read_timeout_ms: READ_TIMEOUT_MS,
            open_retries: OPEN_RETRIES,
            open_backoff_ms: OPEN_BACKOFF_MS,
            max_backoff_ms: MAX_OPEN_BACKOFF_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_streams: usize,
    pub max_frame_bytes: usize,
    /// Consecutive skipped frames before a stream fails with a convert error
    pub max_consecutive_convert_failures: u32,
    pub stop_join_timeout_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_streams: MAX_STREAM_COUNT,
            max_frame_bytes: MAX_FRAME_BYTES,
            max_consecutive_convert_failures: MAX_CONVERT_FAILS,
            stop_join_timeout_ms: STOP_JOIN_TIMEOUT_MS,
        }
    }
}

/// Session configuration, loaded from JSON with every field optional
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub output: OutputConfig,
    pub delivery: DeliveryConfig,
    pub network: NetworkConfig,
    pub limits: LimitsConfig,
}

impl Config {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.output.pixel_format.is_packed_rgb() {
            return Err(ConfigError::Invalid(format!(
                "output pixel format {} is not a packed RGB layout",
                self.output.pixel_format
            )));
        }
        self.output.downscale.validate().map_err(ConfigError::Invalid)?;

        if self.delivery.frame_depth == 0 {
            return Err(ConfigError::Invalid("frame_depth must be at least 1".into()));
        }
        if !(0.0..=100.0).contains(&self.delivery.drop_alert_percent) {
            return Err(ConfigError::Invalid("drop_alert_percent must be within 0..=100".into()));
        }
        if self.limits.max_streams == 0 || self.limits.max_streams > MAX_STREAM_COUNT {
            return Err(ConfigError::Invalid(format!(
                "max_streams must be within 1..={}",
                MAX_STREAM_COUNT
            )));
        }
        if self.limits.max_frame_bytes == 0 {
            return Err(ConfigError::Invalid("max_frame_bytes must be positive".into()));
        }
        if self.limits.max_consecutive_convert_failures == 0 {
            return Err(ConfigError::Invalid(
                "max_consecutive_convert_failures must be at least 1".into(),
            ));
        }
        if self.network.open_timeout_ms == 0 || self.network.read_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be positive".into()));
        }
        Ok(())
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            dest_format: self.output.pixel_format,
            downscale: self.output.downscale,
            open: OpenOptions {
                open_timeout: Duration::from_millis(self.network.open_timeout_ms),
                read_timeout: Duration::from_millis(self.network.read_timeout_ms),
                max_frame_bytes: self.limits.max_frame_bytes,
            },
            open_retries: self.network.open_retries,
            open_backoff: Duration::from_millis(self.network.open_backoff_ms),
            max_backoff: Duration::from_millis(self.network.max_backoff_ms.max(self.network.open_backoff_ms)),
            max_frame_bytes: self.limits.max_frame_bytes,
            max_convert_failures: self.limits.max_consecutive_convert_failures,
        }
    }

    pub fn stop_join_timeout(&self) -> Duration {
        Duration::from_millis(self.limits.stop_join_timeout_ms)
    }
}

/// Per-pipeline knobs derived from [`Config`]
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub dest_format: PixelFormat,
    pub downscale: DownscalePolicy,
    pub open: OpenOptions,
    pub open_retries: u32,
    pub open_backoff: Duration,
    pub max_backoff: Duration,
    pub max_frame_bytes: usize,
    pub max_convert_failures: u32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Config::default().pipeline_settings()
    }
}

/// Returns a version as specified in Cargo.toml
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}
