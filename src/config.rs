/// Session configuration module
///
/// All pipeline parameters are fixed at session start and immutable
/// thereafter. Values can come from a JSON file, from environment variables
/// (see the service binary), or from `Default`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Sample rate the detection model was trained on (16 kHz mono PCM).
pub const DEFAULT_SAMPLE_RATE: u32 = 16_000;

/// Default analysis window length: 250ms at 16kHz.
pub const DEFAULT_WINDOW_LENGTH: usize = 4_000;

/// Default window stride: 125ms at 16kHz (50% overlap).
pub const DEFAULT_STRIDE: usize = 2_000;

/// Default capture chunk size: 80ms at 16kHz.
pub const DEFAULT_CHUNK_SIZE: usize = 1_280;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Configuration for a keyword-counting session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Path to the serialized keyword model (.onnx)
    pub model_path: PathBuf,

    /// Capture sample rate in Hz (must match the model's training rate)
    pub sample_rate: u32,

    /// Detection threshold applied to per-window probabilities (0.0 - 1.0)
    pub threshold: f32,

    /// Minimum time between two counted detections
    #[serde(rename = "refractory_ms", with = "duration_ms")]
    pub refractory_period: Duration,

    /// Analysis window length in samples (the model's input length)
    pub window_length: usize,

    /// Samples the window advances between inferences (must be < window_length)
    pub stride: usize,

    /// Samples per capture chunk handed off by the audio source
    pub chunk_size: usize,

    /// Capacity of the bounded chunk queue between capture and processing
    pub queue_capacity: usize,

    /// Zero-pad and score the trailing partial window at stream end.
    /// When disabled the trailing samples are dropped instead.
    pub pad_final_window: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/keyword.onnx"),
            sample_rate: DEFAULT_SAMPLE_RATE,
            threshold: 0.5,
            refractory_period: Duration::from_millis(500),
            window_length: DEFAULT_WINDOW_LENGTH,
            stride: DEFAULT_STRIDE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            queue_capacity: 32,
            pad_final_window: true,
        }
    }
}

impl PipelineConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(ConfigError::Invalid(format!(
                "threshold must be between 0.0 and 1.0, got {}",
                self.threshold
            )));
        }

        if self.sample_rate == 0 {
            return Err(ConfigError::Invalid("sample_rate must be > 0".to_string()));
        }

        if self.window_length == 0 {
            return Err(ConfigError::Invalid(
                "window_length must be > 0".to_string(),
            ));
        }

        if self.stride == 0 || self.stride >= self.window_length {
            return Err(ConfigError::Invalid(format!(
                "stride must be between 1 and window_length - 1, got {} (window_length {})",
                self.stride, self.window_length
            )));
        }

        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be > 0".to_string()));
        }

        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "queue_capacity must be > 0".to_string(),
            ));
        }

        if self.refractory_period.is_zero() {
            return Err(ConfigError::Invalid(
                "refractory_period must be > 0".to_string(),
            ));
        }

        if self.refractory_period < self.window_duration() {
            warn!(
                "refractory period {:?} is shorter than one window ({:?}); \
                 a single utterance may be counted more than once",
                self.refractory_period,
                self.window_duration()
            );
        }

        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Self =
            serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Duration of one analysis window
    pub fn window_duration(&self) -> Duration {
        Duration::from_secs_f64(self.window_length as f64 / self.sample_rate as f64)
    }

    /// Duration the window advances between inferences
    pub fn stride_duration(&self) -> Duration {
        Duration::from_secs_f64(self.stride as f64 / self.sample_rate as f64)
    }
}

/// Serde helper: (de)serialize a `Duration` as integer milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
