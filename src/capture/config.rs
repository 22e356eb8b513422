//! Camera capture configuration.

use super::synthetic::SceneConfig;
use serde::{Deserialize, Serialize};

/// Configuration for frame capture.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Target frames per second.
    pub fps: f64,
    /// Capacity of the frame queue between grabber and tracking worker.
    pub queue_capacity: usize,
    /// Scene rendered by the synthetic camera.
    pub scene: SceneConfig,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: 320,
            height: 240,
            fps: 200.0,
            queue_capacity: 8,
            scene: SceneConfig::default(),
        }
    }
}

impl CaptureConfig {
    /// Creates a new configuration with the specified dimensions.
    pub fn with_dimensions(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..Default::default()
        }
    }

    /// Validates the configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::InvalidDimensions);
        }
        if !self.fps.is_finite() || self.fps <= 0.0 || self.fps > 2000.0 {
            return Err(ConfigError::InvalidFrameRate);
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("capture.queue_capacity must be at least 1".into()));
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid frame dimensions")]
    InvalidDimensions,
    #[error("invalid frame rate (must be in (0, 2000] fps)")]
    InvalidFrameRate,
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("failed to read config file: {0}")]
    FileReadError(String),
    #[error("failed to parse config file: {0}")]
    ParseError(String),
}
