//! File configuration for a whole run.
//!
//! Every section is optional and falls back to its defaults:
//!
//! ```toml
//! [capture]
//! width = 320
//! height = 240
//! fps = 200.0
//!
//! [estimator]
//! kind = "vigor"
//! gain = -30.0
//!
//! [pipeline]
//! preset = "tail"
//!
//! [pipeline.params."/prefilter/tailtrack"]
//! n_output_segments = 5
//! ```

use crate::accumulator::AccumulatorConfig;
use crate::capture::{CaptureConfig, ConfigError};
use crate::estimator::EstimatorConfig;
use crate::experiment::StimulusConfig;
use crate::pipeline::{ParamUpdate, PipelineSpec};
use crate::tracking::TrackingConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Run length, exports and the metrics endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Seconds to run; unset runs until interrupted.
    pub duration_s: Option<f64>,
    /// Directory for CSV exports; unset skips exporting.
    pub csv_dir: Option<PathBuf>,
    /// Port of the Prometheus endpoint; unset disables it.
    pub metrics_port: Option<u16>,
}

impl OutputConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(d) = self.duration_s {
            if !d.is_finite() || d <= 0.0 {
                return Err(ConfigError::Invalid("output.duration_s must be positive".into()));
            }
        }
        Ok(())
    }
}

/// Which tree to build and its initial parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub preset: String,
    /// Overrides applied right after setup, keyed by node path.
    pub params: ParamUpdate,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            preset: "tail".to_string(),
            params: ParamUpdate::new(),
        }
    }
}

impl PipelineConfig {
    pub fn spec(&self) -> Result<PipelineSpec, ConfigError> {
        PipelineSpec::preset(&self.preset)
            .ok_or_else(|| ConfigError::Invalid(format!("unknown pipeline preset {:?}", self.preset)))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub capture: CaptureConfig,
    pub tracking: TrackingConfig,
    pub accumulator: AccumulatorConfig,
    pub estimator: EstimatorConfig,
    pub stimulus: StimulusConfig,
    pub output: OutputConfig,
    pub pipeline: PipelineConfig,
}

impl FileConfig {
    /// Reads and validates a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileReadError(format!("{}: {e}", path.display())))?;
        let config = Self::from_toml(&text)?;
        tracing::info!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.capture.validate()?;
        self.tracking.validate()?;
        self.accumulator.validate()?;
        self.estimator.validate()?;
        self.stimulus.validate()?;
        self.output.validate()?;
        self.pipeline.spec()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ParamValue;
    use std::io::Write;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = FileConfig::from_toml("").unwrap();
        assert_eq!(config.capture.width, 320);
        assert_eq!(config.pipeline.preset, "tail");
        assert!(matches!(config.estimator, EstimatorConfig::Vigor(_)));
        assert_eq!(config.output, OutputConfig::default());
    }

    #[test]
    fn test_sections_and_overrides() {
        let config = FileConfig::from_toml(
            r#"
            [capture]
            fps = 100.0

            [estimator]
            kind = "vigor"
            gain = -10.0

            [output]
            duration_s = 5.0
            csv_dir = "runs"

            [pipeline]
            preset = "tail_and_eyes"

            [pipeline.params."/prefilter/tailtrack"]
            n_output_segments = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.capture.fps, 100.0);
        assert_eq!(config.output.csv_dir.as_deref(), Some(Path::new("runs")));
        match &config.estimator {
            EstimatorConfig::Vigor(v) => assert_eq!(v.gain, -10.0),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            config.pipeline.params["/prefilter/tailtrack"]["n_output_segments"],
            ParamValue::Int(5)
        );
    }

    #[test]
    fn test_unknown_preset_rejected() {
        let err = FileConfig::from_toml("[pipeline]\npreset = \"nope\"").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_invalid_section_rejected() {
        assert!(matches!(
            FileConfig::from_toml("[capture]\nwidth = 0"),
            Err(ConfigError::InvalidDimensions)
        ));
        assert!(matches!(
            FileConfig::from_toml("[capture]\nwidth = \"wide\""),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[stimulus]\nperiod_ms = 10.0").unwrap();
        let config = FileConfig::from_file(file.path()).unwrap();
        assert_eq!(config.stimulus.period_ms, 10.0);

        let missing = FileConfig::from_file(Path::new("/nonexistent/finloop.toml"));
        assert!(matches!(missing, Err(ConfigError::FileReadError(_))));
    }

    #[test]
    fn test_shipped_config_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/finloop.toml");
        let config = FileConfig::from_file(&path).unwrap();
        assert_eq!(config.output.duration_s, Some(10.0));
        assert!(config.pipeline.params.contains_key("/prefilter/tailtrack"));
    }
}
