//! Closed-loop estimators.
//!
//! An [`Estimator`] turns recent tracking history into the control signal
//! the stimulus loop consumes every display tick. Every estimate is also
//! appended to the estimator's own [`Accumulator`] so the control signal is
//! logged independently of the raw tracking data.

mod position;
mod simulated;
mod vigor;

pub use position::{Affine, Debounce, PositionConfig, PositionEstimator};
pub use simulated::{Keyframe, SimulatedConfig, SimulatedEstimator};
pub use vigor::{population_std, VigorConfig, VigorEstimator};

use crate::accumulator::{Accumulator, AccumulatorConfig};
use crate::capture::ConfigError;
use serde::{Deserialize, Serialize};

/// Position and heading in display space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
}

impl Pose {
    pub fn new(x: f64, y: f64, theta: f64) -> Self {
        Self { x, y, theta }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.theta.is_finite()
    }
}

/// What a stimulus receives each tick. Never carries NaN.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlSignal {
    /// Virtual swim velocity.
    Velocity(f64),
    Position(Pose),
    /// The most recent sample had no animal in it.
    NoAnimal,
}

impl ControlSignal {
    /// Replaces non-finite content: velocity becomes 0, a partial pose
    /// becomes [`ControlSignal::NoAnimal`].
    pub fn sanitized(self) -> Self {
        match self {
            ControlSignal::Velocity(v) if !v.is_finite() => ControlSignal::Velocity(0.0),
            ControlSignal::Position(p) if !p.is_finite() => ControlSignal::NoAnimal,
            other => other,
        }
    }

    /// Scalar summary for metrics: the velocity, the x position, or NaN.
    pub fn primary(&self) -> f64 {
        match self {
            ControlSignal::Velocity(v) => *v,
            ControlSignal::Position(p) => p.x,
            ControlSignal::NoAnimal => f64::NAN,
        }
    }
}

/// Converts tracking history into a control signal.
pub trait Estimator: Send {
    /// Short name used in logs and export file names.
    fn name(&self) -> &'static str;

    /// Computes the signal for experiment time `now` and logs it.
    fn estimate(&mut self, now: f64) -> ControlSignal;

    /// Log of every estimate produced so far.
    fn log(&self) -> &Accumulator;

    /// Clears internal state and the log.
    fn reset(&mut self);
}

/// Appends to an estimator log, tolerating clock steps backwards.
pub(crate) fn log_estimate(log: &Accumulator, now: f64, values: &[f64]) {
    if let Err(e) = log.append_values(now, values) {
        tracing::debug!(error = %e, "Estimate not logged");
    }
}

/// Estimator selection for the configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EstimatorConfig {
    Vigor(VigorConfig),
    Position(PositionConfig),
    Simulated(SimulatedConfig),
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        EstimatorConfig::Vigor(VigorConfig::default())
    }
}

impl EstimatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            EstimatorConfig::Vigor(c) => c.validate(),
            EstimatorConfig::Position(c) => c.validate(),
            EstimatorConfig::Simulated(c) => c.validate(),
        }
    }

    /// Builds the estimator reading from `source`.
    pub fn build(&self, source: Accumulator, log_config: AccumulatorConfig) -> Box<dyn Estimator> {
        match self {
            EstimatorConfig::Vigor(c) => Box::new(VigorEstimator::new(source, c.clone(), log_config)),
            EstimatorConfig::Position(c) => {
                Box::new(PositionEstimator::new(source, c.clone(), log_config))
            }
            EstimatorConfig::Simulated(c) => Box::new(SimulatedEstimator::new(c.clone(), log_config)),
        }
    }
}
