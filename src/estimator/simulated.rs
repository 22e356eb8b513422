//! Replays a keyframed trajectory instead of tracking an animal.

use super::{log_estimate, ControlSignal, Estimator, Pose};
use crate::accumulator::{Accumulator, AccumulatorConfig};
use crate::capture::ConfigError;
use crate::stages::geometry::{angle_diff, reduce_to_pi};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Keyframe {
    pub t: f64,
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub theta: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedConfig {
    /// Keyframes in increasing time order.
    pub keyframes: Vec<Keyframe>,
}

impl SimulatedConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.keyframes.windows(2).any(|w| !(w[1].t > w[0].t)) {
            return Err(ConfigError::Invalid(
                "estimator.keyframes must have strictly increasing times".into(),
            ));
        }
        Ok(())
    }
}

/// Linearly interpolates position between keyframes; heading follows the
/// shorter arc. Times before the first or after the last keyframe hold
/// the end pose.
#[derive(Debug, Clone)]
pub struct SimulatedEstimator {
    keyframes: Vec<Keyframe>,
    log: Accumulator,
}

impl SimulatedEstimator {
    pub fn new(config: SimulatedConfig, log_config: AccumulatorConfig) -> Self {
        Self {
            keyframes: config.keyframes,
            log: Accumulator::with_fields(["x", "y", "theta"], log_config),
        }
    }

    pub fn pose_at(&self, t: f64) -> Option<Pose> {
        let first = self.keyframes.first()?;
        let last = self.keyframes.last()?;
        if t <= first.t {
            return Some(Pose::new(first.x, first.y, first.theta));
        }
        if t >= last.t {
            return Some(Pose::new(last.x, last.y, last.theta));
        }
        let i = self.keyframes.partition_point(|k| k.t <= t);
        let (a, b) = (&self.keyframes[i - 1], &self.keyframes[i]);
        let f = (t - a.t) / (b.t - a.t);
        Some(Pose::new(
            a.x + (b.x - a.x) * f,
            a.y + (b.y - a.y) * f,
            reduce_to_pi(a.theta + angle_diff(b.theta, a.theta) * f),
        ))
    }
}

impl Estimator for SimulatedEstimator {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn estimate(&mut self, now: f64) -> ControlSignal {
        match self.pose_at(now) {
            Some(pose) => {
                log_estimate(&self.log, now, &[pose.x, pose.y, pose.theta]);
                ControlSignal::Position(pose)
            }
            None => {
                log_estimate(&self.log, now, &[f64::NAN; 3]);
                ControlSignal::NoAnimal
            }
        }
    }

    fn log(&self) -> &Accumulator {
        &self.log
    }

    fn reset(&mut self) {
        self.log.reset(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::PI;

    fn estimator(keyframes: Vec<Keyframe>) -> SimulatedEstimator {
        SimulatedEstimator::new(SimulatedConfig { keyframes }, AccumulatorConfig::default())
    }

    fn key(t: f64, x: f64, y: f64, theta: f64) -> Keyframe {
        Keyframe { t, x, y, theta }
    }

    #[test]
    fn test_no_keyframes() {
        let mut est = estimator(Vec::new());
        assert_eq!(est.estimate(1.0), ControlSignal::NoAnimal);
    }

    #[test]
    fn test_interpolation_and_clamping() {
        let est = estimator(vec![key(0.0, 0.0, 0.0, 0.0), key(2.0, 10.0, -4.0, 1.0)]);
        let mid = est.pose_at(1.0).unwrap();
        assert_relative_eq!(mid.x, 5.0);
        assert_relative_eq!(mid.y, -2.0);
        assert_relative_eq!(mid.theta, 0.5);
        assert_eq!(est.pose_at(-1.0).unwrap().x, 0.0);
        assert_eq!(est.pose_at(9.0).unwrap().x, 10.0);
    }

    #[test]
    fn test_heading_crosses_pi_on_short_arc() {
        let est = estimator(vec![key(0.0, 0.0, 0.0, PI - 0.1), key(1.0, 0.0, 0.0, -PI + 0.1)]);
        assert_relative_eq!(est.pose_at(0.5).unwrap().theta.abs(), PI, epsilon = 1e-9);
    }

    #[test]
    fn test_estimates_are_logged() {
        let mut est = estimator(vec![key(0.0, 1.0, 2.0, 0.0)]);
        est.estimate(0.0);
        est.estimate(0.5);
        assert_eq!(est.log().len(), 2);
        est.reset();
        assert!(est.log().is_empty());
    }

    #[test]
    fn test_validate_rejects_unordered() {
        let config = SimulatedConfig {
            keyframes: vec![key(1.0, 0.0, 0.0, 0.0), key(1.0, 0.0, 0.0, 0.0)],
        };
        assert!(config.validate().is_err());
    }
}
