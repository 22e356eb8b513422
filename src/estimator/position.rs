//! Latest tracked position, mapped to display space.

use super::{log_estimate, ControlSignal, Estimator, Pose};
use crate::accumulator::{Accumulator, AccumulatorConfig};
use crate::capture::ConfigError;
use crate::stages::geometry::{angle_diff, reduce_to_pi};
use serde::{Deserialize, Serialize};

/// Affine map from camera to display coordinates:
///
/// ```text
/// x' = a * x + b * y + tx
/// y' = c * x + d * y + ty
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Affine {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub tx: f64,
    pub ty: f64,
}

impl Default for Affine {
    fn default() -> Self {
        Self {
            a: 1.0,
            b: 0.0,
            c: 0.0,
            d: 1.0,
            tx: 0.0,
            ty: 0.0,
        }
    }
}

impl Affine {
    /// From a row-major 2×3 matrix.
    pub fn from_rows(m: [[f64; 3]; 2]) -> Self {
        Self {
            a: m[0][0],
            b: m[0][1],
            tx: m[0][2],
            c: m[1][0],
            d: m[1][1],
            ty: m[1][2],
        }
    }

    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        (
            self.a * x + self.b * y + self.tx,
            self.c * x + self.d * y + self.ty,
        )
    }

    /// Maps a heading by transforming its direction vector.
    pub fn apply_angle(&self, theta: f64) -> f64 {
        let (dx, dy) = (theta.cos(), theta.sin());
        (self.c * dx + self.d * dy).atan2(self.a * dx + self.b * dy)
    }

    pub fn apply_pose(&self, pose: Pose) -> Pose {
        let (x, y) = self.apply(pose.x, pose.y);
        Pose::new(x, y, self.apply_angle(pose.theta))
    }
}

/// Per-axis change required before a new value replaces the last one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Debounce {
    pub x: f64,
    pub y: f64,
    /// Radians, compared against the shortest-arc difference.
    pub theta: f64,
}

impl Debounce {
    /// Each axis independently keeps `last` unless `new` moved past its
    /// threshold.
    pub fn apply(&self, last: Pose, new: Pose) -> Pose {
        let pick = |last: f64, new: f64, delta: f64, threshold: f64| {
            if delta.abs() > threshold {
                new
            } else {
                last
            }
        };
        Pose {
            x: pick(last.x, new.x, new.x - last.x, self.x),
            y: pick(last.y, new.y, new.y - last.y, self.y),
            theta: pick(last.theta, new.theta, angle_diff(new.theta, last.theta), self.theta),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionConfig {
    pub x_field: String,
    pub y_field: String,
    pub theta_field: String,
    pub affine: Option<Affine>,
    pub debounce: Option<Debounce>,
}

impl Default for PositionConfig {
    fn default() -> Self {
        Self {
            x_field: "f0_x".to_string(),
            y_field: "f0_y".to_string(),
            theta_field: "f0_theta".to_string(),
            affine: None,
            debounce: None,
        }
    }
}

impl PositionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(d) = &self.debounce {
            if [d.x, d.y, d.theta].iter().any(|v| !v.is_finite() || *v < 0.0) {
                return Err(ConfigError::Invalid(
                    "estimator.debounce thresholds must be non-negative".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Reports the most recent tracked pose.
#[derive(Debug, Clone)]
pub struct PositionEstimator {
    source: Accumulator,
    config: PositionConfig,
    accepted: Option<Pose>,
    log: Accumulator,
}

impl PositionEstimator {
    pub fn new(source: Accumulator, config: PositionConfig, log_config: AccumulatorConfig) -> Self {
        Self {
            source,
            config,
            accepted: None,
            log: Accumulator::with_fields(["x", "y", "theta"], log_config),
        }
    }

    /// Latest sample's pose in camera space, `None` without a usable sample.
    fn latest(&self) -> Option<Pose> {
        let schema = self.source.schema()?;
        let sample = self.source.last()?;
        let get = |name: &str| schema.index_of(name).map(|i| sample.values[i]);
        let x = get(&self.config.x_field)?;
        if !x.is_finite() {
            return None;
        }
        Some(Pose::new(
            x,
            get(&self.config.y_field)?,
            get(&self.config.theta_field).unwrap_or(0.0),
        ))
    }
}

impl Estimator for PositionEstimator {
    fn name(&self) -> &'static str {
        "position"
    }

    fn estimate(&mut self, now: f64) -> ControlSignal {
        let Some(raw) = self.latest().filter(Pose::is_finite) else {
            log_estimate(&self.log, now, &[f64::NAN; 3]);
            return ControlSignal::NoAnimal;
        };
        let mapped = match &self.config.affine {
            Some(affine) => affine.apply_pose(raw),
            None => raw,
        };
        let pose = match (&self.config.debounce, self.accepted) {
            (Some(debounce), Some(last)) => debounce.apply(last, mapped),
            _ => mapped,
        };
        let pose = Pose {
            theta: reduce_to_pi(pose.theta),
            ..pose
        };
        self.accepted = Some(pose);
        log_estimate(&self.log, now, &[pose.x, pose.y, pose.theta]);
        ControlSignal::Position(pose)
    }

    fn log(&self) -> &Accumulator {
        &self.log
    }

    fn reset(&mut self) {
        self.accepted = None;
        self.log.reset(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;
    use std::f64::consts::PI;

    fn source() -> Accumulator {
        Accumulator::with_fields(["f0_x", "f0_y", "f0_theta"], AccumulatorConfig::default())
    }

    fn estimator(source: Accumulator, config: PositionConfig) -> PositionEstimator {
        PositionEstimator::new(source, config, AccumulatorConfig::default())
    }

    #[test]
    fn test_empty_is_no_animal() {
        let mut est = estimator(source(), PositionConfig::default());
        assert_eq!(est.estimate(0.0), ControlSignal::NoAnimal);
        let logged = est.log().last().unwrap();
        assert!(logged.values.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_nan_x_is_no_animal() {
        let src = source();
        src.append_values(0.0, &[f64::NAN, 4.0, 0.0]).unwrap();
        let mut est = estimator(src, PositionConfig::default());
        assert_eq!(est.estimate(0.0), ControlSignal::NoAnimal);
    }

    #[test]
    fn test_latest_sample_passes_through() {
        let src = source();
        src.append_values(0.0, &[1.0, 2.0, 0.3]).unwrap();
        src.append_values(0.1, &[5.0, 6.0, 0.4]).unwrap();
        let mut est = estimator(src, PositionConfig::default());
        assert_eq!(est.estimate(0.1), ControlSignal::Position(Pose::new(5.0, 6.0, 0.4)));
    }

    #[test]
    fn test_affine_maps_position_and_heading() {
        let src = source();
        src.append_values(0.0, &[1.0, 0.0, 0.0]).unwrap();
        // quarter turn plus offset
        let config = PositionConfig {
            affine: Some(Affine::from_rows([[0.0, -1.0, 10.0], [1.0, 0.0, 20.0]])),
            ..PositionConfig::default()
        };
        let mut est = estimator(src, config);
        match est.estimate(0.0) {
            ControlSignal::Position(p) => {
                assert_relative_eq!(p.x, 10.0, epsilon = 1e-12);
                assert_relative_eq!(p.y, 21.0, epsilon = 1e-12);
                assert_relative_eq!(p.theta, PI / 2.0, epsilon = 1e-12);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_heading_delta_is_shortest_arc() {
        let last = Pose::new(0.0, 0.0, PI - 0.05);
        let new = Pose::new(0.0, 0.0, -PI + 0.05);
        assert_relative_eq!(angle_diff(new.theta, last.theta).abs(), 0.1, epsilon = 1e-9);

        // below a 0.2 rad threshold the crossing is ignored
        let debounce = Debounce { x: 0.0, y: 0.0, theta: 0.2 };
        assert_eq!(debounce.apply(last, new).theta, last.theta);
        let debounce = Debounce { x: 0.0, y: 0.0, theta: 0.05 };
        assert_eq!(debounce.apply(last, new).theta, new.theta);
    }

    #[test]
    fn test_debounce_holds_small_moves() {
        let src = source();
        let config = PositionConfig {
            debounce: Some(Debounce { x: 1.0, y: 1.0, theta: 0.1 }),
            ..PositionConfig::default()
        };
        let mut est = estimator(src.clone(), config);
        src.append_values(0.0, &[10.0, 10.0, 0.0]).unwrap();
        est.estimate(0.0);
        src.append_values(0.1, &[10.5, 12.0, 0.05]).unwrap();
        assert_eq!(est.estimate(0.1), ControlSignal::Position(Pose::new(10.0, 12.0, 0.0)));

        est.reset();
        assert_eq!(est.estimate(0.2), ControlSignal::Position(Pose::new(10.5, 12.0, 0.05)));
    }

    proptest! {
        #[test]
        fn prop_debounce_axes_independent(
            last in (-100.0f64..100.0, -100.0f64..100.0, -3.0f64..3.0),
            new in (-100.0f64..100.0, -100.0f64..100.0, -3.0f64..3.0),
            thr in (0.0f64..10.0, 0.0f64..10.0, 0.0f64..1.0),
        ) {
            let last = Pose::new(last.0, last.1, last.2);
            let new = Pose::new(new.0, new.1, new.2);
            let debounce = Debounce { x: thr.0, y: thr.1, theta: thr.2 };
            let out = debounce.apply(last, new);
            let x_only = debounce.apply(last, Pose { x: new.x, ..last });
            prop_assert_eq!(out.x, x_only.x);
            prop_assert_eq!(x_only.y, last.y);
            prop_assert_eq!(x_only.theta, last.theta);
            prop_assert!(out.x == new.x || out.x == last.x);
            prop_assert!(out.theta == new.theta || out.theta == last.theta);
        }
    }
}
