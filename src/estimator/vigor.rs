//! Swim vigor from tail-angle variability.

use super::{log_estimate, ControlSignal, Estimator};
use crate::accumulator::{Accumulator, AccumulatorConfig};
use crate::capture::ConfigError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VigorConfig {
    /// Tracking field the vigor is computed from.
    pub signal: String,
    /// Window length in seconds.
    pub window: f64,
    /// Signed factor from vigor to virtual velocity.
    pub gain: f64,
}

impl Default for VigorConfig {
    fn default() -> Self {
        Self {
            signal: "tail_sum".to_string(),
            window: 0.05,
            gain: -30.0,
        }
    }
}

impl VigorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.window.is_finite() || self.window <= 0.0 {
            return Err(ConfigError::Invalid("estimator.window must be positive".into()));
        }
        if !self.gain.is_finite() {
            return Err(ConfigError::Invalid("estimator.gain must be finite".into()));
        }
        Ok(())
    }
}

/// Population standard deviation. Empty input gives 0; any NaN gives NaN.
pub fn population_std(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
}

/// Velocity proportional to the standard deviation of a tracking signal
/// over a short trailing window.
#[derive(Debug, Clone)]
pub struct VigorEstimator {
    source: Accumulator,
    config: VigorConfig,
    log: Accumulator,
}

impl VigorEstimator {
    pub fn new(source: Accumulator, config: VigorConfig, log_config: AccumulatorConfig) -> Self {
        Self {
            source,
            config,
            log: Accumulator::with_fields(["vigor", "velocity"], log_config),
        }
    }

    /// Samples covering the window at the current sampling rate, at least 2.
    fn window_samples(&self) -> usize {
        match self.source.mean_dt() {
            Some(dt) => {
                let n = (self.config.window / dt).round();
                if n.is_finite() && n >= 2.0 {
                    n as usize
                } else {
                    2
                }
            }
            None => 2,
        }
    }

    /// Current vigor, 0 without history and NaN if the window holds NaN.
    pub fn vigor(&self) -> f64 {
        let window = self.source.get_last_n(self.window_samples());
        window
            .column(&self.config.signal)
            .map_or(0.0, |values| population_std(&values))
    }
}

impl Estimator for VigorEstimator {
    fn name(&self) -> &'static str {
        "vigor"
    }

    fn estimate(&mut self, now: f64) -> ControlSignal {
        let vigor = self.vigor();
        let mut velocity = vigor * self.config.gain;
        if !velocity.is_finite() {
            velocity = 0.0;
        }
        log_estimate(&self.log, now, &[vigor, velocity]);
        ControlSignal::Velocity(velocity)
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

    fn source_with(values: &[f64], dt: f64) -> Accumulator {
        let acc = Accumulator::with_fields(["tail_sum"], AccumulatorConfig::default());
        for (i, v) in values.iter().enumerate() {
            acc.append_values(i as f64 * dt, &[*v]).unwrap();
        }
        acc
    }

    fn estimator(source: Accumulator) -> VigorEstimator {
        VigorEstimator::new(source, VigorConfig::default(), AccumulatorConfig::default())
    }

    #[test]
    fn test_population_std() {
        assert_relative_eq!(population_std(&[1.0, 3.0]), 1.0);
        assert_relative_eq!(population_std(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]), 2.0);
        assert_eq!(population_std(&[]), 0.0);
    }

    #[test]
    fn test_empty_history_gives_zero() {
        let mut est = estimator(Accumulator::default());
        assert_eq!(est.estimate(0.0), ControlSignal::Velocity(0.0));
        assert_eq!(est.log().len(), 1);
    }

    #[test]
    fn test_constant_signal_gives_zero() {
        let mut est = estimator(source_with(&[0.7; 50], 0.005));
        assert_eq!(est.estimate(1.0), ControlSignal::Velocity(0.0));
    }

    #[test]
    fn test_short_history() {
        let mut est = estimator(source_with(&[0.3], 0.005));
        assert_eq!(est.estimate(1.0), ControlSignal::Velocity(0.0));
    }

    #[test]
    fn test_window_tracks_live_spacing() {
        let est = estimator(source_with(&[0.0; 40], 0.005));
        assert_eq!(est.window_samples(), 10);
        let est = estimator(source_with(&[0.0; 40], 0.01));
        assert_eq!(est.window_samples(), 5);
    }

    #[test]
    fn test_velocity_scales_std() {
        // 0.05 s at 200 Hz covers the final 10 samples: alternating ±1
        let values: Vec<f64> = (0..30).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        let mut est = estimator(source_with(&values, 0.005));
        match est.estimate(1.0) {
            ControlSignal::Velocity(v) => assert_relative_eq!(v, -30.0, epsilon = 1e-9),
            other => panic!("unexpected {other:?}"),
        }
        let logged = est.log().last().unwrap();
        assert_relative_eq!(logged.values[0], 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_nan_never_leaves() {
        let mut values = vec![0.1, 0.2, 0.3, 0.4];
        values.push(f64::NAN);
        let mut est = estimator(source_with(&values, 0.005));
        assert_eq!(est.estimate(1.0), ControlSignal::Velocity(0.0));
        assert!(est.log().last().unwrap().values[0].is_nan());
    }

    #[test]
    fn test_missing_signal_gives_zero() {
        let acc = Accumulator::with_fields(["other"], AccumulatorConfig::default());
        acc.append_values(0.0, &[1.0]).unwrap();
        acc.append_values(0.1, &[5.0]).unwrap();
        let mut est = estimator(acc);
        assert_eq!(est.estimate(0.2), ControlSignal::Velocity(0.0));
    }
}
