//! Fixed-period closed-loop tick.

use super::collector::{Collector, DrainReport};
use crate::accumulator::ExportError;
use crate::capture::ConfigError;
use crate::estimator::{ControlSignal, Estimator};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StimulusConfig {
    /// Tick period in milliseconds.
    pub period_ms: f64,
    /// Name used for the protocol and its export files.
    pub protocol: String,
}

impl Default for StimulusConfig {
    fn default() -> Self {
        Self {
            period_ms: 1000.0 / 60.0,
            protocol: "closed_loop".to_string(),
        }
    }
}

impl StimulusConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.period_ms.is_finite() || self.period_ms <= 0.0 {
            return Err(ConfigError::Invalid("stimulus.period_ms must be positive".into()));
        }
        if self.protocol.is_empty() || self.protocol.contains(['/', '\\']) {
            return Err(ConfigError::Invalid(format!(
                "stimulus.protocol {:?} is not a valid name",
                self.protocol
            )));
        }
        Ok(())
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(self.period_ms / 1000.0)
    }
}

/// Receives the control signal every tick. Rendering lives behind this.
pub trait StimulusSink {
    fn update(&mut self, t: f64, signal: ControlSignal);
}

impl<F: FnMut(f64, ControlSignal)> StimulusSink for F {
    fn update(&mut self, t: f64, signal: ControlSignal) {
        self(t, signal)
    }
}

/// Result of one tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickReport {
    pub t: f64,
    pub drained: DrainReport,
    pub signal: ControlSignal,
}

/// Drains tracking output, estimates, and feeds the sink.
pub struct StimulusLoop<S> {
    config: StimulusConfig,
    collector: Collector,
    estimator: Box<dyn Estimator>,
    sink: S,
}

impl<S: StimulusSink> StimulusLoop<S> {
    /// The estimator's log is registered with the collector so it is
    /// reset and exported with the protocol.
    pub fn new(
        config: StimulusConfig,
        mut collector: Collector,
        estimator: Box<dyn Estimator>,
        sink: S,
    ) -> Self {
        collector.register_log(estimator.name(), estimator.log().clone());
        Self {
            config,
            collector,
            estimator,
            sink,
        }
    }

    pub fn collector(&self) -> &Collector {
        &self.collector
    }

    pub fn estimator(&self) -> &dyn Estimator {
        self.estimator.as_ref()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// One tick at experiment time `t`.
    pub fn tick(&mut self, t: f64) -> TickReport {
        let drained = self.collector.drain();
        let signal = self.estimator.estimate(t).sanitized();
        self.sink.update(t, signal);
        TickReport { t, drained, signal }
    }

    pub fn start_protocol(&mut self) {
        self.estimator.reset();
        self.collector.start_protocol(&self.config.protocol);
    }

    pub fn end_protocol(&mut self, dir: Option<&Path>) -> Result<Vec<PathBuf>, ExportError> {
        self.collector.end_protocol(dir)
    }

    /// Ticks at the configured period until `duration` elapses or `stop`
    /// is raised. Late ticks are skipped rather than bunched. Returns the
    /// number of ticks run.
    ///
    /// Tick times are seconds since `epoch`, the clock the frame grabber
    /// stamps frames with, so estimator and tracking logs share a time
    /// axis. `duration` counts from the call.
    pub fn run(
        &mut self,
        epoch: Instant,
        duration: Option<Duration>,
        stop: &AtomicBool,
        mut observer: impl FnMut(&TickReport),
    ) -> u64 {
        let period = self.config.period();
        let start = Instant::now();
        let mut next = start;
        let mut ticks = 0u64;
        while !stop.load(Ordering::Relaxed) {
            if duration.is_some_and(|d| start.elapsed() >= d) {
                break;
            }
            let report = self.tick(epoch.elapsed().as_secs_f64());
            observer(&report);
            ticks += 1;

            next += period;
            let now = Instant::now();
            if next > now {
                std::thread::sleep(next - now);
            } else {
                let behind = now - next;
                let skipped = (behind.as_secs_f64() / period.as_secs_f64()).floor();
                tracing::debug!(skipped, "Stimulus loop running late");
                next += period.mul_f64(skipped + 1.0);
                if next > now {
                    std::thread::sleep(next - now);
                }
            }
        }
        tracing::info!(ticks, "Stimulus loop stopped");
        ticks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::AccumulatorConfig;
    use crate::estimator::{VigorConfig, VigorEstimator};
    use crate::pipeline::{FeatureSchema, FeatureTuple};
    use crate::tracking::TrackedSample;
    use crossbeam_channel::{bounded, Sender};
    use std::sync::Arc;

    fn setup() -> (
        StimulusLoop<impl FnMut(f64, ControlSignal)>,
        Sender<TrackedSample>,
        std::rc::Rc<std::cell::RefCell<Vec<ControlSignal>>>,
    ) {
        let (tx, rx) = bounded(256);
        let collector = Collector::new(AccumulatorConfig::default(), rx);
        let estimator = VigorEstimator::new(
            collector.tracking().clone(),
            VigorConfig::default(),
            AccumulatorConfig::default(),
        );
        let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let sink_seen = seen.clone();
        let sink = move |_t: f64, signal: ControlSignal| sink_seen.borrow_mut().push(signal);
        let config = StimulusConfig {
            period_ms: 1.0,
            ..StimulusConfig::default()
        };
        (StimulusLoop::new(config, collector, Box::new(estimator), sink), tx, seen)
    }

    fn send_tail(tx: &Sender<TrackedSample>, values: &[f64]) {
        let schema = Arc::new(FeatureSchema::new(["tail_sum"], 1));
        for (i, v) in values.iter().enumerate() {
            tx.send(TrackedSample {
                t: i as f64 * 0.005,
                sequence: i as u64,
                features: FeatureTuple::new(Arc::clone(&schema), vec![*v]).unwrap(),
                schema_changed: false,
            })
            .unwrap();
        }
    }

    #[test]
    fn test_tick_without_data() {
        let (mut stimulus, _tx, seen) = setup();
        let report = stimulus.tick(0.0);
        assert_eq!(report.signal, ControlSignal::Velocity(0.0));
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn test_tick_drains_then_estimates() {
        let (mut stimulus, tx, seen) = setup();
        let values: Vec<f64> = (0..20).map(|i| if i % 2 == 0 { 0.5 } else { -0.5 }).collect();
        send_tail(&tx, &values);
        let report = stimulus.tick(0.1);
        assert_eq!(report.drained.samples, 20);
        match seen.borrow()[0] {
            ControlSignal::Velocity(v) => assert!((v + 15.0).abs() < 1e-9),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(stimulus.estimator().log().len(), 1);
    }

    #[test]
    fn test_nan_tracking_gives_zero_velocity() {
        let (mut stimulus, tx, seen) = setup();
        send_tail(&tx, &[f64::NAN; 20]);
        stimulus.tick(0.1);
        assert_eq!(seen.borrow()[0], ControlSignal::Velocity(0.0));
    }

    #[test]
    fn test_run_stops_on_flag_and_duration() {
        let (mut stimulus, _tx, _seen) = setup();
        let stop = AtomicBool::new(true);
        assert_eq!(stimulus.run(Instant::now(), None, &stop, |_| {}), 0);

        let stop = AtomicBool::new(false);
        let mut reports = Vec::new();
        let ticks = stimulus.run(Instant::now(), Some(Duration::from_millis(30)), &stop, |r| {
            reports.push(*r)
        });
        assert!(ticks > 0);
        assert_eq!(reports.len() as u64, ticks);
        assert!(reports.windows(2).all(|w| w[0].t < w[1].t));
    }

    #[test]
    fn test_run_ticks_on_the_given_epoch() {
        let (mut stimulus, _tx, _seen) = setup();
        let epoch = Instant::now() - Duration::from_secs(2);
        let stop = AtomicBool::new(false);
        let mut reports = Vec::new();
        let started = epoch.elapsed().as_secs_f64();
        stimulus.run(epoch, Some(Duration::from_millis(20)), &stop, |r| reports.push(*r));
        let ended = epoch.elapsed().as_secs_f64();
        assert!(!reports.is_empty());
        assert!(reports.iter().all(|r| r.t >= started && r.t <= ended));
        assert_eq!(stimulus.estimator().log().dataframe().times()[0], reports[0].t);
    }

    #[test]
    fn test_protocol_exports_estimator_log() {
        let (mut stimulus, tx, _seen) = setup();
        stimulus.start_protocol();
        send_tail(&tx, &[0.1, 0.2, 0.3]);
        stimulus.tick(0.0);
        stimulus.tick(0.01);
        let dir = tempfile::tempdir().unwrap();
        let written = stimulus.end_protocol(Some(dir.path())).unwrap();
        let names: Vec<String> = written
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().any(|n| n.ends_with("_closed_loop_vigor.csv")));
        let vigor = written.iter().find(|p| p.to_string_lossy().ends_with("vigor.csv")).unwrap();
        assert_eq!(std::fs::read_to_string(vigor).unwrap().lines().count(), 3);
    }

    #[test]
    fn test_config_validation() {
        assert!(StimulusConfig::default().validate().is_ok());
        let bad = StimulusConfig {
            protocol: "a/b".into(),
            ..StimulusConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
