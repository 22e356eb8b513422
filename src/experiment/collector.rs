//! Moves worker output into accumulators and runs the protocol lifecycle.

use crate::accumulator::{
    export_file_name, write_csv, Accumulator, AccumulatorConfig, AppendOutcome, ExportError,
};
use crate::pipeline::{Diagnostic, Severity};
use crate::tracking::{FramerateSample, TrackedSample};
use chrono::{DateTime, Utc};
use crossbeam_channel::Receiver;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

/// Name of the framerate accumulator's only field.
pub const TRACKING_FPS_FIELD: &str = "tracking_fps";

const RECENT_STATUS: usize = 100;

/// What one [`Collector::drain`] call moved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub samples: usize,
    /// The tracking accumulator was reset for a new set of fields.
    pub schema_changed: bool,
    /// Samples the accumulator refused (e.g. timestamps out of order).
    pub rejected: usize,
    pub framerate_samples: usize,
    pub messages: usize,
}

#[derive(Debug, Clone)]
struct ProtocolRun {
    name: String,
    started: DateTime<Utc>,
}

/// Drains the tracking worker's channels into accumulators.
///
/// The only writer of the tracking accumulator; estimators and plots hold
/// clones of it and read.
#[derive(Debug)]
pub struct Collector {
    output: Receiver<TrackedSample>,
    framerate: Option<Receiver<FramerateSample>>,
    status: Option<Receiver<Diagnostic>>,
    tracking: Accumulator,
    tracking_fps: Accumulator,
    logs: Vec<(String, Accumulator)>,
    recent_status: VecDeque<Diagnostic>,
    status_counts: [u64; 3],
    schema_changes: u64,
    protocol: Option<ProtocolRun>,
}

impl Collector {
    pub fn new(config: AccumulatorConfig, output: Receiver<TrackedSample>) -> Self {
        Self {
            output,
            framerate: None,
            status: None,
            tracking: Accumulator::new(config.clone()),
            tracking_fps: Accumulator::with_fields([TRACKING_FPS_FIELD], config),
            logs: Vec::new(),
            recent_status: VecDeque::with_capacity(RECENT_STATUS),
            status_counts: [0; 3],
            schema_changes: 0,
            protocol: None,
        }
    }

    pub fn with_framerate(mut self, framerate: Receiver<FramerateSample>) -> Self {
        self.framerate = Some(framerate);
        self
    }

    pub fn with_status(mut self, status: Receiver<Diagnostic>) -> Self {
        self.status = Some(status);
        self
    }

    /// Adds an accumulator that is reset and exported with the protocol.
    pub fn register_log(&mut self, name: impl Into<String>, log: Accumulator) {
        self.logs.push((name.into(), log));
    }

    pub fn tracking(&self) -> &Accumulator {
        &self.tracking
    }

    pub fn tracking_fps(&self) -> &Accumulator {
        &self.tracking_fps
    }

    pub fn schema_changes(&self) -> u64 {
        self.schema_changes
    }

    /// Status messages received so far, per severity.
    pub fn status_count(&self, severity: Severity) -> u64 {
        self.status_counts[severity as usize]
    }

    /// The most recent status messages, oldest first.
    pub fn recent_status(&self) -> impl Iterator<Item = &Diagnostic> {
        self.recent_status.iter()
    }

    pub fn protocol_running(&self) -> bool {
        self.protocol.is_some()
    }

    /// Moves everything currently queued without waiting.
    pub fn drain(&mut self) -> DrainReport {
        let mut report = DrainReport::default();

        for sample in self.output.try_iter() {
            match self.tracking.append(sample.t, &sample.features) {
                Ok(outcome) => {
                    report.samples += 1;
                    if outcome == AppendOutcome::SchemaChanged || sample.schema_changed {
                        report.schema_changed = true;
                    }
                }
                Err(e) => {
                    report.rejected += 1;
                    tracing::warn!(error = %e, sequence = sample.sequence, "Tracking sample rejected");
                }
            }
        }
        if report.schema_changed {
            self.schema_changes += 1;
            let fields = self.tracking.schema().map_or(0, |s| s.len());
            tracing::info!(fields, "Tracking log restarted with new fields");
        }

        if let Some(framerate) = &self.framerate {
            for sample in framerate.try_iter() {
                if self.tracking_fps.append_values(sample.t, &[sample.fps]).is_ok() {
                    report.framerate_samples += 1;
                }
            }
        }

        if let Some(status) = &self.status {
            for message in status.try_iter() {
                report.messages += 1;
                self.status_counts[message.severity as usize] += 1;
                if self.recent_status.len() == RECENT_STATUS {
                    self.recent_status.pop_front();
                }
                self.recent_status.push_back(message);
            }
        }
        report
    }

    fn accumulators(&self) -> impl Iterator<Item = (&str, &Accumulator)> {
        [("tracking", &self.tracking), ("framerate", &self.tracking_fps)]
            .into_iter()
            .chain(self.logs.iter().map(|(name, acc)| (name.as_str(), acc)))
    }

    /// Clears every accumulator and stops eviction until the protocol ends.
    pub fn start_protocol(&mut self, name: &str) {
        self.drain();
        for (_, acc) in self.accumulators() {
            acc.reset(None);
            acc.set_recording(true);
        }
        let started = Utc::now();
        tracing::info!(protocol = name, started = %started, "Protocol started");
        self.protocol = Some(ProtocolRun {
            name: name.to_string(),
            started,
        });
    }

    /// Ends the running protocol, writing one CSV per accumulator into
    /// `dir` when given. Returns the written paths.
    pub fn end_protocol(&mut self, dir: Option<&Path>) -> Result<Vec<PathBuf>, ExportError> {
        self.drain();
        let Some(run) = self.protocol.take() else {
            return Ok(Vec::new());
        };
        for (_, acc) in self.accumulators() {
            acc.set_recording(false);
        }
        tracing::info!(protocol = %run.name, samples = self.tracking.len(), "Protocol finished");

        let Some(dir) = dir else {
            return Ok(Vec::new());
        };
        std::fs::create_dir_all(dir)?;
        let mut written = Vec::new();
        for (name, acc) in self.accumulators() {
            let path = dir.join(export_file_name(&format!("{}_{name}", run.name), run.started));
            write_csv(&acc.dataframe(), &path)?;
            written.push(path);
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{FeatureSchema, FeatureTuple};
    use crossbeam_channel::{bounded, Sender};
    use std::sync::Arc;

    fn sample(schema: &Arc<FeatureSchema>, t: f64, changed: bool) -> TrackedSample {
        TrackedSample {
            t,
            sequence: 0,
            features: FeatureTuple::new(Arc::clone(schema), vec![t; schema.len()]).unwrap(),
            schema_changed: changed,
        }
    }

    fn collector() -> (Collector, Sender<TrackedSample>) {
        let (tx, rx) = bounded(64);
        (Collector::new(AccumulatorConfig::default(), rx), tx)
    }

    #[test]
    fn test_drain_empty_channel() {
        let (mut collector, _tx) = collector();
        assert_eq!(collector.drain(), DrainReport::default());
        assert!(collector.tracking().is_empty());
    }

    #[test]
    fn test_drain_appends_in_order() {
        let (mut collector, tx) = collector();
        let schema = Arc::new(FeatureSchema::new(["a", "b"], 1));
        for i in 0..5 {
            tx.send(sample(&schema, i as f64, false)).unwrap();
        }
        let report = collector.drain();
        assert_eq!(report.samples, 5);
        assert!(!report.schema_changed);
        assert_eq!(collector.tracking().dataframe().times(), &[0.0, 1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_schema_change_restarts_log() {
        let (mut collector, tx) = collector();
        let old = Arc::new(FeatureSchema::new(["a"], 1));
        let new = Arc::new(FeatureSchema::new(["a", "b"], 2));
        tx.send(sample(&old, 0.0, false)).unwrap();
        collector.drain();
        tx.send(sample(&new, 1.0, true)).unwrap();
        tx.send(sample(&new, 2.0, false)).unwrap();
        let report = collector.drain();
        assert!(report.schema_changed);
        assert_eq!(collector.schema_changes(), 1);
        let frame = collector.tracking().dataframe();
        assert_eq!(frame.len(), 2);
        assert_eq!(frame.columns().len(), 3);
    }

    #[test]
    fn test_out_of_order_rejected() {
        let (mut collector, tx) = collector();
        let schema = Arc::new(FeatureSchema::new(["a"], 1));
        tx.send(sample(&schema, 2.0, false)).unwrap();
        tx.send(sample(&schema, 1.0, false)).unwrap();
        let report = collector.drain();
        assert_eq!((report.samples, report.rejected), (1, 1));
    }

    #[test]
    fn test_framerate_and_status() {
        let (out_tx, out_rx) = bounded(4);
        let (fps_tx, fps_rx) = bounded(4);
        let (status_tx, status_rx) = bounded(4);
        let mut collector = Collector::new(AccumulatorConfig::default(), out_rx)
            .with_framerate(fps_rx)
            .with_status(status_rx);
        fps_tx.send(FramerateSample { t: 1.0, fps: 199.5 }).unwrap();
        status_tx.send(Diagnostic::warning("tail lost at segment 3")).unwrap();
        status_tx.send(Diagnostic::info("bout 1 finished after 9 samples")).unwrap();
        drop(out_tx);

        let report = collector.drain();
        assert_eq!(report.framerate_samples, 1);
        assert_eq!(report.messages, 2);
        assert_eq!(collector.tracking_fps().last().unwrap().values, vec![199.5]);
        assert_eq!(
            collector.tracking_fps().schema().unwrap().fields(),
            &[TRACKING_FPS_FIELD.to_string()]
        );
        assert_eq!(collector.status_count(Severity::Warning), 1);
        assert_eq!(collector.status_count(Severity::Error), 0);
        assert_eq!(collector.recent_status().count(), 2);
    }

    #[test]
    fn test_protocol_resets_and_exports() {
        let (mut collector, tx) = collector();
        let log = Accumulator::with_fields(["velocity"], AccumulatorConfig::default());
        collector.register_log("vigor", log.clone());
        let schema = Arc::new(FeatureSchema::new(["tail_sum"], 1));
        tx.send(sample(&schema, 0.0, false)).unwrap();
        log.append_values(0.0, &[1.0]).unwrap();
        collector.drain();

        collector.start_protocol("closed_loop");
        assert!(collector.tracking().is_empty());
        assert!(log.is_empty());
        assert!(collector.tracking().is_recording());

        tx.send(sample(&schema, 1.0, false)).unwrap();
        log.append_values(1.0, &[2.0]).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let written = collector.end_protocol(Some(dir.path())).unwrap();
        assert_eq!(written.len(), 3);
        assert!(written.iter().all(|p| p.exists()));
        assert!(written[0]
            .file_name()
            .unwrap()
            .to_string_lossy()
            .ends_with("_closed_loop_tracking.csv"));
        assert!(!collector.tracking().is_recording());

        let text = std::fs::read_to_string(&written[0]).unwrap();
        assert_eq!(text.lines().collect::<Vec<_>>(), ["t,tail_sum", "1,1"]);
    }

    #[test]
    fn test_end_without_protocol() {
        let (mut collector, _tx) = collector();
        assert!(collector.end_protocol(None).unwrap().is_empty());
    }
}
