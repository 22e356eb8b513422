//! The tracking worker thread.
//!
//! Owns the [`Pipeline`], pulls frames from the grabber queue, applies
//! coalesced parameter updates between frames, and publishes feature
//! tuples on the output channel. Display, recording, framerate and status
//! channels are best-effort; the feature output is not, and a full or
//! closed output channel stops the worker with an error.

use super::framerate::{FramerateTracker, SharedFramerate};
use crate::capture::{Frame, Image};
use crate::pipeline::{
    merge_updates, Diagnostic, FeatureSchema, FeatureTuple, ParamUpdate, Pipeline, PipelineError,
    PipelineSpec,
};
use crossbeam_channel::{
    bounded, unbounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError,
};
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Longest wait for a frame before re-checking the stop flag.
    pub frame_timeout_ms: u64,
    /// Rate at which frames are forwarded for display.
    pub display_fps: f64,
    /// Timestamps used for the rolling frame rate.
    pub framerate_window: usize,
    /// A framerate sample is published every this many frames.
    pub framerate_every: u64,
    pub output_capacity: usize,
    /// Longest wait on a full output channel before giving up.
    pub output_timeout_ms: u64,
    pub recording_capacity: usize,
    pub display_capacity: usize,
    pub status_capacity: usize,
    /// Bound on waiting for the thread at shutdown.
    pub join_timeout_ms: u64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            frame_timeout_ms: 10,
            display_fps: 30.0,
            framerate_window: 20,
            framerate_every: 50,
            output_capacity: 4096,
            output_timeout_ms: 200,
            recording_capacity: 64,
            display_capacity: 4,
            status_capacity: 256,
            join_timeout_ms: 2000,
        }
    }
}

impl TrackingConfig {
    pub fn validate(&self) -> Result<(), crate::capture::ConfigError> {
        use crate::capture::ConfigError;
        if self.frame_timeout_ms == 0 || self.join_timeout_ms == 0 {
            return Err(ConfigError::Invalid("tracking timeouts must be positive".into()));
        }
        if !self.display_fps.is_finite() || self.display_fps <= 0.0 {
            return Err(ConfigError::Invalid("tracking.display_fps must be positive".into()));
        }
        if self.framerate_window < 2 || self.framerate_every == 0 {
            return Err(ConfigError::Invalid(
                "tracking.framerate_window must be at least 2 and framerate_every at least 1"
                    .into(),
            ));
        }
        if [
            self.output_capacity,
            self.recording_capacity,
            self.display_capacity,
            self.status_capacity,
        ]
        .contains(&0)
        {
            return Err(ConfigError::Invalid("tracking channel capacities must be positive".into()));
        }
        Ok(())
    }

    fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    fn output_timeout(&self) -> Duration {
        Duration::from_millis(self.output_timeout_ms)
    }
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("pipeline setup failed: {0}")]
    Setup(#[from] PipelineError),
    #[error("feature output channel is full")]
    OutputFull,
    #[error("feature output channel disconnected")]
    OutputDisconnected,
    #[error("failed to spawn tracking thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("tracking thread exited before reporting setup")]
    SetupLost,
    #[error("tracking thread panicked")]
    Panicked,
    #[error("tracking thread did not stop within {0:?}")]
    JoinTimeout(Duration),
}

/// One frame's features on the output channel.
#[derive(Debug, Clone)]
pub struct TrackedSample {
    pub t: f64,
    pub sequence: u64,
    pub features: FeatureTuple,
    /// First sample after the feature fields changed.
    pub schema_changed: bool,
}

/// A frame forwarded for display, or the selected diagnostic image.
#[derive(Debug, Clone)]
pub struct DisplayFrame {
    pub t: f64,
    pub sequence: u64,
    pub image: Image,
    pub is_diagnostic: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FramerateSample {
    pub t: f64,
    pub fps: f64,
}

/// Host side of the worker's channels.
#[derive(Debug)]
pub struct TrackingChannels {
    /// Parameter updates; pending updates are merged and only the result
    /// is applied.
    pub params: Sender<ParamUpdate>,
    pub output: Receiver<TrackedSample>,
    pub status: Receiver<Diagnostic>,
    pub display: Receiver<DisplayFrame>,
    /// Copies of incoming frames while recording is enabled.
    pub recording: Receiver<Frame>,
    pub framerate: Receiver<FramerateSample>,
}

struct WorkerEnds {
    frames: Receiver<Frame>,
    params: Receiver<ParamUpdate>,
    output: Sender<TrackedSample>,
    status: Sender<Diagnostic>,
    display: Sender<DisplayFrame>,
    recording: Sender<Frame>,
    framerate: Sender<FramerateSample>,
}

#[derive(Debug, Default)]
struct WorkerCounters {
    frames_processed: AtomicU64,
    display_dropped: AtomicU64,
    recording_dropped: AtomicU64,
    pipeline_errors: AtomicU64,
    schema_changes: AtomicU64,
}

/// Counter snapshot from a running or finished worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub frames_processed: u64,
    pub display_dropped: u64,
    pub recording_dropped: u64,
    pub pipeline_errors: u64,
    pub schema_changes: u64,
}

struct Ready {
    schema: Arc<FeatureSchema>,
    diagnostic_options: Vec<String>,
    params: ParamUpdate,
}

/// Spawns tracking threads.
pub struct TrackingWorker;

impl TrackingWorker {
    /// Builds the pipeline on a new thread and starts processing `frames`.
    ///
    /// Returns once the pipeline is set up, or with its setup error.
    pub fn spawn(
        spec: PipelineSpec,
        frames: Receiver<Frame>,
        config: &TrackingConfig,
        stop: Arc<AtomicBool>,
    ) -> Result<(WorkerHandle, TrackingChannels), WorkerError> {
        let (params_tx, params_rx) = unbounded();
        let (output_tx, output_rx) = bounded(config.output_capacity);
        let (status_tx, status_rx) = bounded(config.status_capacity);
        let (display_tx, display_rx) = bounded(config.display_capacity);
        let (recording_tx, recording_rx) = bounded(config.recording_capacity);
        let (framerate_tx, framerate_rx) = bounded(64);
        let (ready_tx, ready_rx) = bounded(1);
        let (done_tx, done_rx) = bounded::<()>(0);

        let ends = WorkerEnds {
            frames,
            params: params_rx,
            output: output_tx,
            status: status_tx,
            display: display_tx,
            recording: recording_tx,
            framerate: framerate_tx,
        };
        let recording = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(WorkerCounters::default());
        let framerate = SharedFramerate::new();

        let worker_recording = Arc::clone(&recording);
        let worker_counters = Arc::clone(&counters);
        let worker_framerate = framerate.clone();
        let worker_config = config.clone();

        let handle = std::thread::Builder::new()
            .name("tracking".into())
            .spawn(move || {
                let _done = done_tx;
                let pipeline = match Pipeline::setup(&spec) {
                    Ok(pipeline) => pipeline,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return Ok(());
                    }
                };
                let _ = ready_tx.send(Ok(Ready {
                    schema: Arc::clone(pipeline.schema()),
                    diagnostic_options: pipeline.diagnostic_options(),
                    params: pipeline.params_snapshot(),
                }));
                Worker {
                    pipeline,
                    ends,
                    framerate_tracker: FramerateTracker::new(worker_config.framerate_window),
                    config: worker_config,
                    stop,
                    recording: worker_recording,
                    counters: worker_counters,
                    framerate: worker_framerate,
                    frame_count: 0,
                    last_messages: Vec::new(),
                }
                .run()
            })?;

        let ready = match ready_rx.recv() {
            Ok(Ok(ready)) => ready,
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(WorkerError::Setup(e));
            }
            Err(_) => {
                let _ = handle.join();
                return Err(WorkerError::SetupLost);
            }
        };
        tracing::info!(
            fields = ready.schema.len(),
            nodes = ready.params.len(),
            "Tracking worker started"
        );

        let handle = WorkerHandle {
            handle: Some(handle),
            done: done_rx,
            join_timeout: Duration::from_millis(config.join_timeout_ms),
            recording,
            counters,
            framerate,
            schema: ready.schema,
            diagnostic_options: ready.diagnostic_options,
            params: ready.params,
        };
        let channels = TrackingChannels {
            params: params_tx,
            output: output_rx,
            status: status_rx,
            display: display_rx,
            recording: recording_rx,
            framerate: framerate_rx,
        };
        Ok((handle, channels))
    }
}

/// Controls and observes a running tracking thread.
pub struct WorkerHandle {
    handle: Option<JoinHandle<Result<(), WorkerError>>>,
    done: Receiver<()>,
    join_timeout: Duration,
    recording: Arc<AtomicBool>,
    counters: Arc<WorkerCounters>,
    framerate: SharedFramerate,
    schema: Arc<FeatureSchema>,
    diagnostic_options: Vec<String>,
    params: ParamUpdate,
}

impl WorkerHandle {
    /// Output schema right after setup.
    pub fn initial_schema(&self) -> &Arc<FeatureSchema> {
        &self.schema
    }

    /// Valid diagnostic image selectors.
    pub fn diagnostic_options(&self) -> &[String] {
        &self.diagnostic_options
    }

    /// Every node's parameters right after setup.
    pub fn initial_params(&self) -> &ParamUpdate {
        &self.params
    }

    pub fn set_recording(&self, enabled: bool) {
        self.recording.store(enabled, Ordering::Relaxed);
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Relaxed)
    }

    /// Latest measured frame rate, 0 until known.
    pub fn framerate(&self) -> f64 {
        self.framerate.load()
    }

    pub fn stats(&self) -> WorkerStats {
        let c = &self.counters;
        WorkerStats {
            frames_processed: c.frames_processed.load(Ordering::Relaxed),
            display_dropped: c.display_dropped.load(Ordering::Relaxed),
            recording_dropped: c.recording_dropped.load(Ordering::Relaxed),
            pipeline_errors: c.pipeline_errors.load(Ordering::Relaxed),
            schema_changes: c.schema_changes.load(Ordering::Relaxed),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Waits up to the configured timeout for the thread to exit.
    ///
    /// The stop flag must already be raised (or the frame queue closed).
    /// A thread still running after the timeout is left detached.
    pub fn join(mut self) -> Result<WorkerStats, WorkerError> {
        if let Err(RecvTimeoutError::Timeout) = self.done.recv_timeout(self.join_timeout) {
            tracing::error!(timeout = ?self.join_timeout, "Tracking worker did not stop");
            return Err(WorkerError::JoinTimeout(self.join_timeout));
        }
        let stats = self.stats();
        match self.handle.take().map(JoinHandle::join) {
            Some(Ok(result)) => result.map(|()| stats),
            Some(Err(_)) => Err(WorkerError::Panicked),
            None => Ok(stats),
        }
    }
}

struct Worker {
    pipeline: Pipeline,
    ends: WorkerEnds,
    config: TrackingConfig,
    stop: Arc<AtomicBool>,
    recording: Arc<AtomicBool>,
    counters: Arc<WorkerCounters>,
    framerate: SharedFramerate,
    framerate_tracker: FramerateTracker,
    frame_count: u64,
    last_messages: Vec<Diagnostic>,
}

impl Worker {
    fn run(mut self) -> Result<(), WorkerError> {
        let result = self.run_loop();
        match &result {
            Ok(()) => tracing::info!(
                frames = self.counters.frames_processed.load(Ordering::Relaxed),
                "Tracking worker stopped"
            ),
            Err(e) => tracing::error!(error = %e, "Tracking worker failed"),
        }
        result
    }

    fn run_loop(&mut self) -> Result<(), WorkerError> {
        while !self.stop.load(Ordering::Relaxed) {
            self.apply_pending_params();

            let frame = match self.ends.frames.recv_timeout(self.config.frame_timeout()) {
                Ok(frame) => frame,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    tracing::debug!("Frame queue closed");
                    break;
                }
            };
            self.process(frame)?;
        }
        Ok(())
    }

    fn apply_pending_params(&mut self) {
        let mut pending = ParamUpdate::new();
        for update in self.ends.params.try_iter() {
            merge_updates(&mut pending, update);
        }
        if pending.is_empty() {
            return;
        }
        tracing::debug!(paths = pending.len(), "Applying parameter update");
        if let Err(e) = self.pipeline.deserialize_params(&pending) {
            let rejected = match e {
                PipelineError::Rejected(list) => list,
                other => vec![other],
            };
            for e in rejected {
                tracing::warn!(error = %e, "Parameter update rejected");
                self.status(Diagnostic::warning(format!("rejected parameter: {e}")));
            }
        }
    }

    fn process(&mut self, frame: Frame) -> Result<(), WorkerError> {
        let t = frame.timestamp();
        let sequence = frame.sequence();
        self.frame_count += 1;
        if t.is_finite() {
            self.update_framerate(t);
        }

        if self.recording.load(Ordering::Relaxed) {
            if let Err(TrySendError::Full(_)) = self.ends.recording.try_send(frame.clone()) {
                self.counters.recording_dropped.fetch_add(1, Ordering::Relaxed);
                self.status(Diagnostic::warning(format!(
                    "recording queue full, frame {sequence} dropped"
                )));
            }
        }

        let pipeline = &mut self.pipeline;
        let run = catch_unwind(AssertUnwindSafe(|| pipeline.run(&frame)));
        let (features, schema_changed, messages, diagnostic) = match run {
            Ok(Ok(output)) => (
                output.features,
                output.schema_changed,
                output.messages,
                output.diagnostic,
            ),
            Ok(Err(e)) => {
                self.counters.pipeline_errors.fetch_add(1, Ordering::Relaxed);
                let message = Diagnostic::error(e.to_string());
                if !t.is_finite() {
                    // no place on the time axis for it
                    self.status(message);
                    return Ok(());
                }
                (
                    FeatureTuple::invalid(Arc::clone(self.pipeline.schema())),
                    false,
                    vec![message],
                    None,
                )
            }
            Err(payload) => {
                self.counters.pipeline_errors.fetch_add(1, Ordering::Relaxed);
                let reason = panic_message(payload.as_ref());
                tracing::error!(sequence, reason = %reason, "Pipeline panicked, resetting");
                self.pipeline.reset();
                let message = Diagnostic::error(format!("pipeline failed on frame {sequence}: {reason}"));
                (
                    FeatureTuple::invalid(Arc::clone(self.pipeline.schema())),
                    false,
                    vec![message],
                    None,
                )
            }
        };

        if schema_changed {
            self.counters.schema_changes.fetch_add(1, Ordering::Relaxed);
            tracing::info!(
                fields = features.schema().len(),
                version = features.schema().version(),
                "Feature schema changed"
            );
        }
        self.publish_messages(messages);
        self.forward_display(&frame, diagnostic);

        let sample = TrackedSample {
            t,
            sequence,
            features,
            schema_changed,
        };
        match self.ends.output.send_timeout(sample, self.config.output_timeout()) {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) => return Err(WorkerError::OutputFull),
            Err(SendTimeoutError::Disconnected(_)) => return Err(WorkerError::OutputDisconnected),
        }
        self.counters.frames_processed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn update_framerate(&mut self, t: f64) {
        self.framerate_tracker.tick(t);
        if self.frame_count % self.config.framerate_every != 0 {
            return;
        }
        if let Some(fps) = self.framerate_tracker.fps() {
            self.framerate.store(fps);
            if self.ends.framerate.try_send(FramerateSample { t, fps }).is_err() {
                tracing::trace!("Framerate sample dropped");
            }
        }
    }

    /// Forwards every n-th frame, n chosen so frames arrive at roughly the
    /// display rate.
    fn forward_display(&mut self, frame: &Frame, diagnostic: Option<Image>) {
        if !frame.is_valid() {
            return;
        }
        let every = match self.framerate_tracker.fps() {
            Some(fps) => (fps / self.config.display_fps).ceil().max(1.0) as u64,
            None => 1,
        };
        if (self.frame_count - 1) % every != 0 {
            return;
        }
        let is_diagnostic = diagnostic.is_some();
        let display = DisplayFrame {
            t: frame.timestamp(),
            sequence: frame.sequence(),
            image: diagnostic.unwrap_or_else(|| frame.image().clone()),
            is_diagnostic,
        };
        if let Err(TrySendError::Full(_)) = self.ends.display.try_send(display) {
            self.counters.display_dropped.fetch_add(1, Ordering::Relaxed);
            self.status(Diagnostic::warning(format!(
                "display queue full, frame {} dropped",
                frame.sequence()
            )));
        }
    }

    /// Sends per-frame messages; only changes are mirrored to the log.
    fn publish_messages(&mut self, messages: Vec<Diagnostic>) {
        if messages != self.last_messages {
            for message in messages.iter().filter(|m| !self.last_messages.contains(m)) {
                message.log();
            }
        }
        for message in &messages {
            self.send_status(message.clone());
        }
        self.last_messages = messages;
    }

    fn status(&self, message: Diagnostic) {
        message.log();
        self.send_status(message);
    }

    fn send_status(&self, message: Diagnostic) {
        if self.ends.status.try_send(message).is_err() {
            tracing::trace!("Status message dropped");
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{NodeSpec, ParamValue, Severity, StageKind};
    use std::collections::BTreeMap;

    fn frame(i: u64) -> Frame {
        Frame::new(Image::from_elem((120, 120), 10u8), i as f64 * 0.005, i)
    }

    fn test_config() -> TrackingConfig {
        TrackingConfig {
            framerate_every: 1,
            ..TrackingConfig::default()
        }
    }

    fn update(path: &str, name: &str, value: ParamValue) -> ParamUpdate {
        let mut values = BTreeMap::new();
        values.insert(name.to_string(), value);
        let mut update = ParamUpdate::new();
        update.insert(path.to_string(), values);
        update
    }

    #[test]
    fn test_config_validation() {
        assert!(TrackingConfig::default().validate().is_ok());
        let config = TrackingConfig {
            display_fps: 0.0,
            ..TrackingConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_setup_error_is_returned() {
        let spec = PipelineSpec::new(NodeSpec::new("tail", StageKind::CentroidTail));
        let (_tx, rx) = bounded(4);
        let result = TrackingWorker::spawn(spec, rx, &test_config(), Arc::new(AtomicBool::new(false)));
        assert!(matches!(result, Err(WorkerError::Setup(_))));
    }

    #[test]
    fn test_frames_in_order_and_clean_exit() {
        let (tx, rx) = bounded(64);
        let stop = Arc::new(AtomicBool::new(false));
        let (handle, channels) =
            TrackingWorker::spawn(PipelineSpec::tail(), rx, &test_config(), Arc::clone(&stop))
                .unwrap();
        for i in 0..20 {
            tx.send(frame(i)).unwrap();
        }
        drop(tx);

        let samples: Vec<TrackedSample> = (0..20)
            .map(|_| channels.output.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert!(samples.windows(2).all(|w| w[0].t <= w[1].t));
        assert_eq!(samples[0].features.schema().len(), handle.initial_schema().len());

        let stats = handle.join().unwrap();
        assert_eq!(stats.frames_processed, 20);
        assert!(channels.framerate.try_iter().count() > 0);
    }

    #[test]
    fn test_schema_change_reported_once() {
        let (tx, rx) = bounded(64);
        let stop = Arc::new(AtomicBool::new(false));
        let (handle, channels) =
            TrackingWorker::spawn(PipelineSpec::tail(), rx, &test_config(), Arc::clone(&stop))
                .unwrap();
        let before = handle.initial_schema().len();

        tx.send(frame(0)).unwrap();
        let first = channels.output.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!first.schema_changed);

        let path = handle
            .initial_params()
            .keys()
            .find(|p| p.ends_with("tailtrack"))
            .cloned()
            .unwrap();
        channels
            .params
            .send(update(&path, "n_output_segments", ParamValue::Int(4)))
            .unwrap();
        // the update lands between frames
        std::thread::sleep(Duration::from_millis(50));
        for i in 1..4 {
            tx.send(frame(i)).unwrap();
        }
        let rest: Vec<TrackedSample> = (0..3)
            .map(|_| channels.output.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert!(rest[0].schema_changed);
        assert!(!rest[1].schema_changed && !rest[2].schema_changed);
        assert_eq!(rest[0].features.schema().len(), 5);
        assert_ne!(before, 5);

        stop.store(true, Ordering::Relaxed);
        let stats = handle.join().unwrap();
        assert_eq!(stats.schema_changes, 1);
    }

    #[test]
    fn test_rejected_params_reported() {
        let (_tx, rx) = bounded(4);
        let stop = Arc::new(AtomicBool::new(false));
        let (handle, channels) =
            TrackingWorker::spawn(PipelineSpec::tail(), rx, &test_config(), Arc::clone(&stop))
                .unwrap();
        channels
            .params
            .send(update("/nowhere", "x", ParamValue::Int(1)))
            .unwrap();
        let message = channels.status.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(message.to_string().starts_with("W:rejected parameter"));
        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();
    }

    #[test]
    fn test_recording_copies_frames() {
        let (tx, rx) = bounded(64);
        let stop = Arc::new(AtomicBool::new(false));
        let (handle, channels) =
            TrackingWorker::spawn(PipelineSpec::tail(), rx, &test_config(), Arc::clone(&stop))
                .unwrap();
        tx.send(frame(0)).unwrap();
        channels.output.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(channels.recording.try_recv().is_err());

        handle.set_recording(true);
        tx.send(frame(1)).unwrap();
        channels.output.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(channels.recording.try_recv().unwrap().sequence(), 1);

        drop(tx);
        handle.join().unwrap();
    }

    #[test]
    fn test_bad_frame_does_not_stop_worker() {
        let (tx, rx) = bounded(64);
        let stop = Arc::new(AtomicBool::new(false));
        let (handle, channels) =
            TrackingWorker::spawn(PipelineSpec::tail(), rx, &test_config(), Arc::clone(&stop))
                .unwrap();
        tx.send(frame(0)).unwrap();
        tx.send(frame(1)).unwrap();
        tx.send(Frame::new(Image::from_elem((0, 0), 0u8), 0.010, 2)).unwrap();
        for i in 3..6 {
            tx.send(frame(i)).unwrap();
        }
        drop(tx);

        let samples: Vec<TrackedSample> = (0..6)
            .map(|_| channels.output.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        let sequences: Vec<u64> = samples.iter().map(|s| s.sequence).collect();
        assert_eq!(sequences, [0, 1, 2, 3, 4, 5]);
        assert_eq!(samples[2].t, 0.010);
        assert!(samples[2].features.values().iter().all(|v| v.is_nan()));
        assert_eq!(
            samples[2].features.values().len(),
            handle.initial_schema().len()
        );

        let stats = handle.join().unwrap();
        assert_eq!(stats.frames_processed, 6);
        assert_eq!(stats.pipeline_errors, 1);
        assert!(channels
            .status
            .try_iter()
            .any(|m| m.severity == Severity::Error && m.text.contains("frame 2")));
    }

    #[test]
    fn test_display_is_throttled() {
        // 200 fps against a 30 fps display: every 7th frame
        let config = TrackingConfig {
            display_capacity: 64,
            ..test_config()
        };
        let (tx, rx) = bounded(128);
        let stop = Arc::new(AtomicBool::new(false));
        let (handle, channels) =
            TrackingWorker::spawn(PipelineSpec::tail(), rx, &config, Arc::clone(&stop)).unwrap();
        for i in 0..70 {
            tx.send(frame(i)).unwrap();
        }
        drop(tx);
        for _ in 0..70 {
            channels.output.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        let stats = handle.join().unwrap();
        let shown: Vec<u64> = channels.display.try_iter().map(|d| d.sequence).collect();
        assert_eq!(shown, (0..70).step_by(7).collect::<Vec<u64>>());
        assert_eq!(stats.display_dropped, 0);
    }

    #[test]
    fn test_undrained_display_counts_drops() {
        let config = TrackingConfig {
            display_capacity: 2,
            ..test_config()
        };
        let (tx, rx) = bounded(128);
        let stop = Arc::new(AtomicBool::new(false));
        let (handle, channels) =
            TrackingWorker::spawn(PipelineSpec::tail(), rx, &config, Arc::clone(&stop)).unwrap();
        for i in 0..70 {
            tx.send(frame(i)).unwrap();
        }
        drop(tx);
        for _ in 0..70 {
            channels.output.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        let stats = handle.join().unwrap();
        assert_eq!(channels.display.try_iter().count(), 2);
        assert_eq!(stats.display_dropped, 8);
        assert_eq!(stats.frames_processed, 70);
    }

    #[test]
    fn test_output_disconnect_is_fatal() {
        let (tx, rx) = bounded(4);
        let stop = Arc::new(AtomicBool::new(false));
        let (handle, channels) =
            TrackingWorker::spawn(PipelineSpec::tail(), rx, &test_config(), Arc::clone(&stop))
                .unwrap();
        drop(channels);
        tx.send(frame(0)).unwrap();
        assert!(matches!(handle.join(), Err(WorkerError::OutputDisconnected)));
    }

    #[test]
    fn test_join_times_out_without_stop() {
        let (_tx, rx) = bounded(4);
        let config = TrackingConfig {
            join_timeout_ms: 50,
            ..test_config()
        };
        let stop = Arc::new(AtomicBool::new(false));
        let (handle, _channels) =
            TrackingWorker::spawn(PipelineSpec::tail(), rx, &config, Arc::clone(&stop)).unwrap();
        assert!(matches!(handle.join(), Err(WorkerError::JoinTimeout(_))));
        stop.store(true, Ordering::Relaxed);
    }

    #[test]
    fn test_panic_message_payloads() {
        assert_eq!(panic_message(&"boom"), "boom");
        assert_eq!(panic_message(&String::from("bang")), "bang");
        assert_eq!(panic_message(&5u8), "unknown panic");
    }
}
