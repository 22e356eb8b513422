//! Metrics collection and registry.

use crate::estimator::ControlSignal;
use crate::accumulator::Accumulator;
use crate::tracking::WorkerStats;
use prometheus::{Encoder, Gauge, IntCounter, IntGauge, Registry, TextEncoder};
use thiserror::Error;

/// Tracking field holding the fish tracker's finished-bout count.
const BOUT_COUNT_FIELD: &str = "f0_n_bouts";

/// Errors that can occur during metrics operations.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

/// A snapshot of system state for metrics update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    /// Frames run through the pipeline.
    pub frames_processed: u64,
    /// Frames the grabber dropped because the queue was full.
    pub frames_dropped: u64,
    pub display_dropped: u64,
    pub recording_dropped: u64,
    /// Frames the pipeline failed on.
    pub pipeline_errors: u64,
    pub schema_changes: u64,
    /// Measured tracking frame rate.
    pub tracking_fps: f64,
    /// Rows in the tracking accumulator.
    pub accumulator_len: usize,
    /// Latest control signal scalar, `None` when no animal was seen.
    pub control_signal: Option<f64>,
    /// Bouts finished since the last reset, if a fish is tracked.
    pub bouts_detected: Option<u64>,
}

impl MetricsSnapshot {
    /// Gathers a snapshot from the running components. `tracking` is the
    /// collector's tracking accumulator.
    pub fn from_components(
        stats: &WorkerStats,
        frames_dropped: u64,
        tracking_fps: f64,
        tracking: &Accumulator,
        signal: Option<&ControlSignal>,
    ) -> Self {
        let bouts_detected = tracking.schema().and_then(|schema| {
            let index = schema.index_of(BOUT_COUNT_FIELD)?;
            let value = tracking.last()?.values[index];
            value.is_finite().then_some(value as u64)
        });
        Self {
            frames_processed: stats.frames_processed,
            frames_dropped,
            display_dropped: stats.display_dropped,
            recording_dropped: stats.recording_dropped,
            pipeline_errors: stats.pipeline_errors,
            schema_changes: stats.schema_changes,
            tracking_fps,
            accumulator_len: tracking.len(),
            control_signal: signal.map(ControlSignal::primary).filter(|v| v.is_finite()),
            bouts_detected,
        }
    }
}

/// Prometheus metrics registry for tracking and closed-loop state.
pub struct MetricsRegistry {
    registry: Registry,

    // Worker counters
    frames_processed: IntCounter,
    frames_dropped: IntCounter,
    display_dropped: IntCounter,
    recording_dropped: IntCounter,
    pipeline_errors: IntCounter,
    schema_changes: IntCounter,

    // Loop state
    tracking_fps: Gauge,
    accumulator_len: IntGauge,
    control_signal: Gauge,
    animal_detected: IntGauge,
    bouts_detected: IntGauge,
}

/// Raises `counter` to `target`; counters never go down.
fn advance(counter: &IntCounter, target: u64) {
    let current = counter.get();
    if target > current {
        counter.inc_by(target - current);
    }
}

impl MetricsRegistry {
    /// Creates a new registry with every tracking metric registered.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let frames_processed = IntCounter::new(
            "finloop_frames_processed_total",
            "Frames run through the tracking pipeline",
        )?;
        let frames_dropped = IntCounter::new(
            "finloop_frames_dropped_total",
            "Frames dropped by the grabber because the frame queue was full",
        )?;
        let display_dropped = IntCounter::new(
            "finloop_display_dropped_total",
            "Display frames dropped because the display queue was full",
        )?;
        let recording_dropped = IntCounter::new(
            "finloop_recording_dropped_total",
            "Recording frames dropped because the recording queue was full",
        )?;
        let pipeline_errors = IntCounter::new(
            "finloop_pipeline_errors_total",
            "Frames on which the pipeline failed",
        )?;
        let schema_changes = IntCounter::new(
            "finloop_schema_changes_total",
            "Changes of the tracked feature fields",
        )?;

        let tracking_fps = Gauge::new("finloop_tracking_fps", "Measured tracking frame rate")?;
        let accumulator_len = IntGauge::new(
            "finloop_accumulator_rows",
            "Rows held in the tracking accumulator",
        )?;
        let control_signal = Gauge::new(
            "finloop_control_signal",
            "Latest closed-loop control value (velocity or x position)",
        )?;
        let animal_detected = IntGauge::new(
            "finloop_animal_detected",
            "Whether the latest control signal saw an animal (1=yes, 0=no)",
        )?;
        let bouts_detected = IntGauge::new(
            "finloop_bouts_detected",
            "Swim bouts finished since the last tracking reset",
        )?;

        registry.register(Box::new(frames_processed.clone()))?;
        registry.register(Box::new(frames_dropped.clone()))?;
        registry.register(Box::new(display_dropped.clone()))?;
        registry.register(Box::new(recording_dropped.clone()))?;
        registry.register(Box::new(pipeline_errors.clone()))?;
        registry.register(Box::new(schema_changes.clone()))?;
        registry.register(Box::new(tracking_fps.clone()))?;
        registry.register(Box::new(accumulator_len.clone()))?;
        registry.register(Box::new(control_signal.clone()))?;
        registry.register(Box::new(animal_detected.clone()))?;
        registry.register(Box::new(bouts_detected.clone()))?;

        Ok(Self {
            registry,
            frames_processed,
            frames_dropped,
            display_dropped,
            recording_dropped,
            pipeline_errors,
            schema_changes,
            tracking_fps,
            accumulator_len,
            control_signal,
            animal_detected,
            bouts_detected,
        })
    }

    /// Updates all metrics from a snapshot of system state.
    pub fn update(&self, snapshot: &MetricsSnapshot) {
        advance(&self.frames_processed, snapshot.frames_processed);
        advance(&self.frames_dropped, snapshot.frames_dropped);
        advance(&self.display_dropped, snapshot.display_dropped);
        advance(&self.recording_dropped, snapshot.recording_dropped);
        advance(&self.pipeline_errors, snapshot.pipeline_errors);
        advance(&self.schema_changes, snapshot.schema_changes);

        self.tracking_fps.set(snapshot.tracking_fps);
        self.accumulator_len.set(snapshot.accumulator_len as i64);
        match snapshot.control_signal {
            Some(value) => {
                self.control_signal.set(value);
                self.animal_detected.set(1);
            }
            None => self.animal_detected.set(0),
        }
        if let Some(bouts) = snapshot.bouts_detected {
            self.bouts_detected.set(bouts as i64);
        }
    }

    /// Returns the underlying Prometheus registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
