//! Prometheus metrics for the tracking loop.
//!
//! # Metrics Exposed
//!
//! ## Worker
//! - `finloop_frames_processed_total` - Frames run through the pipeline
//! - `finloop_frames_dropped_total` - Frames dropped by the grabber
//! - `finloop_display_dropped_total` - Display frames dropped
//! - `finloop_recording_dropped_total` - Recording frames dropped
//! - `finloop_pipeline_errors_total` - Frames the pipeline failed on
//! - `finloop_schema_changes_total` - Feature field changes
//!
//! ## Closed loop
//! - `finloop_tracking_fps` - Measured tracking frame rate
//! - `finloop_accumulator_rows` - Rows in the tracking accumulator
//! - `finloop_control_signal` - Latest control value
//! - `finloop_animal_detected` - Whether the latest signal saw an animal
//! - `finloop_bouts_detected` - Bouts finished since the last reset
//!
//! The HTTP exporter is behind the `metrics` feature.

mod collector;
#[cfg(feature = "metrics")]
mod server;

pub use collector::{MetricsError, MetricsRegistry, MetricsSnapshot};
#[cfg(feature = "metrics")]
pub use server::{MetricsServer, MetricsServerConfig, ServerError};
