//! Finloop
//!
//! Real-time tracking of head-restrained and free-swimming larvae, and the
//! closed-loop estimators that turn tracking output into stimulus control.
//!
//! # Architecture
//!
//! ```text
//! capture → tracking worker (pipeline) → collector → accumulators
//!                                                        ↓
//!                              stimulus loop ← estimator ┘
//! ```
//!
//! - The frame grabber and the tracking worker each run on their own
//!   thread and talk over bounded channels.
//! - The worker runs the pipeline tree on every frame and emits one
//!   feature tuple per frame, in capture order.
//! - The host drains the worker into accumulators once per stimulus tick,
//!   then asks the estimator for a control signal.
//! - Frames and ticks are stamped in seconds since one epoch `Instant`,
//!   so tracking and estimator logs line up.
//!
//! # Example
//!
//! ```no_run
//! use finloop::{
//!     accumulator::AccumulatorConfig,
//!     capture::{CaptureConfig, FrameGrabber, SyntheticCamera},
//!     estimator::EstimatorConfig,
//!     experiment::{Collector, StimulusConfig, StimulusLoop},
//!     pipeline::PipelineSpec,
//!     tracking::{TrackingConfig, TrackingWorker},
//!     ControlSignal,
//! };
//! use std::sync::{atomic::AtomicBool, Arc};
//! use std::time::{Duration, Instant};
//!
//! let capture = CaptureConfig::default();
//! let stop = Arc::new(AtomicBool::new(false));
//! let epoch = Instant::now();
//! let (frames_tx, frames_rx) = crossbeam_channel::bounded(capture.queue_capacity);
//! let grabber =
//!     FrameGrabber::spawn(SyntheticCamera::new(), &capture, frames_tx, stop.clone(), true, epoch)
//!         .unwrap();
//! let (worker, channels) =
//!     TrackingWorker::spawn(PipelineSpec::tail(), frames_rx, &TrackingConfig::default(), stop.clone())
//!         .unwrap();
//!
//! let collector = Collector::new(AccumulatorConfig::default(), channels.output);
//! let estimator =
//!     EstimatorConfig::default().build(collector.tracking().clone(), AccumulatorConfig::default());
//! let sink = |t: f64, signal: ControlSignal| println!("{t:.3} {signal:?}");
//! let mut stimulus = StimulusLoop::new(StimulusConfig::default(), collector, estimator, sink);
//! stimulus.run(epoch, Some(Duration::from_secs(1)), &stop, |_| {});
//!
//! stop.store(true, std::sync::atomic::Ordering::Relaxed);
//! grabber.join();
//! worker.join().unwrap();
//! ```

#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod accumulator;
pub mod bouts;
pub mod capture;
pub mod config;
pub mod estimator;
pub mod experiment;
pub mod metrics;
pub mod pipeline;
pub mod stages;
pub mod tracking;

// Re-export commonly used types at crate root
pub use accumulator::{Accumulator, AccumulatorConfig};
pub use capture::{CaptureConfig, Frame, FrameGrabber, FrameSource, SyntheticCamera};
pub use config::FileConfig;
pub use estimator::{ControlSignal, Estimator, EstimatorConfig, Pose};
pub use experiment::{Collector, StimulusConfig, StimulusLoop};
pub use pipeline::{FeatureSchema, FeatureTuple, Pipeline, PipelineSpec};
pub use tracking::{TrackingConfig, TrackingWorker};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
