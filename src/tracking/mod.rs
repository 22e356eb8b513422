//! The tracking worker and its frame-rate bookkeeping.

mod framerate;
mod worker;

pub use framerate::{FramerateTracker, SharedFramerate};
pub use worker::{
    DisplayFrame, FramerateSample, TrackedSample, TrackingChannels, TrackingConfig,
    TrackingWorker, WorkerError, WorkerHandle, WorkerStats,
};
