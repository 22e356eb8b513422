//! The host side of a closed-loop experiment.
//!
//! A [`Collector`] moves tracking output into accumulators; a
//! [`StimulusLoop`] ticks at a fixed period, asks the estimator for the
//! control signal and hands it to a [`StimulusSink`].

mod collector;
mod stimulus;

pub use collector::{Collector, DrainReport, TRACKING_FPS_FIELD};
pub use stimulus::{StimulusConfig, StimulusLoop, StimulusSink, TickReport};
