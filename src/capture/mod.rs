//! Camera input and frame handling.
//!
//! The camera itself is an external collaborator; this module defines the
//! frame type, the [`FrameSource`] contract it must satisfy, a synthetic
//! source for running without hardware, and the grabber thread that feeds
//! the bounded frame queue.

mod camera;
mod config;
mod frame;
pub mod synthetic;

pub use camera::{CameraError, FrameGrabber, FrameSource, SyntheticCamera};
pub use config::{CaptureConfig, ConfigError};
pub use frame::{Frame, Image};
pub use synthetic::{SceneConfig, SceneKind};
