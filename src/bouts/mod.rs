//! Causal segmentation of movement into discrete bouts.

mod detector;

pub use detector::{Bout, BoutDetector, BoutParams, BoutPhase, BoutState, BoutStep};
