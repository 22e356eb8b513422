//! Concrete processing nodes.
//!
//! Image-to-image stages: [`Passthrough`], [`Prefilter`],
//! [`BackgroundSubtractor`], [`Threshold`]. Leaves: [`CentroidTailTracker`],
//! [`SweepTailTracker`], [`EllipseTracker`] and [`FishTracker`].

/// Implements the accessor half of [`crate::pipeline::Stage`] for a struct
/// with `params` and `diagnostics` fields.
macro_rules! stage_accessors {
    () => {
        fn params(&self) -> &dyn $crate::pipeline::ParamTable {
            &self.params
        }

        fn params_mut(&mut self) -> &mut dyn $crate::pipeline::ParamTable {
            &mut self.params
        }

        fn diagnostics(&self) -> &$crate::pipeline::DiagnosticSlot {
            &self.diagnostics
        }

        fn diagnostics_mut(&mut self) -> &mut $crate::pipeline::DiagnosticSlot {
            &mut self.diagnostics
        }
    };
}

mod background;
mod ellipse;
mod fish;
pub mod geometry;
mod prefilter;
mod tail;

pub use background::{BackgroundParams, BackgroundSubtractor};
pub use ellipse::{EllipseParams, EllipseTarget, EllipseTracker};
pub use fish::{trace_midline, FishParams, FishPose, FishTracker};
pub use prefilter::{
    box_blur, downscale, NoParams, Passthrough, Prefilter, PrefilterParams, Threshold,
    ThresholdParams,
};
pub use tail::{
    tail_fields, tail_sum, CentroidTailTracker, SweepTailParams, SweepTailTracker, TailParams,
};
