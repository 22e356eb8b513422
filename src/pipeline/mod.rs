//! Frame processing pipeline.
//!
//! A pipeline is a tree of nodes. Image-to-image nodes feed every child
//! with their output; image-to-data leaves each contribute a fixed block
//! of named values to the frame's [`FeatureTuple`].

mod diagnostic;
mod node;
mod params;
mod schema;
mod tree;

pub use diagnostic::{Diagnostic, Severity};
pub use node::{
    DataStage, DiagnosticSlot, ImageStage, ImageToData, ImageToImage, Node, NodeSpec, Processed,
    Stage, StageKind,
};
pub use params::{
    merge_updates, NodeParams, ParamError, ParamKind, ParamSet, ParamSpec, ParamTable,
    ParamUpdate, ParamValue, DIAGNOSTICS_KEY, RESET_KEY,
};
pub use schema::{FeatureSchema, FeatureTuple};
pub use tree::{
    DiagnosticSelector, Pipeline, PipelineError, PipelineOutput, PipelineSpec, UNPROCESSED,
};
