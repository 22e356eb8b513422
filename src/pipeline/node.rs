//! Processing node capabilities and the closed set of node variants.

use super::diagnostic::Diagnostic;
use super::params::{ParamTable, ParamValue};
use crate::capture::Image;
use crate::stages::{
    BackgroundSubtractor, CentroidTailTracker, EllipseTarget, EllipseTracker, FishTracker,
    Passthrough, Prefilter, SweepTailTracker, Threshold,
};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;

/// Output of one stage invocation plus any advisory messages.
#[derive(Debug, Clone)]
pub struct Processed<T> {
    pub messages: Vec<Diagnostic>,
    pub output: T,
}

impl<T> Processed<T> {
    pub fn new(output: T) -> Self {
        Self {
            messages: Vec::new(),
            output,
        }
    }

    pub fn with_message(output: T, message: Diagnostic) -> Self {
        Self {
            messages: vec![message],
            output,
        }
    }
}

/// Named diagnostic image buffer owned by a stage.
///
/// Only the selected image (if any) is retained, so stages pay for the copy
/// only while an operator is looking at it.
#[derive(Debug, Clone)]
pub struct DiagnosticSlot {
    names: &'static [&'static str],
    selected: Option<&'static str>,
    image: Option<Image>,
}

impl DiagnosticSlot {
    pub fn new(names: &'static [&'static str]) -> Self {
        Self {
            names,
            selected: None,
            image: None,
        }
    }

    pub fn names(&self) -> &'static [&'static str] {
        self.names
    }

    /// Selects `name` (or nothing). Returns false for an unknown name.
    pub fn select(&mut self, name: Option<&str>) -> bool {
        self.image = None;
        match name {
            None => {
                self.selected = None;
                true
            }
            Some(name) => match self.names.iter().find(|n| **n == name) {
                Some(found) => {
                    self.selected = Some(found);
                    true
                }
                None => false,
            },
        }
    }

    /// True if `name` is the selected image.
    #[inline]
    pub fn wants(&self, name: &str) -> bool {
        self.selected == Some(name)
    }

    /// Stores `image` if `name` is selected; `make` is only called then.
    pub fn store_with(&mut self, name: &str, make: impl FnOnce() -> Image) {
        if self.wants(name) {
            self.image = Some(make());
        }
    }

    pub fn image(&self) -> Option<&Image> {
        self.image.as_ref()
    }
}

/// Behaviour shared by every node.
pub trait Stage {
    fn params(&self) -> &dyn ParamTable;
    fn params_mut(&mut self) -> &mut dyn ParamTable;
    fn diagnostics(&self) -> &DiagnosticSlot;
    fn diagnostics_mut(&mut self) -> &mut DiagnosticSlot;

    /// Clears internal state. Stateless stages do nothing.
    fn reset(&mut self) {}
}

/// A node transforming one image into another.
pub trait ImageToImage: Stage {
    fn process<'a>(&mut self, image: &'a Image) -> Processed<Cow<'a, Image>>;
}

/// A leaf node extracting a fixed-width numeric tuple from an image.
pub trait ImageToData: Stage {
    /// Names of the values produced by [`ImageToData::process`], in order.
    fn output_fields(&self) -> Vec<String>;
    fn process(&mut self, image: &Image) -> Processed<Vec<f64>>;
}

macro_rules! dispatch {
    ($value:expr, $enum:ident, $s:ident => $body:expr, [$($variant:ident),*]) => {
        match $value {
            $($enum::$variant($s) => $body,)*
        }
    };
}

/// Image-to-image node variants.
#[derive(Debug, Clone)]
pub enum ImageStage {
    Passthrough(Passthrough),
    Prefilter(Prefilter),
    Background(BackgroundSubtractor),
    Threshold(Threshold),
}

macro_rules! image_dispatch {
    ($value:expr, $s:ident => $body:expr) => {
        dispatch!($value, ImageStage, $s => $body, [Passthrough, Prefilter, Background, Threshold])
    };
}

impl ImageStage {
    pub fn process<'a>(&mut self, image: &'a Image) -> Processed<Cow<'a, Image>> {
        image_dispatch!(self, s => s.process(image))
    }

    pub fn stage(&self) -> &dyn Stage {
        image_dispatch!(self, s => s as &dyn Stage)
    }

    pub fn stage_mut(&mut self) -> &mut dyn Stage {
        image_dispatch!(self, s => s as &mut dyn Stage)
    }
}

/// Image-to-data leaf variants.
#[derive(Debug, Clone)]
pub enum DataStage {
    CentroidTail(CentroidTailTracker),
    SweepTail(SweepTailTracker),
    Ellipse(EllipseTracker),
    Fish(FishTracker),
}

macro_rules! data_dispatch {
    ($value:expr, $s:ident => $body:expr) => {
        dispatch!($value, DataStage, $s => $body, [CentroidTail, SweepTail, Ellipse, Fish])
    };
}

impl DataStage {
    pub fn process(&mut self, image: &Image) -> Processed<Vec<f64>> {
        data_dispatch!(self, s => s.process(image))
    }

    pub fn output_fields(&self) -> Vec<String> {
        data_dispatch!(self, s => s.output_fields())
    }

    pub fn stage(&self) -> &dyn Stage {
        data_dispatch!(self, s => s as &dyn Stage)
    }

    pub fn stage_mut(&mut self) -> &mut dyn Stage {
        data_dispatch!(self, s => s as &mut dyn Stage)
    }
}

/// A node of either kind.
#[derive(Debug, Clone)]
pub enum Node {
    Image(ImageStage),
    Data(DataStage),
}

impl Node {
    pub fn stage(&self) -> &dyn Stage {
        match self {
            Node::Image(s) => s.stage(),
            Node::Data(s) => s.stage(),
        }
    }

    pub fn stage_mut(&mut self) -> &mut dyn Stage {
        match self {
            Node::Image(s) => s.stage_mut(),
            Node::Data(s) => s.stage_mut(),
        }
    }

    pub fn is_leaf_kind(&self) -> bool {
        matches!(self, Node::Data(_))
    }
}

/// Serializable node type, used to describe pipelines before setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Source,
    Prefilter,
    BackgroundSubtraction,
    Threshold,
    CentroidTail,
    SweepTail,
    Eyes,
    BodyEllipse,
    Fish,
}

impl StageKind {
    /// Builds the node with its default parameter set.
    pub fn instantiate(self) -> Node {
        match self {
            StageKind::Source => Node::Image(ImageStage::Passthrough(Passthrough::new())),
            StageKind::Prefilter => Node::Image(ImageStage::Prefilter(Prefilter::new())),
            StageKind::BackgroundSubtraction => {
                Node::Image(ImageStage::Background(BackgroundSubtractor::new()))
            }
            StageKind::Threshold => Node::Image(ImageStage::Threshold(Threshold::new())),
            StageKind::CentroidTail => {
                Node::Data(DataStage::CentroidTail(CentroidTailTracker::new()))
            }
            StageKind::SweepTail => Node::Data(DataStage::SweepTail(SweepTailTracker::new())),
            StageKind::Eyes => {
                Node::Data(DataStage::Ellipse(EllipseTracker::new(EllipseTarget::Eyes)))
            }
            StageKind::BodyEllipse => {
                Node::Data(DataStage::Ellipse(EllipseTracker::new(EllipseTarget::Body)))
            }
            StageKind::Fish => Node::Data(DataStage::Fish(FishTracker::new())),
        }
    }

    pub fn is_image_to_image(self) -> bool {
        matches!(
            self,
            StageKind::Source
                | StageKind::Prefilter
                | StageKind::BackgroundSubtraction
                | StageKind::Threshold
        )
    }
}

/// Description of one node and its subtree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    pub kind: StageKind,
    /// Initial parameter overrides.
    #[serde(default)]
    pub params: BTreeMap<String, ParamValue>,
    #[serde(default)]
    pub children: Vec<NodeSpec>,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>, kind: StageKind) -> Self {
        Self {
            name: name.into(),
            kind,
            params: BTreeMap::new(),
            children: Vec::new(),
        }
    }

    pub fn param(mut self, name: &str, value: impl Into<ParamValue>) -> Self {
        self.params.insert(name.to_string(), value.into());
        self
    }

    pub fn child(mut self, child: NodeSpec) -> Self {
        self.children.push(child);
        self
    }
}
