//! The processing tree and its per-frame traversal.

use super::diagnostic::Diagnostic;
use super::node::{Node, NodeSpec, StageKind};
use super::params::{ParamError, ParamUpdate, DIAGNOSTICS_KEY, RESET_KEY};
use super::schema::{FeatureSchema, FeatureTuple};
use crate::capture::{Frame, Image};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Selector value meaning "show the raw camera frame".
pub const UNPROCESSED: &str = "unprocessed";

/// Errors raised while building or driving a pipeline.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("root node must be an image-to-image node, got {0:?}")]
    RootNotImage(StageKind),
    #[error("node {0:?} is a leaf kind and cannot have children")]
    LeafWithChildren(String),
    #[error("invalid node name {0:?}")]
    InvalidName(String),
    #[error("duplicate node path {0:?}")]
    DuplicatePath(String),
    #[error("duplicate feature field {0:?}")]
    DuplicateField(String),
    #[error("no node at path {0:?}")]
    UnknownNode(String),
    #[error("unknown diagnostic image {0:?}")]
    UnknownDiagnostic(String),
    #[error("parameter {path}:{name} rejected: {source}")]
    Param {
        path: String,
        name: String,
        source: ParamError,
    },
    #[error("{} parameter update(s) rejected, first: {}", .0.len(), .0[0])]
    Rejected(Vec<PipelineError>),
    #[error("frame {0} is empty or has an invalid timestamp")]
    InvalidFrame(u64),
}

/// Description of a whole pipeline, set up later inside the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub root: NodeSpec,
}

impl PipelineSpec {
    pub fn new(root: NodeSpec) -> Self {
        Self { root }
    }

    /// Head-restrained larva: prefiltered centroid tail tracking.
    pub fn tail() -> Self {
        Self::new(
            NodeSpec::new("source", StageKind::Source).child(
                NodeSpec::new("prefilter", StageKind::Prefilter)
                    .child(NodeSpec::new("tailtrack", StageKind::CentroidTail)),
            ),
        )
    }

    /// Head-restrained larva: tail plus eyes on a second branch.
    ///
    /// The eye crop matches the default synthetic scene.
    pub fn tail_and_eyes() -> Self {
        Self::new(
            NodeSpec::new("source", StageKind::Source)
                .child(
                    NodeSpec::new("prefilter", StageKind::Prefilter)
                        .child(NodeSpec::new("tailtrack", StageKind::CentroidTail)),
                )
                .child(
                    NodeSpec::new("eyetrack", StageKind::Eyes)
                        .param("dark", false)
                        .param("threshold", 128i64)
                        .param("crop_x", 130i64)
                        .param("crop_y", 36i64)
                        .param("crop_w", 60i64)
                        .param("crop_h", 30i64),
                ),
        )
    }

    /// Freely swimming larva: background subtraction then fish tracking.
    pub fn free_swimming() -> Self {
        Self::new(
            NodeSpec::new("source", StageKind::Source).child(
                NodeSpec::new("bgsub", StageKind::BackgroundSubtraction)
                    .child(NodeSpec::new("fishtrack", StageKind::Fish)),
            ),
        )
    }

    /// Looks up a preset by name.
    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "tail" => Some(Self::tail()),
            "tail_and_eyes" => Some(Self::tail_and_eyes()),
            "free_swimming" => Some(Self::free_swimming()),
            _ => None,
        }
    }
}

/// Which node's diagnostic buffer replaces the camera frame on display.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DiagnosticSelector {
    #[default]
    Unprocessed,
    Node { path: String, image: String },
}

impl DiagnosticSelector {
    /// Parses `"unprocessed"` or `"<node-path>/<image-name>"`.
    pub fn parse(selector: &str) -> Result<Self, PipelineError> {
        if selector.is_empty() || selector == UNPROCESSED {
            return Ok(Self::Unprocessed);
        }
        let (path, image) = selector
            .rsplit_once('/')
            .filter(|(_, image)| !image.is_empty())
            .ok_or_else(|| PipelineError::UnknownDiagnostic(selector.to_string()))?;
        let path = if path.is_empty() { "/" } else { path };
        Ok(Self::Node {
            path: path.to_string(),
            image: image.to_string(),
        })
    }
}

impl fmt::Display for DiagnosticSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unprocessed => f.write_str(UNPROCESSED),
            Self::Node { path, image } if path == "/" => write!(f, "/{image}"),
            Self::Node { path, image } => write!(f, "{path}/{image}"),
        }
    }
}

/// Result of running the pipeline on one frame.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub messages: Vec<Diagnostic>,
    pub features: FeatureTuple,
    /// Selected diagnostic image, if one is selected and was produced.
    pub diagnostic: Option<Image>,
    /// True on the first run after the output fields changed.
    pub schema_changed: bool,
}

#[derive(Debug, Clone)]
struct TreeNode {
    name: String,
    path: String,
    node: Node,
    children: Vec<usize>,
    schema_dirty: bool,
}

/// A rooted tree of processing nodes.
///
/// Built from a [`PipelineSpec`] by [`Pipeline::setup`], which should run on
/// the thread that will call [`Pipeline::run`]. Node parameters and stateful
/// caches then stay private to that thread.
#[derive(Debug, Clone)]
pub struct Pipeline {
    nodes: Vec<TreeNode>,
    leaves: Vec<usize>,
    schema: Arc<FeatureSchema>,
    schema_changed: bool,
    selector: DiagnosticSelector,
}

impl Pipeline {
    /// Instantiates every node and its parameter set.
    pub fn setup(spec: &PipelineSpec) -> Result<Self, PipelineError> {
        if !spec.root.kind.is_image_to_image() {
            return Err(PipelineError::RootNotImage(spec.root.kind));
        }

        let mut pipeline = Self {
            nodes: Vec::new(),
            leaves: Vec::new(),
            schema: Arc::new(FeatureSchema::new(Vec::<String>::new(), 0)),
            schema_changed: false,
            selector: DiagnosticSelector::Unprocessed,
        };
        let mut paths = HashSet::new();
        pipeline.add_node(&spec.root, None, &mut paths)?;

        let mut seen = HashSet::new();
        for &leaf in &pipeline.leaves {
            if let Node::Data(stage) = &pipeline.nodes[leaf].node {
                for field in stage.output_fields() {
                    if !seen.insert(field.clone()) {
                        return Err(PipelineError::DuplicateField(field));
                    }
                }
            }
        }
        pipeline.schema = Arc::new(FeatureSchema::new(pipeline.collect_fields(), 1));
        for node in &mut pipeline.nodes {
            node.schema_dirty = false;
        }

        tracing::info!(
            nodes = pipeline.nodes.len(),
            fields = pipeline.schema.len(),
            "Pipeline set up"
        );
        Ok(pipeline)
    }

    fn add_node(
        &mut self,
        spec: &NodeSpec,
        parent: Option<usize>,
        paths: &mut HashSet<String>,
    ) -> Result<usize, PipelineError> {
        let path = match parent {
            None => "/".to_string(),
            Some(parent) => {
                if spec.name.is_empty() || spec.name.contains('/') || spec.name == UNPROCESSED {
                    return Err(PipelineError::InvalidName(spec.name.clone()));
                }
                let parent_path = &self.nodes[parent].path;
                if parent_path == "/" {
                    format!("/{}", spec.name)
                } else {
                    format!("{}/{}", parent_path, spec.name)
                }
            }
        };
        if !paths.insert(path.clone()) {
            return Err(PipelineError::DuplicatePath(path));
        }

        let mut node = spec.kind.instantiate();
        if node.is_leaf_kind() && !spec.children.is_empty() {
            return Err(PipelineError::LeafWithChildren(spec.name.clone()));
        }
        for (name, value) in &spec.params {
            node.stage_mut()
                .params_mut()
                .set_param(name, value)
                .map_err(|source| PipelineError::Param {
                    path: path.clone(),
                    name: name.clone(),
                    source,
                })?;
        }
        // Initial overrides are part of setup, not edits to report.
        node.stage_mut().params_mut().take_changed();

        let index = self.nodes.len();
        let is_leaf = node.is_leaf_kind();
        self.nodes.push(TreeNode {
            name: spec.name.clone(),
            path,
            node,
            children: Vec::new(),
            schema_dirty: false,
        });
        if is_leaf {
            self.leaves.push(index);
        }
        if let Some(parent) = parent {
            self.nodes[parent].children.push(index);
        }
        for child in &spec.children {
            self.add_node(child, Some(index), paths)?;
        }
        Ok(index)
    }

    /// Field names of every leaf, in traversal order. Fields that collide
    /// with an earlier leaf's are qualified with the node name.
    fn collect_fields(&self) -> Vec<String> {
        let mut fields: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for &leaf in &self.leaves {
            let node = &self.nodes[leaf];
            if let Node::Data(stage) = &node.node {
                for field in stage.output_fields() {
                    let name = if seen.contains(&field) {
                        format!("{}.{}", node.name, field)
                    } else {
                        field
                    };
                    seen.insert(name.clone());
                    fields.push(name);
                }
            }
        }
        fields
    }

    fn refresh_schema(&mut self) {
        if !self.nodes.iter().any(|n| n.schema_dirty) {
            return;
        }
        for node in &mut self.nodes {
            node.schema_dirty = false;
        }
        let fields = self.collect_fields();
        if fields != self.schema.fields() {
            let version = self.schema.version() + 1;
            tracing::info!(
                version,
                fields = fields.len(),
                "Pipeline output fields changed"
            );
            self.schema = Arc::new(FeatureSchema::new(fields, version));
            self.schema_changed = true;
        }
    }

    /// Current output schema.
    pub fn schema(&self) -> &Arc<FeatureSchema> {
        &self.schema
    }

    /// Paths of all nodes in traversal order.
    pub fn node_paths(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.path.as_str()).collect()
    }

    /// Every selectable diagnostic image, plus [`UNPROCESSED`].
    pub fn diagnostic_options(&self) -> Vec<String> {
        std::iter::once(UNPROCESSED.to_string())
            .chain(self.nodes.iter().flat_map(|n| {
                n.node.stage().diagnostics().names().iter().map(move |image| {
                    DiagnosticSelector::Node {
                        path: n.path.clone(),
                        image: image.to_string(),
                    }
                    .to_string()
                })
            }))
            .collect()
    }

    pub fn diagnostic_selector(&self) -> &DiagnosticSelector {
        &self.selector
    }

    fn find(&self, path: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.path == path)
    }

    /// Selects the diagnostic image shown instead of the camera frame.
    pub fn set_diagnostic(&mut self, selector: &str) -> Result<(), PipelineError> {
        let parsed = DiagnosticSelector::parse(selector)?;
        let target = match &parsed {
            DiagnosticSelector::Unprocessed => None,
            DiagnosticSelector::Node { path, image } => {
                let index = self
                    .find(path)
                    .ok_or_else(|| PipelineError::UnknownNode(path.clone()))?;
                let names = self.nodes[index].node.stage().diagnostics().names();
                if !names.iter().any(|n| *n == image.as_str()) {
                    return Err(PipelineError::UnknownDiagnostic(selector.to_string()));
                }
                Some((index, image.clone()))
            }
        };

        for node in &mut self.nodes {
            node.node.stage_mut().diagnostics_mut().select(None);
        }
        if let Some((index, image)) = target {
            self.nodes[index]
                .node
                .stage_mut()
                .diagnostics_mut()
                .select(Some(&image));
        }
        tracing::debug!(selector = %parsed, "Diagnostic image selected");
        self.selector = parsed;
        Ok(())
    }

    /// Clears the internal state of every stateful node.
    pub fn reset(&mut self) {
        for node in &mut self.nodes {
            node.node.stage_mut().reset();
        }
        tracing::info!("Pipeline state reset");
    }

    /// Parameters edited since the last call, keyed by node path.
    pub fn serialize_changed_params(&mut self) -> ParamUpdate {
        let mut update = ParamUpdate::new();
        for node in &mut self.nodes {
            let changed = node.node.stage_mut().params_mut().take_changed();
            if !changed.is_empty() {
                update.insert(node.path.clone(), changed);
            }
        }
        update
    }

    /// Every parameter of every node, keyed by node path.
    pub fn params_snapshot(&self) -> ParamUpdate {
        self.nodes
            .iter()
            .map(|n| (n.path.clone(), n.node.stage().params().snapshot()))
            .collect()
    }

    /// Applies a parameter update.
    ///
    /// Valid entries are applied even when others are rejected; the
    /// rejected ones are returned together.
    pub fn deserialize_params(&mut self, update: &ParamUpdate) -> Result<(), PipelineError> {
        let mut rejected = Vec::new();
        for (path, values) in update {
            match path.as_str() {
                DIAGNOSTICS_KEY => {
                    if let Some(selector) = values.get("image") {
                        let result = match selector.as_str() {
                            Some(selector) => self.set_diagnostic(selector),
                            None => Err(PipelineError::UnknownDiagnostic(selector.to_string())),
                        };
                        if let Err(e) = result {
                            rejected.push(e);
                        }
                    }
                }
                RESET_KEY => {
                    if values.get("reset").and_then(|v| v.as_bool()) == Some(true) {
                        self.reset();
                    }
                }
                _ => {
                    let Some(index) = self.find(path) else {
                        rejected.push(PipelineError::UnknownNode(path.clone()));
                        continue;
                    };
                    let node = &mut self.nodes[index];
                    for (name, value) in values {
                        match node.node.stage_mut().params_mut().set_param(name, value) {
                            Ok(schema) => node.schema_dirty |= schema,
                            Err(source) => rejected.push(PipelineError::Param {
                                path: path.clone(),
                                name: name.clone(),
                                source,
                            }),
                        }
                    }
                }
            }
        }

        if rejected.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::Rejected(rejected))
        }
    }

    /// Runs every node on `frame`.
    ///
    /// Image nodes feed their output to each child; leaf outputs are
    /// concatenated in traversal order. A leaf returning the wrong width is
    /// replaced by NaNs and reported.
    pub fn run(&mut self, frame: &Frame) -> Result<PipelineOutput, PipelineError> {
        if !frame.is_valid() {
            return Err(PipelineError::InvalidFrame(frame.sequence()));
        }
        self.refresh_schema();

        let mut values = Vec::with_capacity(self.schema.len());
        let mut messages = Vec::new();
        self.visit(0, frame.image(), &mut values, &mut messages);

        let features = FeatureTuple::new(Arc::clone(&self.schema), values).unwrap_or_else(|| {
            messages.push(Diagnostic::error("feature tuple width mismatch"));
            FeatureTuple::invalid(Arc::clone(&self.schema))
        });

        let diagnostic = match &self.selector {
            DiagnosticSelector::Unprocessed => None,
            DiagnosticSelector::Node { path, .. } => self
                .find(path)
                .and_then(|i| self.nodes[i].node.stage().diagnostics().image().cloned()),
        };

        Ok(PipelineOutput {
            messages,
            features,
            diagnostic,
            schema_changed: std::mem::take(&mut self.schema_changed),
        })
    }

    fn visit(
        &mut self,
        index: usize,
        image: &Image,
        values: &mut Vec<f64>,
        messages: &mut Vec<Diagnostic>,
    ) {
        match &mut self.nodes[index].node {
            Node::Image(stage) => {
                let processed = stage.process(image);
                messages.extend(processed.messages);
                let output = processed.output;
                let children = self.nodes[index].children.clone();
                for child in children {
                    self.visit(child, &output, values, messages);
                }
            }
            Node::Data(stage) => {
                let expected = stage.output_fields().len();
                let processed = stage.process(image);
                messages.extend(processed.messages);
                if processed.output.len() == expected {
                    values.extend(processed.output);
                } else {
                    messages.push(Diagnostic::error(format!(
                        "{} produced {} values, expected {}",
                        self.nodes[index].path,
                        processed.output.len(),
                        expected
                    )));
                    values.extend(std::iter::repeat(f64::NAN).take(expected));
                }
            }
        }
    }
}
