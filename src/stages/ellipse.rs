//! Ellipse fitting on thresholded blobs, for eyes and whole bodies.

use super::geometry::{fill_holes, find_regions, threshold_mask, EllipseFit, Region};
use crate::capture::Image;
use crate::pipeline::{
    Diagnostic, DiagnosticSlot, ImageToData, NodeParams, ParamSet, ParamSpec, ParamValue,
    Processed, Stage,
};
use ndarray::s;

/// What an [`EllipseTracker`] looks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EllipseTarget {
    /// The two largest blobs, reported left to right.
    Eyes,
    /// The single largest blob.
    Body,
}

impl EllipseTarget {
    fn count(self) -> usize {
        match self {
            EllipseTarget::Eyes => 2,
            EllipseTarget::Body => 1,
        }
    }

    fn label(self) -> &'static str {
        match self {
            EllipseTarget::Eyes => "eyes",
            EllipseTarget::Body => "body",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EllipseParams {
    pub threshold: u8,
    /// Blobs are darker than the background.
    pub dark: bool,
    pub crop_x: usize,
    pub crop_y: usize,
    /// Crop size; 0 extends to the image edge.
    pub crop_w: usize,
    pub crop_h: usize,
    pub min_area: usize,
    pub max_area: usize,
    /// Largest accepted major/minor axis ratio.
    pub max_aspect: f64,
}

impl Default for EllipseParams {
    fn default() -> Self {
        Self {
            threshold: 64,
            dark: true,
            crop_x: 0,
            crop_y: 0,
            crop_w: 0,
            crop_h: 0,
            min_area: 10,
            max_area: 5000,
            max_aspect: 10.0,
        }
    }
}

const ELLIPSE_SPECS: &[ParamSpec] = &[
    ParamSpec::int("threshold", 0.0, 255.0),
    ParamSpec::flag("dark"),
    ParamSpec::int("crop_x", 0.0, 4096.0),
    ParamSpec::int("crop_y", 0.0, 4096.0),
    ParamSpec::int("crop_w", 0.0, 4096.0),
    ParamSpec::int("crop_h", 0.0, 4096.0),
    ParamSpec::int("min_area", 1.0, 1.0e6),
    ParamSpec::int("max_area", 1.0, 1.0e7),
    ParamSpec::float("max_aspect", 1.0, 100.0),
];

impl NodeParams for EllipseParams {
    fn specs(&self) -> &'static [ParamSpec] {
        ELLIPSE_SPECS
    }

    fn value(&self, name: &str) -> Option<ParamValue> {
        let int = |v: usize| Some(ParamValue::Int(v as i64));
        match name {
            "threshold" => int(usize::from(self.threshold)),
            "dark" => Some(self.dark.into()),
            "crop_x" => int(self.crop_x),
            "crop_y" => int(self.crop_y),
            "crop_w" => int(self.crop_w),
            "crop_h" => int(self.crop_h),
            "min_area" => int(self.min_area),
            "max_area" => int(self.max_area),
            "max_aspect" => Some(self.max_aspect.into()),
            _ => None,
        }
    }

    fn assign(&mut self, name: &str, value: &ParamValue) {
        match (name, value) {
            ("threshold", ParamValue::Int(v)) => self.threshold = *v as u8,
            ("dark", ParamValue::Bool(v)) => self.dark = *v,
            ("crop_x", ParamValue::Int(v)) => self.crop_x = *v as usize,
            ("crop_y", ParamValue::Int(v)) => self.crop_y = *v as usize,
            ("crop_w", ParamValue::Int(v)) => self.crop_w = *v as usize,
            ("crop_h", ParamValue::Int(v)) => self.crop_h = *v as usize,
            ("min_area", ParamValue::Int(v)) => self.min_area = *v as usize,
            ("max_area", ParamValue::Int(v)) => self.max_area = *v as usize,
            ("max_aspect", ParamValue::Float(v)) => self.max_aspect = *v,
            _ => {}
        }
    }
}

impl EllipseParams {
    /// Crop window clipped to an image of `dim`, as row and column ranges.
    fn crop(&self, (rows, cols): (usize, usize)) -> Option<((usize, usize), (usize, usize))> {
        let extent = |start: usize, len: usize, max: usize| {
            let end = if len == 0 { max } else { (start + len).min(max) };
            (start < end).then_some((start, end))
        };
        Some((
            extent(self.crop_y, self.crop_h, rows)?,
            extent(self.crop_x, self.crop_w, cols)?,
        ))
    }

    fn accepts(&self, region: &Region, fit: &EllipseFit) -> bool {
        region.area >= self.min_area
            && region.area <= self.max_area
            && fit.major <= fit.minor * self.max_aspect
    }
}

/// Thresholds a crop window and fits ellipses to the largest blobs.
///
/// Blobs are filled before fitting, so the moments are those of the area
/// inside each blob's outer contour.
#[derive(Debug, Clone)]
pub struct EllipseTracker {
    target: EllipseTarget,
    params: ParamSet<EllipseParams>,
    diagnostics: DiagnosticSlot,
}

impl EllipseTracker {
    pub fn new(target: EllipseTarget) -> Self {
        Self::with_params(target, EllipseParams::default())
    }

    pub fn with_params(target: EllipseTarget, params: EllipseParams) -> Self {
        Self {
            target,
            params: ParamSet::new(params),
            diagnostics: DiagnosticSlot::new(&["mask"]),
        }
    }

    pub fn target(&self) -> EllipseTarget {
        self.target
    }

    /// Finds the target ellipses in full-image coordinates.
    fn find(&mut self, image: &Image) -> Option<Vec<EllipseFit>> {
        let p = self.params.get();
        let ((r0, r1), (c0, c1)) = p.crop(image.dim())?;
        let crop = image.slice(s![r0..r1, c0..c1]).to_owned();
        // glints inside an eye would otherwise inflate its moments
        let mask = fill_holes(&threshold_mask(&crop, p.threshold, p.dark));
        self.diagnostics
            .store_with("mask", || mask.mapv(|m| if m { 255 } else { 0 }));

        let mut candidates: Vec<(usize, EllipseFit)> = find_regions(&mask)
            .iter()
            .filter_map(|region| {
                let fit = region.fit_ellipse()?;
                p.accepts(region, &fit).then_some((region.area, fit))
            })
            .collect();
        if candidates.len() < self.target.count() {
            return None;
        }
        candidates.sort_by(|a, b| b.0.cmp(&a.0));
        let mut found: Vec<EllipseFit> = candidates
            .into_iter()
            .take(self.target.count())
            .map(|(_, fit)| EllipseFit {
                cx: fit.cx + c0 as f64,
                cy: fit.cy + r0 as f64,
                ..fit
            })
            .collect();
        found.sort_by(|a, b| a.cx.total_cmp(&b.cx));
        Some(found)
    }
}

impl Stage for EllipseTracker {
    stage_accessors!();
}

impl ImageToData for EllipseTracker {
    fn output_fields(&self) -> Vec<String> {
        match self.target {
            EllipseTarget::Eyes => (0..2)
                .flat_map(|i| {
                    ["pos_x", "pos_y", "dim_x", "dim_y", "th"].map(|f| format!("{f}_e{i}"))
                })
                .collect(),
            EllipseTarget::Body => ["body_x", "body_y", "body_major", "body_minor", "body_theta"]
                .map(String::from)
                .to_vec(),
        }
    }

    fn process(&mut self, image: &Image) -> Processed<Vec<f64>> {
        let width = 5 * self.target.count();
        match self.find(image) {
            Some(fits) => Processed::new(
                fits.iter()
                    .flat_map(|f| [f.cx, f.cy, f.major, f.minor, f.theta])
                    .collect(),
            ),
            None => Processed::with_message(
                vec![f64::NAN; width],
                Diagnostic::warning(format!("{} not found", self.target.label())),
            ),
        }
    }
}
