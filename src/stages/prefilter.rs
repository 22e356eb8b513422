//! Stateless image-to-image stages.

use crate::capture::Image;
use crate::pipeline::{
    Diagnostic, DiagnosticSlot, ImageToImage, NodeParams, ParamSet, ParamSpec, ParamValue,
    Processed, Stage,
};
use ndarray::Array2;
use std::borrow::Cow;

/// Parameters of a stage that has none.
#[derive(Debug, Clone, Default)]
pub struct NoParams;

impl NodeParams for NoParams {
    fn specs(&self) -> &'static [ParamSpec] {
        &[]
    }

    fn value(&self, _name: &str) -> Option<ParamValue> {
        None
    }

    fn assign(&mut self, _name: &str, _value: &ParamValue) {}
}

/// Root node handing the camera frame to its children unchanged.
#[derive(Debug, Clone)]
pub struct Passthrough {
    params: ParamSet<NoParams>,
    diagnostics: DiagnosticSlot,
}

impl Passthrough {
    pub fn new() -> Self {
        Self {
            params: ParamSet::new(NoParams),
            diagnostics: DiagnosticSlot::new(&[]),
        }
    }
}

impl Default for Passthrough {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for Passthrough {
    stage_accessors!();
}

impl ImageToImage for Passthrough {
    fn process<'a>(&mut self, image: &'a Image) -> Processed<Cow<'a, Image>> {
        Processed::new(Cow::Borrowed(image))
    }
}

#[derive(Debug, Clone)]
pub struct PrefilterParams {
    /// Box blur width in pixels; 0 or 1 disables blurring.
    pub filter_size: usize,
    /// Integer downscaling factor.
    pub downscale: usize,
    pub invert: bool,
    /// Intensities at or below `clip` become 0, the rest are shifted down.
    pub clip: u8,
}

impl Default for PrefilterParams {
    fn default() -> Self {
        Self {
            filter_size: 0,
            downscale: 1,
            invert: false,
            clip: 0,
        }
    }
}

const PREFILTER_SPECS: &[ParamSpec] = &[
    ParamSpec::int("filter_size", 0.0, 15.0),
    ParamSpec::int("downscale", 1.0, 8.0),
    ParamSpec::flag("invert"),
    ParamSpec::int("clip", 0.0, 255.0),
];

impl NodeParams for PrefilterParams {
    fn specs(&self) -> &'static [ParamSpec] {
        PREFILTER_SPECS
    }

    fn value(&self, name: &str) -> Option<ParamValue> {
        match name {
            "filter_size" => Some((self.filter_size as i64).into()),
            "downscale" => Some((self.downscale as i64).into()),
            "invert" => Some(self.invert.into()),
            "clip" => Some(i64::from(self.clip).into()),
            _ => None,
        }
    }

    fn assign(&mut self, name: &str, value: &ParamValue) {
        match (name, value) {
            ("filter_size", ParamValue::Int(v)) => self.filter_size = *v as usize,
            ("downscale", ParamValue::Int(v)) => self.downscale = *v as usize,
            ("invert", ParamValue::Bool(v)) => self.invert = *v,
            ("clip", ParamValue::Int(v)) => self.clip = *v as u8,
            _ => {}
        }
    }
}

/// Downscale, blur, invert and clip, in that order.
///
/// Coordinates in downstream nodes refer to the downscaled image.
#[derive(Debug, Clone)]
pub struct Prefilter {
    params: ParamSet<PrefilterParams>,
    diagnostics: DiagnosticSlot,
}

impl Prefilter {
    pub fn new() -> Self {
        Self::with_params(PrefilterParams::default())
    }

    pub fn with_params(params: PrefilterParams) -> Self {
        Self {
            params: ParamSet::new(params),
            diagnostics: DiagnosticSlot::new(&["filtered"]),
        }
    }

    fn is_identity(&self) -> bool {
        let p = self.params.get();
        p.filter_size <= 1 && p.downscale == 1 && !p.invert && p.clip == 0
    }
}

impl Default for Prefilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for Prefilter {
    stage_accessors!();
}

impl ImageToImage for Prefilter {
    fn process<'a>(&mut self, image: &'a Image) -> Processed<Cow<'a, Image>> {
        if self.is_identity() {
            self.diagnostics.store_with("filtered", || image.clone());
            return Processed::new(Cow::Borrowed(image));
        }

        let p = self.params.get().clone();
        let mut out = if p.downscale > 1 {
            downscale(image, p.downscale)
        } else {
            image.clone()
        };
        if p.filter_size > 1 {
            out = box_blur(&out, p.filter_size);
        }
        if p.invert {
            out.mapv_inplace(|v| 255 - v);
        }
        if p.clip > 0 {
            out.mapv_inplace(|v| v.saturating_sub(p.clip));
        }

        self.diagnostics.store_with("filtered", || out.clone());
        Processed::new(Cow::Owned(out))
    }
}

/// Averages `factor`×`factor` blocks. Partial blocks at the edge are
/// dropped unless the image is smaller than one block.
pub fn downscale(image: &Image, factor: usize) -> Image {
    let (rows, cols) = image.dim();
    let out_rows = (rows / factor).max(1).min(rows);
    let out_cols = (cols / factor).max(1).min(cols);
    Array2::from_shape_fn((out_rows, out_cols), |(r, c)| {
        let r0 = r * factor;
        let c0 = c * factor;
        let r1 = (r0 + factor).min(rows);
        let c1 = (c0 + factor).min(cols);
        let block = image.slice(ndarray::s![r0..r1, c0..c1]);
        let sum: u32 = block.iter().map(|&v| u32::from(v)).sum();
        (sum / block.len().max(1) as u32) as u8
    })
}

/// Separable box blur with edge clamping.
pub fn box_blur(image: &Image, size: usize) -> Image {
    let (rows, cols) = image.dim();
    if size <= 1 || rows == 0 || cols == 0 {
        return image.clone();
    }
    let before = (size - 1) / 2;
    let after = size - 1 - before;

    let mut horizontal = Array2::<u32>::zeros((rows, cols));
    for r in 0..rows {
        for c in 0..cols {
            let lo = c.saturating_sub(before);
            let hi = (c + after).min(cols - 1);
            let sum: u32 = (lo..=hi).map(|k| u32::from(image[[r, k]])).sum();
            horizontal[[r, c]] = sum * 16 / (hi - lo + 1) as u32;
        }
    }

    Array2::from_shape_fn((rows, cols), |(r, c)| {
        let lo = r.saturating_sub(before);
        let hi = (r + after).min(rows - 1);
        let sum: u32 = (lo..=hi).map(|k| horizontal[[k, c]]).sum();
        ((sum / (hi - lo + 1) as u32 + 8) / 16).min(255) as u8
    })
}

#[derive(Debug, Clone)]
pub struct ThresholdParams {
    pub threshold: u8,
    /// Mark pixels below the threshold instead of above.
    pub invert: bool,
}

impl Default for ThresholdParams {
    fn default() -> Self {
        Self {
            threshold: 128,
            invert: false,
        }
    }
}

const THRESHOLD_SPECS: &[ParamSpec] = &[
    ParamSpec::int("threshold", 0.0, 255.0),
    ParamSpec::flag("invert"),
];

impl NodeParams for ThresholdParams {
    fn specs(&self) -> &'static [ParamSpec] {
        THRESHOLD_SPECS
    }

    fn value(&self, name: &str) -> Option<ParamValue> {
        match name {
            "threshold" => Some(i64::from(self.threshold).into()),
            "invert" => Some(self.invert.into()),
            _ => None,
        }
    }

    fn assign(&mut self, name: &str, value: &ParamValue) {
        match (name, value) {
            ("threshold", ParamValue::Int(v)) => self.threshold = *v as u8,
            ("invert", ParamValue::Bool(v)) => self.invert = *v,
            _ => {}
        }
    }
}

/// Binarizes the image to 0 / 255.
#[derive(Debug, Clone)]
pub struct Threshold {
    params: ParamSet<ThresholdParams>,
    diagnostics: DiagnosticSlot,
}

impl Threshold {
    pub fn new() -> Self {
        Self {
            params: ParamSet::new(ThresholdParams::default()),
            diagnostics: DiagnosticSlot::new(&["thresholded"]),
        }
    }
}

impl Default for Threshold {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for Threshold {
    stage_accessors!();
}

impl ImageToImage for Threshold {
    fn process<'a>(&mut self, image: &'a Image) -> Processed<Cow<'a, Image>> {
        let ThresholdParams { threshold, invert } = *self.params.get();
        let out = image.mapv(|v| if (v >= threshold) != invert { 255 } else { 0 });
        self.diagnostics.store_with("thresholded", || out.clone());
        if out.iter().all(|&v| v == 0) {
            return Processed::with_message(
                Cow::Owned(out),
                Diagnostic::info("threshold left no foreground"),
            );
        }
        Processed::new(Cow::Owned(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ParamTable;

    fn ramp() -> Image {
        Array2::from_shape_fn((4, 4), |(r, c)| (r * 4 + c) as u8 * 10)
    }

    #[test]
    fn test_passthrough_borrows() {
        let image = ramp();
        let out = Passthrough::new().process(&image);
        assert!(matches!(out.output, Cow::Borrowed(_)));
    }

    #[test]
    fn test_identity_prefilter_borrows() {
        let image = ramp();
        let mut stage = Prefilter::new();
        assert!(matches!(stage.process(&image).output, Cow::Borrowed(_)));
    }

    #[test]
    fn test_prefilter_invert_and_clip() {
        let image = ramp();
        let mut stage = Prefilter::new();
        stage
            .params_mut()
            .set_param("invert", &ParamValue::Bool(true))
            .unwrap();
        stage
            .params_mut()
            .set_param("clip", &ParamValue::Int(100))
            .unwrap();
        let out = stage.process(&image).output.into_owned();
        assert_eq!(out[[0, 0]], 155);
        // 255 - 150 = 105, minus 100
        assert_eq!(out[[3, 3]], 5);
    }

    #[test]
    fn test_downscale_averages_blocks() {
        let image = ramp();
        let out = downscale(&image, 2);
        assert_eq!(out.dim(), (2, 2));
        // (0 + 10 + 40 + 50) / 4
        assert_eq!(out[[0, 0]], 25);
        assert_eq!(downscale(&Image::zeros((1, 3)), 4).dim(), (1, 1));
    }

    #[test]
    fn test_box_blur_preserves_flat_image() {
        let image = Array2::from_elem((5, 6), 77u8);
        assert_eq!(box_blur(&image, 3), image);
    }

    #[test]
    fn test_box_blur_spreads_peak() {
        let mut image = Image::zeros((5, 5));
        image[[2, 2]] = 90;
        let out = box_blur(&image, 3);
        assert_eq!(out[[2, 2]], 10);
        assert_eq!(out[[1, 1]], 10);
        assert_eq!(out[[0, 0]], 0);
    }

    #[test]
    fn test_threshold_polarity() {
        let image = ramp();
        let mut stage = Threshold::new();
        let out = stage.process(&image).output.into_owned();
        assert_eq!(out[[0, 0]], 0);
        assert_eq!(out[[3, 3]], 255);

        stage
            .params_mut()
            .set_param("invert", &ParamValue::Bool(true))
            .unwrap();
        let out = stage.process(&image).output.into_owned();
        assert_eq!(out[[0, 0]], 255);
        assert_eq!(out[[3, 3]], 0);
    }

    #[test]
    fn test_threshold_empty_reports() {
        let mut stage = Threshold::new();
        let frame = Image::zeros((3, 3));
        let out = stage.process(&frame);
        assert_eq!(out.messages.len(), 1);
    }
}
