//! Tail angle tracking for head-restrained larvae.
//!
//! Both trackers walk from a fixed base point along the tail in
//! `n_segments` equal steps and report the absolute angle of every segment,
//! resampled to `n_output_segments` values, plus the tail sum: the mean
//! angle of the last two segments minus that of the first two.

use super::geometry::{centroid_step, interpolate, reduce_to_pi, sample_bilinear, unwrap_angles};
use crate::capture::synthetic::draw_line;
use crate::capture::Image;
use crate::pipeline::{
    Diagnostic, DiagnosticSlot, ImageToData, NodeParams, ParamSet, ParamSpec, ParamValue,
    Processed, Stage,
};
use std::f64::consts::PI;

#[derive(Debug, Clone)]
pub struct TailParams {
    pub tail_start_x: f64,
    pub tail_start_y: f64,
    /// Vector from the tail base to the tail tip, in pixels.
    pub tail_length_x: f64,
    pub tail_length_y: f64,
    pub n_segments: usize,
    pub n_output_segments: usize,
    /// Radius of the centroid window.
    pub window_size: f64,
}

impl Default for TailParams {
    fn default() -> Self {
        Self {
            tail_start_x: 160.0,
            tail_start_y: 72.0,
            tail_length_x: 0.0,
            tail_length_y: 60.0,
            n_segments: 7,
            n_output_segments: 9,
            window_size: 7.0,
        }
    }
}

const TAIL_SPECS: &[ParamSpec] = &[
    ParamSpec::float("tail_start_x", 0.0, 4096.0),
    ParamSpec::float("tail_start_y", 0.0, 4096.0),
    ParamSpec::float("tail_length_x", -4096.0, 4096.0),
    ParamSpec::float("tail_length_y", -4096.0, 4096.0),
    ParamSpec::int("n_segments", 2.0, 50.0),
    ParamSpec::int("n_output_segments", 2.0, 50.0).schema(),
    ParamSpec::float("window_size", 1.0, 100.0),
];

impl NodeParams for TailParams {
    fn specs(&self) -> &'static [ParamSpec] {
        TAIL_SPECS
    }

    fn value(&self, name: &str) -> Option<ParamValue> {
        match name {
            "tail_start_x" => Some(self.tail_start_x.into()),
            "tail_start_y" => Some(self.tail_start_y.into()),
            "tail_length_x" => Some(self.tail_length_x.into()),
            "tail_length_y" => Some(self.tail_length_y.into()),
            "n_segments" => Some((self.n_segments as i64).into()),
            "n_output_segments" => Some((self.n_output_segments as i64).into()),
            "window_size" => Some(self.window_size.into()),
            _ => None,
        }
    }

    fn assign(&mut self, name: &str, value: &ParamValue) {
        match (name, value) {
            ("tail_start_x", ParamValue::Float(v)) => self.tail_start_x = *v,
            ("tail_start_y", ParamValue::Float(v)) => self.tail_start_y = *v,
            ("tail_length_x", ParamValue::Float(v)) => self.tail_length_x = *v,
            ("tail_length_y", ParamValue::Float(v)) => self.tail_length_y = *v,
            ("n_segments", ParamValue::Int(v)) => self.n_segments = *v as usize,
            ("n_output_segments", ParamValue::Int(v)) => self.n_output_segments = *v as usize,
            ("window_size", ParamValue::Float(v)) => self.window_size = *v,
            _ => {}
        }
    }
}

impl TailParams {
    fn start(&self) -> (f64, f64) {
        (self.tail_start_x, self.tail_start_y)
    }

    fn segment_length(&self) -> f64 {
        self.tail_length_x.hypot(self.tail_length_y) / self.n_segments as f64
    }

    fn base_angle(&self) -> f64 {
        self.tail_length_y.atan2(self.tail_length_x)
    }
}

/// Output field names of a tail tracker producing `n_output` angles.
pub fn tail_fields(n_output: usize) -> Vec<String> {
    std::iter::once("tail_sum".to_string())
        .chain((0..n_output).map(|i| format!("theta_{i:02}")))
        .collect()
}

/// Tail sum of unwrapped segment angles.
pub fn tail_sum(angles: &[f64]) -> f64 {
    let n = angles.len();
    if n < 2 {
        return f64::NAN;
    }
    let first = (angles[0] + angles[1]) / 2.0;
    let last = (angles[n - 2] + angles[n - 1]) / 2.0;
    reduce_to_pi(last - first)
}

/// A successful trace: unwrapped segment angles and the visited points.
struct Trace {
    angles: Vec<f64>,
    points: Vec<(f64, f64)>,
}

fn tail_output(
    trace: Result<Trace, usize>,
    n_output: usize,
    image: &Image,
    diagnostics: &mut DiagnosticSlot,
) -> Processed<Vec<f64>> {
    match trace {
        Ok(trace) => {
            diagnostics.store_with("tail", || overlay(image, &trace.points));
            let mut output = Vec::with_capacity(n_output + 1);
            output.push(tail_sum(&trace.angles));
            output.extend(interpolate(&trace.angles, n_output));
            Processed::new(output)
        }
        Err(segment) => {
            diagnostics.store_with("tail", || image.clone());
            Processed::with_message(
                vec![f64::NAN; n_output + 1],
                Diagnostic::warning(format!("tail lost at segment {segment}")),
            )
        }
    }
}

fn overlay(image: &Image, points: &[(f64, f64)]) -> Image {
    let mut out = image.clone();
    for pair in points.windows(2) {
        draw_line(&mut out, pair[0], pair[1], 0.5, 255);
    }
    out
}

/// Follows the tail by repeatedly stepping to the intensity centroid of a
/// window placed one segment ahead. Expects a bright tail.
#[derive(Debug, Clone)]
pub struct CentroidTailTracker {
    params: ParamSet<TailParams>,
    diagnostics: DiagnosticSlot,
}

impl CentroidTailTracker {
    pub fn new() -> Self {
        Self::with_params(TailParams::default())
    }

    pub fn with_params(params: TailParams) -> Self {
        Self {
            params: ParamSet::new(params),
            diagnostics: DiagnosticSlot::new(&["tail"]),
        }
    }

    /// Traces the tail; on failure returns the index of the failed segment.
    fn trace(&self, image: &Image) -> Result<Trace, usize> {
        let p = self.params.get();
        let length = p.segment_length();
        if !(length > 0.0) {
            return Err(0);
        }
        let base = p.base_angle();
        let mut step = (length * base.cos(), length * base.sin());
        let mut point = p.start();
        let mut angles = Vec::with_capacity(p.n_segments);
        let mut points = Vec::with_capacity(p.n_segments + 1);
        points.push(point);

        for segment in 0..p.n_segments {
            let d = centroid_step(image, point, step, p.window_size).ok_or(segment)?;
            angles.push(d.1.atan2(d.0));
            point = (point.0 + d.0, point.1 + d.1);
            points.push(point);
            step = d;
        }
        unwrap_angles(&mut angles);
        Ok(Trace { angles, points })
    }
}

impl Default for CentroidTailTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for CentroidTailTracker {
    stage_accessors!();
}

impl ImageToData for CentroidTailTracker {
    fn output_fields(&self) -> Vec<String> {
        tail_fields(self.params.get().n_output_segments)
    }

    fn process(&mut self, image: &Image) -> Processed<Vec<f64>> {
        let trace = self.trace(image);
        let n_output = self.params.get().n_output_segments;
        tail_output(trace, n_output, image, &mut self.diagnostics)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SweepTailParams {
    pub tail: TailParams,
    /// Follow the darkest instead of the brightest pixel on each arc.
    pub dark_tail: bool,
}

const SWEEP_SPECS: &[ParamSpec] = &[
    ParamSpec::float("tail_start_x", 0.0, 4096.0),
    ParamSpec::float("tail_start_y", 0.0, 4096.0),
    ParamSpec::float("tail_length_x", -4096.0, 4096.0),
    ParamSpec::float("tail_length_y", -4096.0, 4096.0),
    ParamSpec::int("n_segments", 2.0, 50.0),
    ParamSpec::int("n_output_segments", 2.0, 50.0).schema(),
    ParamSpec::float("window_size", 1.0, 100.0),
    ParamSpec::flag("dark_tail"),
];

impl NodeParams for SweepTailParams {
    fn specs(&self) -> &'static [ParamSpec] {
        SWEEP_SPECS
    }

    fn value(&self, name: &str) -> Option<ParamValue> {
        match name {
            "dark_tail" => Some(self.dark_tail.into()),
            _ => self.tail.value(name),
        }
    }

    fn assign(&mut self, name: &str, value: &ParamValue) {
        match (name, value) {
            ("dark_tail", ParamValue::Bool(v)) => self.dark_tail = *v,
            _ => self.tail.assign(name, value),
        }
    }
}

/// Angle at the extremum of `(angle, value)` samples. A run of equal
/// extremal samples resolves to its middle.
fn arc_extremum(arc: &[(f64, f64)], dark: bool) -> Option<f64> {
    let pick = |a: f64, b: f64| if dark { a.min(b) } else { a.max(b) };
    let target = arc.iter().map(|&(_, v)| v).reduce(pick)?;
    let first = arc.iter().position(|&(_, v)| v == target)?;
    let run = arc[first..].iter().take_while(|&&(_, v)| v == target).count();
    Some((arc[first].0 + arc[first + run - 1].0) / 2.0)
}

/// Follows the tail by sampling a half-circle arc ahead of the current
/// point and turning towards the intensity extremum on it.
#[derive(Debug, Clone)]
pub struct SweepTailTracker {
    params: ParamSet<SweepTailParams>,
    diagnostics: DiagnosticSlot,
}

impl SweepTailTracker {
    pub fn new() -> Self {
        Self::with_params(SweepTailParams::default())
    }

    pub fn with_params(params: SweepTailParams) -> Self {
        Self {
            params: ParamSet::new(params),
            diagnostics: DiagnosticSlot::new(&["tail"]),
        }
    }

    fn trace(&self, image: &Image) -> Result<Trace, usize> {
        let SweepTailParams { tail: p, dark_tail } = self.params.get();
        let length = p.segment_length();
        if !(length > 0.0) {
            return Err(0);
        }
        // Sample the arc roughly once per pixel of its circumference.
        let n_samples = ((PI * length).ceil() as usize).max(8);
        let mut angle = p.base_angle();
        let mut point = p.start();
        let mut angles = Vec::with_capacity(p.n_segments);
        let mut points = vec![point];

        let mut arc = Vec::with_capacity(n_samples + 1);
        for segment in 0..p.n_segments {
            arc.clear();
            arc.extend((0..=n_samples).filter_map(|k| {
                let candidate = angle - PI / 2.0 + PI * k as f64 / n_samples as f64;
                let x = point.0 + length * candidate.cos();
                let y = point.1 + length * candidate.sin();
                sample_bilinear(image, x, y).map(|v| (candidate, v))
            }));
            angle = arc_extremum(&arc, *dark_tail).ok_or(segment)?;
            angles.push(angle);
            point = (
                point.0 + length * angle.cos(),
                point.1 + length * angle.sin(),
            );
            points.push(point);
        }
        Ok(Trace { angles, points })
    }
}

impl Default for SweepTailTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for SweepTailTracker {
    stage_accessors!();
}

impl ImageToData for SweepTailTracker {
    fn output_fields(&self) -> Vec<String> {
        tail_fields(self.params.get().tail.n_output_segments)
    }

    fn process(&mut self, image: &Image) -> Processed<Vec<f64>> {
        let trace = self.trace(image);
        let n_output = self.params.get().tail.n_output_segments;
        tail_output(trace, n_output, image, &mut self.diagnostics)
    }
}
