//! Freely swimming fish: position, heading, midline and bouts.

use super::geometry::{centroid_step, find_regions, reduce_to_pi, threshold_mask, unwrap_angles};
use crate::bouts::{BoutDetector, BoutParams};
use crate::capture::Image;
use crate::pipeline::{
    Diagnostic, DiagnosticSlot, ImageToData, NodeParams, ParamSet, ParamSpec, ParamValue,
    Processed, Stage,
};
use std::f64::consts::PI;

#[derive(Debug, Clone)]
pub struct FishParams {
    /// Foreground threshold on the (background-subtracted) image.
    pub threshold: u8,
    /// Pixels at or above this inside the fish crop locate the head.
    pub head_threshold: u8,
    pub min_area: usize,
    pub max_area: usize,
    /// Padding around the fish bounding box.
    pub margin: usize,
    pub n_segments: usize,
    pub tail_length: f64,
    pub window_size: f64,
    /// Head speed in pixels per frame that counts as swimming.
    pub bout_threshold: f64,
    pub bout_min_len: usize,
}

impl Default for FishParams {
    fn default() -> Self {
        Self {
            threshold: 30,
            head_threshold: 160,
            min_area: 30,
            max_area: 20_000,
            margin: 10,
            n_segments: 8,
            tail_length: 50.0,
            window_size: 6.0,
            bout_threshold: 1.0,
            bout_min_len: 5,
        }
    }
}

const FISH_SPECS: &[ParamSpec] = &[
    ParamSpec::int("threshold", 0.0, 255.0),
    ParamSpec::int("head_threshold", 0.0, 255.0),
    ParamSpec::int("min_area", 1.0, 1.0e6),
    ParamSpec::int("max_area", 1.0, 1.0e7),
    ParamSpec::int("margin", 0.0, 200.0),
    ParamSpec::int("n_segments", 2.0, 30.0).schema(),
    ParamSpec::float("tail_length", 1.0, 1000.0),
    ParamSpec::float("window_size", 1.0, 100.0),
    ParamSpec::float("bout_threshold", 0.0, 1000.0),
    ParamSpec::int("bout_min_len", 1.0, 1000.0),
];

impl NodeParams for FishParams {
    fn specs(&self) -> &'static [ParamSpec] {
        FISH_SPECS
    }

    fn value(&self, name: &str) -> Option<ParamValue> {
        let int = |v: usize| Some(ParamValue::Int(v as i64));
        match name {
            "threshold" => int(usize::from(self.threshold)),
            "head_threshold" => int(usize::from(self.head_threshold)),
            "min_area" => int(self.min_area),
            "max_area" => int(self.max_area),
            "margin" => int(self.margin),
            "n_segments" => int(self.n_segments),
            "tail_length" => Some(self.tail_length.into()),
            "window_size" => Some(self.window_size.into()),
            "bout_threshold" => Some(self.bout_threshold.into()),
            "bout_min_len" => int(self.bout_min_len),
            _ => None,
        }
    }

    fn assign(&mut self, name: &str, value: &ParamValue) {
        match (name, value) {
            ("threshold", ParamValue::Int(v)) => self.threshold = *v as u8,
            ("head_threshold", ParamValue::Int(v)) => self.head_threshold = *v as u8,
            ("min_area", ParamValue::Int(v)) => self.min_area = *v as usize,
            ("max_area", ParamValue::Int(v)) => self.max_area = *v as usize,
            ("margin", ParamValue::Int(v)) => self.margin = *v as usize,
            ("n_segments", ParamValue::Int(v)) => self.n_segments = *v as usize,
            ("tail_length", ParamValue::Float(v)) => self.tail_length = *v,
            ("window_size", ParamValue::Float(v)) => self.window_size = *v,
            ("bout_threshold", ParamValue::Float(v)) => self.bout_threshold = *v,
            ("bout_min_len", ParamValue::Int(v)) => self.bout_min_len = *v as usize,
            _ => {}
        }
    }
}

impl FishParams {
    fn bout_params(&self) -> BoutParams {
        BoutParams {
            threshold: self.bout_threshold,
            min_bout_len: self.bout_min_len,
            ..BoutParams::default()
        }
    }
}

/// Where the fish is on one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FishPose {
    pub x: f64,
    pub y: f64,
    /// Facing direction, opposite to the first midline segment.
    pub theta: f64,
    /// Unwrapped midline segment angles, head to tail.
    pub midline: Vec<f64>,
}

/// Why a frame produced no pose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lost {
    NoFish,
    NoHead,
    Midline,
}

impl Lost {
    fn message(self) -> &'static str {
        match self {
            Lost::NoFish => "fish not found",
            Lost::NoHead => "fish head not found",
            Lost::Midline => "fish midline lost",
        }
    }
}

/// Intensity-weighted centroid of pixels `>= min` inside a window.
fn bright_centroid(
    image: &Image,
    rows: (usize, usize),
    cols: (usize, usize),
    min: u8,
) -> Option<(f64, f64)> {
    let (mut sum, mut sx, mut sy) = (0.0, 0.0, 0.0);
    for row in rows.0..rows.1 {
        for col in cols.0..cols.1 {
            let v = image[[row, col]];
            if v >= min {
                let w = f64::from(v);
                sum += w;
                sx += w * col as f64;
                sy += w * row as f64;
            }
        }
    }
    (sum > 0.0).then(|| (sx / sum, sy / sum))
}

/// Chain of `n` centroid steps from `start`, initially heading towards
/// `toward`. Any failed step invalidates the whole chain.
pub fn trace_midline(
    image: &Image,
    start: (f64, f64),
    toward: (f64, f64),
    n: usize,
    segment: f64,
    window: f64,
) -> Option<Vec<(f64, f64)>> {
    let (dx, dy) = (toward.0 - start.0, toward.1 - start.1);
    let norm = dx.hypot(dy);
    if !(norm > 0.0) {
        return None;
    }
    let mut step = (dx / norm * segment, dy / norm * segment);
    let mut points = Vec::with_capacity(n + 1);
    let mut point = start;
    points.push(point);
    for _ in 0..n {
        step = centroid_step(image, point, step, window)?;
        point = (point.0 + step.0, point.1 + step.1);
        points.push(point);
    }
    Some(points)
}

/// Tracks the largest foreground blob as a fish.
///
/// Keeps the previous head position to report speed and feeds that speed
/// through a [`BoutDetector`].
#[derive(Debug, Clone)]
pub struct FishTracker {
    params: ParamSet<FishParams>,
    diagnostics: DiagnosticSlot,
    previous: Option<(f64, f64)>,
    bouts: BoutDetector<Vec<f64>>,
    bouts_finished: u64,
}

impl FishTracker {
    pub fn new() -> Self {
        Self::with_params(FishParams::default())
    }

    pub fn with_params(params: FishParams) -> Self {
        let bouts = BoutDetector::new(params.bout_params());
        Self {
            params: ParamSet::new(params),
            diagnostics: DiagnosticSlot::new(&["mask"]),
            previous: None,
            bouts,
            bouts_finished: 0,
        }
    }

    /// Number of bouts completed since the last reset.
    pub fn bouts_finished(&self) -> u64 {
        self.bouts_finished
    }

    fn locate(&mut self, image: &Image) -> Result<FishPose, Lost> {
        let p = self.params.get();
        let mask = threshold_mask(image, p.threshold, false);
        self.diagnostics
            .store_with("mask", || mask.mapv(|m| if m { 255 } else { 0 }));

        let region = find_regions(&mask)
            .into_iter()
            .filter(|r| r.area >= p.min_area && r.area <= p.max_area)
            .max_by_key(|r| r.area)
            .ok_or(Lost::NoFish)?;

        let (rows, cols) = image.dim();
        let (top, left, bottom, right) = region.bbox;
        let row_range = (top.saturating_sub(p.margin), (bottom + 1 + p.margin).min(rows));
        let col_range = (left.saturating_sub(p.margin), (right + 1 + p.margin).min(cols));
        let head = bright_centroid(image, row_range, col_range, p.head_threshold)
            .ok_or(Lost::NoHead)?;

        let center = ((left + right) as f64 / 2.0, (top + bottom) as f64 / 2.0);
        let segment = p.tail_length / p.n_segments as f64;
        let points = trace_midline(image, head, center, p.n_segments, segment, p.window_size)
            .ok_or(Lost::Midline)?;

        let mut midline: Vec<f64> = points
            .windows(2)
            .map(|w| (w[1].1 - w[0].1).atan2(w[1].0 - w[0].0))
            .collect();
        unwrap_angles(&mut midline);
        let first = *midline.first().ok_or(Lost::Midline)?;
        Ok(FishPose {
            x: head.0,
            y: head.1,
            theta: reduce_to_pi(first + PI),
            midline,
        })
    }
}

impl Default for FishTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for FishTracker {
    stage_accessors!();

    fn reset(&mut self) {
        self.previous = None;
        self.bouts.reset();
        self.bouts_finished = 0;
    }
}

impl ImageToData for FishTracker {
    fn output_fields(&self) -> Vec<String> {
        ["f0_x", "f0_y", "f0_theta", "f0_vel", "f0_in_bout", "f0_n_bouts"]
            .into_iter()
            .map(String::from)
            .chain((0..self.params.get().n_segments).map(|i| format!("f0_mid_{i:02}")))
            .collect()
    }

    fn process(&mut self, image: &Image) -> Processed<Vec<f64>> {
        let n_segments = self.params.get().n_segments;
        self.bouts.set_params(self.params.get().bout_params());

        let mut messages = Vec::new();
        let pose = self.locate(image);
        let velocity = match (&pose, self.previous) {
            (Ok(pose), Some(prev)) => (pose.x - prev.0).hypot(pose.y - prev.1),
            _ => f64::NAN,
        };
        self.previous = pose.as_ref().ok().map(|p| (p.x, p.y));

        let coords = match &pose {
            Ok(p) => vec![p.x, p.y, p.theta],
            Err(_) => vec![f64::NAN; 3],
        };
        let step = self.bouts.step(velocity, coords);
        if let Some(bout) = step.finished {
            self.bouts_finished += 1;
            messages.push(Diagnostic::info(format!(
                "bout {} finished after {} samples",
                self.bouts_finished,
                bout.coords.len()
            )));
        }
        let in_bout = if self.bouts.in_bout() { 1.0 } else { 0.0 };
        let n_bouts = self.bouts_finished as f64;

        let output = match pose {
            Ok(pose) => {
                let mut out = Vec::with_capacity(6 + n_segments);
                out.extend([pose.x, pose.y, pose.theta, velocity, in_bout, n_bouts]);
                out.extend(pose.midline);
                out
            }
            Err(lost) => {
                messages.push(Diagnostic::warning(lost.message()));
                let mut out = vec![f64::NAN; 6 + n_segments];
                out[4] = in_bout;
                out[5] = n_bouts;
                out
            }
        };
        Processed { messages, output }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::synthetic::{draw_chain, fill_ellipse};
    use approx::assert_relative_eq;

    /// Fish facing `heading` with its head at `(x, y)`.
    fn fish(x: f64, y: f64, heading: f64) -> Image {
        let mut image = Image::zeros((200, 200));
        draw_chain(&mut image, (x, y), &[heading + PI; 10], 5.0, 1.5, 120);
        fill_ellipse(&mut image, x, y, 7.0, 4.0, heading, 220);
        image
    }

    #[test]
    fn test_fields() {
        let tracker = FishTracker::new();
        let fields = tracker.output_fields();
        assert_eq!(fields.len(), 14);
        assert_eq!(fields[3], "f0_vel");
        assert_eq!(fields[5], "f0_n_bouts");
        assert_eq!(fields[13], "f0_mid_07");
    }

    #[test]
    fn test_pose_and_heading() {
        let mut tracker = FishTracker::new();
        let out = tracker.process(&fish(100.0, 100.0, 0.0)).output;
        assert_eq!(out.len(), 14);
        assert_relative_eq!(out[0], 100.0, epsilon = 1.0);
        assert_relative_eq!(out[1], 100.0, epsilon = 0.5);
        assert_relative_eq!(reduce_to_pi(out[2]), 0.0, epsilon = 0.1);
        assert!(out[3].is_nan());
        for angle in &out[6..] {
            assert_relative_eq!(reduce_to_pi(*angle - PI), 0.0, epsilon = 0.15);
        }
    }

    #[test]
    fn test_heading_downwards() {
        let mut tracker = FishTracker::new();
        let out = tracker.process(&fish(100.0, 60.0, PI / 2.0)).output;
        assert_relative_eq!(out[2], PI / 2.0, epsilon = 0.1);
    }

    #[test]
    fn test_velocity_between_frames() {
        let mut tracker = FishTracker::new();
        tracker.process(&fish(100.0, 100.0, 0.0));
        let out = tracker.process(&fish(103.0, 104.0, 0.0)).output;
        assert_relative_eq!(out[3], 5.0, epsilon = 0.5);
        assert_eq!(out[4], 1.0);
    }

    #[test]
    fn test_bout_reported_when_fish_stops() {
        let mut tracker = FishTracker::new();
        let mut x = 80.0;
        let mut messages = Vec::new();
        for i in 0..30 {
            if (2..10).contains(&i) {
                x += 3.0;
            }
            messages.extend(tracker.process(&fish(x, 100.0, 0.0)).messages);
        }
        assert_eq!(tracker.bouts_finished(), 1);
        assert_eq!(tracker.process(&fish(x, 100.0, 0.0)).output[5], 1.0);
        assert!(messages.iter().any(|m| m.to_string().starts_with("I:bout 1")));
    }

    #[test]
    fn test_empty_frame_is_nan() {
        let mut tracker = FishTracker::new();
        let out = tracker.process(&Image::zeros((50, 50)));
        assert_eq!(out.output.len(), 14);
        assert!(out.output[..4].iter().all(|v| v.is_nan()));
        assert_eq!(out.messages[0].to_string(), "W:fish not found");
    }

    #[test]
    fn test_dim_fish_has_no_head() {
        let mut image = Image::zeros((100, 100));
        fill_ellipse(&mut image, 50.0, 50.0, 10.0, 4.0, 0.0, 80);
        let out = FishTracker::new().process(&image);
        assert_eq!(out.messages[0].to_string(), "W:fish head not found");
    }

    #[test]
    fn test_reset_clears_motion_state() {
        let mut tracker = FishTracker::new();
        tracker.process(&fish(100.0, 100.0, 0.0));
        tracker.reset();
        let out = tracker.process(&fish(110.0, 100.0, 0.0)).output;
        assert!(out[3].is_nan());
    }

    #[test]
    fn test_zero_segments_reports_lost_midline() {
        let mut tracker = FishTracker::with_params(FishParams {
            n_segments: 0,
            ..FishParams::default()
        });
        assert_eq!(tracker.output_fields().len(), 6);
        let out = tracker.process(&fish(100.0, 100.0, 0.0));
        assert_eq!(out.output.len(), 6);
        assert!(out.output[..4].iter().all(|v| v.is_nan()));
        assert_eq!(out.messages[0].to_string(), "W:fish midline lost");
    }

    #[test]
    fn test_midline_invalid_step_is_sentinel() {
        let image = Image::zeros((20, 20));
        assert!(trace_midline(&image, (5.0, 5.0), (10.0, 5.0), 3, 2.0, 2.0).is_none());
        assert!(trace_midline(&image, (5.0, 5.0), (5.0, 5.0), 3, 2.0, 2.0).is_none());
    }
}
