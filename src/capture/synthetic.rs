//! Synthetic fish scenes.
//!
//! Renders a larva with a beating tail so the tracking loop can run without
//! hardware. Also provides the primitive drawing routines used by tests to
//! build ground-truth images.

use super::frame::Image;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Paints a filled disk, clipped to the image.
pub fn fill_disk(image: &mut Image, cx: f64, cy: f64, radius: f64, value: u8) {
    fill_ellipse(image, cx, cy, radius, radius, 0.0, value);
}

/// Paints a filled ellipse with semi-axes `a` (along `angle`) and `b`.
pub fn fill_ellipse(image: &mut Image, cx: f64, cy: f64, a: f64, b: f64, angle: f64, value: u8) {
    let (rows, cols) = image.dim();
    if rows == 0 || cols == 0 || a <= 0.0 || b <= 0.0 {
        return;
    }
    let reach = a.max(b).ceil() + 1.0;
    let r0 = (cy - reach).floor().max(0.0) as usize;
    let r1 = ((cy + reach).ceil().max(0.0) as usize).min(rows - 1);
    let c0 = (cx - reach).floor().max(0.0) as usize;
    let c1 = ((cx + reach).ceil().max(0.0) as usize).min(cols - 1);
    let (sin, cos) = angle.sin_cos();

    for row in r0..=r1 {
        for col in c0..=c1 {
            let dx = col as f64 - cx;
            let dy = row as f64 - cy;
            let u = dx * cos + dy * sin;
            let v = -dx * sin + dy * cos;
            if (u / a).powi(2) + (v / b).powi(2) <= 1.0 {
                image[[row, col]] = value;
            }
        }
    }
}

/// Paints a thick line by stamping disks every half pixel.
pub fn draw_line(image: &mut Image, from: (f64, f64), to: (f64, f64), radius: f64, value: u8) {
    let length = ((to.0 - from.0).powi(2) + (to.1 - from.1).powi(2)).sqrt();
    let steps = (length * 2.0).ceil().max(1.0) as usize;
    for i in 0..=steps {
        let f = i as f64 / steps as f64;
        let x = from.0 + (to.0 - from.0) * f;
        let y = from.1 + (to.1 - from.1) * f;
        fill_disk(image, x, y, radius, value);
    }
}

/// Draws a chain of segments starting at `start` with the given absolute
/// angles, returning the chain's end point.
pub fn draw_chain(
    image: &mut Image,
    start: (f64, f64),
    angles: &[f64],
    segment_length: f64,
    radius: f64,
    value: u8,
) -> (f64, f64) {
    let mut point = start;
    for &angle in angles {
        let next = (
            point.0 + segment_length * angle.cos(),
            point.1 + segment_length * angle.sin(),
        );
        draw_line(image, point, next, radius, value);
        point = next;
    }
    point
}

/// Kind of scene the synthetic camera renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SceneKind {
    /// Embedded larva: fixed head with eyes, free tail.
    HeadRestrained,
    /// Whole larva swimming around the arena in bouts.
    FreeSwimming,
}

/// Parameters of the rendered animal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    pub kind: SceneKind,
    /// Background intensity.
    pub background: u8,
    /// Intensity of the animal's body and tail.
    pub body: u8,
    /// Tail length in pixels.
    pub tail_length: f64,
    /// Number of rendered tail segments.
    pub tail_segments: usize,
    /// Tail beat frequency during a bout (Hz).
    pub beat_frequency: f64,
    /// Peak tail bend at the tip (radians).
    pub beat_amplitude: f64,
    /// Seconds between bout onsets.
    pub bout_interval: f64,
    /// Bout length in seconds.
    pub bout_duration: f64,
    /// Swimming speed during bouts (pixels per second).
    pub swim_speed: f64,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            kind: SceneKind::HeadRestrained,
            background: 10,
            body: 220,
            tail_length: 60.0,
            tail_segments: 12,
            beat_frequency: 20.0,
            beat_amplitude: 0.8,
            bout_interval: 1.0,
            bout_duration: 0.3,
            swim_speed: 40.0,
        }
    }
}

/// Renders successive frames of a synthetic larva.
#[derive(Debug, Clone)]
pub struct SyntheticScene {
    config: SceneConfig,
    width: usize,
    height: usize,
    position: (f64, f64),
    heading: f64,
    last_t: Option<f64>,
}

impl SyntheticScene {
    pub fn new(config: SceneConfig, width: usize, height: usize) -> Self {
        Self {
            config,
            width,
            height,
            position: (width as f64 / 2.0, height as f64 / 2.0),
            heading: 0.0,
            last_t: None,
        }
    }

    /// Signed tail-tip bend at time `t` (zero between bouts).
    pub fn tail_bend(&self, t: f64) -> f64 {
        let since_onset = t.rem_euclid(self.config.bout_interval.max(f64::EPSILON));
        if since_onset > self.config.bout_duration {
            return 0.0;
        }
        self.config.beat_amplitude * (2.0 * PI * self.config.beat_frequency * since_onset).sin()
    }

    /// Point where the tail attaches to the body for the head-restrained scene.
    pub fn tail_base(&self) -> (f64, f64) {
        (self.width as f64 / 2.0, self.height as f64 * 0.3)
    }

    /// Renders the scene at time `t`.
    pub fn render(&mut self, t: f64) -> Image {
        let mut image = Array2::from_elem((self.height, self.width), self.config.background);
        match self.config.kind {
            SceneKind::HeadRestrained => self.render_restrained(&mut image, t),
            SceneKind::FreeSwimming => self.render_free(&mut image, t),
        }
        self.last_t = Some(t);
        image
    }

    fn tail_angles(&self, base_angle: f64, t: f64) -> Vec<f64> {
        let n = self.config.tail_segments.max(1);
        let bend = self.tail_bend(t);
        (0..n)
            .map(|i| base_angle + bend * (i as f64 + 1.0) / n as f64)
            .collect()
    }

    fn render_restrained(&self, image: &mut Image, t: f64) {
        let base = self.tail_base();
        let n = self.config.tail_segments.max(1);
        let seg = self.config.tail_length / n as f64;
        // Tail hangs downwards in image coordinates.
        let angles = self.tail_angles(PI / 2.0, t);
        draw_chain(image, base, &angles, seg, 2.0, self.config.body);

        let eye_y = base.1 - 18.0;
        fill_ellipse(image, base.0 - 7.0, eye_y, 6.0, 3.5, 1.2, self.config.body);
        fill_ellipse(image, base.0 + 7.0, eye_y, 6.0, 3.5, -1.2, self.config.body);
    }

    fn render_free(&mut self, image: &mut Image, t: f64) {
        let dt = self.last_t.map(|last| (t - last).max(0.0)).unwrap_or(0.0);
        let bend = self.tail_bend(t);
        if bend != 0.0 {
            self.heading += 0.5 * bend * dt;
            let step = self.config.swim_speed * dt;
            let (w, h) = (self.width as f64, self.height as f64);
            self.position.0 = (self.position.0 + step * self.heading.cos()).rem_euclid(w);
            self.position.1 = (self.position.1 + step * self.heading.sin()).rem_euclid(h);
        }

        let (hx, hy) = self.position;
        let n = self.config.tail_segments.max(1);
        let seg = self.config.tail_length / n as f64;
        let angles = self.tail_angles(self.heading + PI, t);
        // The tail is dimmer than the head, as in transmitted-light recordings.
        let tail = self.config.background / 2 + self.config.body / 2;
        draw_chain(image, (hx, hy), &angles, seg, 1.5, tail);
        fill_ellipse(image, hx, hy, 7.0, 4.0, self.heading, self.config.body);
    }
}
