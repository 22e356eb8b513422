//! Running-average background subtraction.

use crate::capture::Image;
use crate::pipeline::{
    Diagnostic, DiagnosticSlot, ImageToImage, NodeParams, ParamSet, ParamSpec, ParamValue,
    Processed, Stage,
};
use ndarray::{Array2, Zip};
use std::borrow::Cow;

#[derive(Debug, Clone)]
pub struct BackgroundParams {
    /// Weight of the new frame in the running average.
    pub learning_rate: f64,
    /// Update the background every this many frames.
    ///
    /// The first frame seeds the background with the animal in it. At the
    /// defaults that ghost halves in about 17 updates, under 2 s at 200 fps;
    /// an animal resting longer than that starts fading into the background.
    pub learn_every: u32,
}

impl Default for BackgroundParams {
    fn default() -> Self {
        Self {
            learning_rate: 0.04,
            learn_every: 20,
        }
    }
}

const BACKGROUND_SPECS: &[ParamSpec] = &[
    ParamSpec::float("learning_rate", 0.0, 1.0),
    ParamSpec::int("learn_every", 1.0, 10_000.0),
];

impl NodeParams for BackgroundParams {
    fn specs(&self) -> &'static [ParamSpec] {
        BACKGROUND_SPECS
    }

    fn value(&self, name: &str) -> Option<ParamValue> {
        match name {
            "learning_rate" => Some(self.learning_rate.into()),
            "learn_every" => Some(i64::from(self.learn_every).into()),
            _ => None,
        }
    }

    fn assign(&mut self, name: &str, value: &ParamValue) {
        match (name, value) {
            ("learning_rate", ParamValue::Float(v)) => self.learning_rate = *v,
            ("learn_every", ParamValue::Int(v)) => self.learn_every = *v as u32,
            _ => {}
        }
    }
}

/// Outputs `|frame - background|`, learning the background as an
/// exponential moving average.
///
/// The first frame (and the first after a reset or a change of frame size)
/// initializes the background and yields an all-zero difference.
#[derive(Debug, Clone)]
pub struct BackgroundSubtractor {
    params: ParamSet<BackgroundParams>,
    diagnostics: DiagnosticSlot,
    background: Option<Array2<f32>>,
    frames_seen: u64,
}

impl BackgroundSubtractor {
    pub fn new() -> Self {
        Self::with_params(BackgroundParams::default())
    }

    pub fn with_params(params: BackgroundParams) -> Self {
        Self {
            params: ParamSet::new(params),
            diagnostics: DiagnosticSlot::new(&["background"]),
            background: None,
            frames_seen: 0,
        }
    }

    /// Current background estimate, if initialized.
    pub fn background(&self) -> Option<&Array2<f32>> {
        self.background.as_ref()
    }
}

impl Default for BackgroundSubtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for BackgroundSubtractor {
    stage_accessors!();

    fn reset(&mut self) {
        self.background = None;
        self.frames_seen = 0;
    }
}

impl ImageToImage for BackgroundSubtractor {
    fn process<'a>(&mut self, image: &'a Image) -> Processed<Cow<'a, Image>> {
        let mut messages = Vec::new();
        if let Some(bg) = &self.background {
            if bg.dim() != image.dim() {
                messages.push(Diagnostic::warning("frame size changed, background reset"));
                self.background = None;
            }
        }
        if self.background.is_none() {
            self.frames_seen = 0;
        }
        let background = self
            .background
            .get_or_insert_with(|| image.mapv(f32::from));

        let mut diff = Image::zeros(image.dim());
        Zip::from(&mut diff)
            .and(image)
            .and(&*background)
            .for_each(|d, &p, &b| {
                *d = (f32::from(p) - b).abs().round().min(255.0) as u8;
            });

        let p = self.params.get();
        if self.frames_seen > 0 && self.frames_seen % u64::from(p.learn_every) == 0 {
            let rate = p.learning_rate as f32;
            Zip::from(&mut *background).and(image).for_each(|b, &v| {
                *b = *b * (1.0 - rate) + f32::from(v) * rate;
            });
        }
        self.frames_seen += 1;

        self.diagnostics
            .store_with("background", || background.mapv(|b| b.round() as u8));
        Processed {
            messages,
            output: Cow::Owned(diff),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> BackgroundSubtractor {
        BackgroundSubtractor::with_params(BackgroundParams {
            learning_rate: 0.5,
            learn_every: 1,
        })
    }

    #[test]
    fn test_first_frame_initializes() {
        let mut stage = BackgroundSubtractor::new();
        let frame = Array2::from_elem((4, 4), 100u8);
        let out = stage.process(&frame).output.into_owned();
        assert!(out.iter().all(|&v| v == 0));
        assert!(stage.background().is_some());
    }

    #[test]
    fn test_moving_object_stands_out() {
        let mut stage = BackgroundSubtractor::new();
        let empty = Array2::from_elem((4, 4), 50u8);
        stage.process(&empty);

        let mut with_fish = empty.clone();
        with_fish[[1, 2]] = 200;
        let out = stage.process(&with_fish).output.into_owned();
        assert_eq!(out[[1, 2]], 150);
        assert_eq!(out[[0, 0]], 0);
    }

    #[test]
    fn test_background_learns() {
        let mut stage = fast();
        stage.process(&Array2::from_elem((2, 2), 0u8));
        let bright = Array2::from_elem((2, 2), 200u8);
        stage.process(&bright);
        let bg = stage.background().unwrap();
        assert!((bg[[0, 0]] - 100.0).abs() < 1e-3);
    }

    #[test]
    fn test_seed_ghost_fades_at_defaults() {
        let mut stage = BackgroundSubtractor::new();
        let empty = Array2::from_elem((4, 4), 50u8);
        let mut with_fish = empty.clone();
        with_fish[[1, 2]] = 200;
        stage.process(&with_fish);

        // two seconds at 200 fps after the fish left
        let mut last = stage.process(&empty).output.into_owned();
        assert_eq!(last[[1, 2]], 150);
        for _ in 0..400 {
            last = stage.process(&empty).output.into_owned();
        }
        assert!(last[[1, 2]] < 75, "ghost still {}", last[[1, 2]]);
    }

    #[test]
    fn test_shape_change_reinitializes() {
        let mut stage = BackgroundSubtractor::new();
        stage.process(&Array2::from_elem((2, 2), 10u8));
        let frame = Array2::from_elem((3, 3), 90u8);
        let out = stage.process(&frame);
        assert_eq!(out.messages.len(), 1);
        assert!(out.output.iter().all(|&v| v == 0));
    }

    #[test]
    fn test_reset_forgets_background() {
        let mut stage = fast();
        stage.process(&Array2::from_elem((2, 2), 10u8));
        stage.reset();
        assert!(stage.background().is_none());
    }
}
