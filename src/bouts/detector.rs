//! Online bout segmentation.
//!
//! A four-phase state machine over a causal velocity stream:
//!
//! ```text
//! Idle --up--> InBout --down--> PotentialEnd --n below, long--> Padding --pad_after--> Idle
//!                 ^                  |   \
//!                 +-------up---------+    +--n below, short--> Idle (discarded)
//! ```
//!
//! "up" is an upward threshold crossing (previous sample below, current at
//! or above); "down" the reverse. Non-finite velocities count as below.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Segmentation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoutParams {
    /// Velocity at or above which the animal is moving.
    pub threshold: f64,
    /// Consecutive below-threshold samples that end a bout.
    pub n_without_crossing: usize,
    /// Shortest bout kept, in samples from the start crossing.
    pub min_bout_len: usize,
    /// Samples preceding the start crossing prepended to each bout.
    pub pad_before: usize,
    /// Samples appended after the bout has ended.
    pub pad_after: usize,
}

impl Default for BoutParams {
    fn default() -> Self {
        Self {
            threshold: 1.0,
            n_without_crossing: 5,
            min_bout_len: 5,
            pad_before: 5,
            pad_after: 5,
        }
    }
}

/// Phase of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BoutPhase {
    #[default]
    Idle,
    InBout,
    PotentialEnd,
    Padding,
}

/// A finished bout.
#[derive(Debug, Clone, PartialEq)]
pub struct Bout<C> {
    /// Coordinates from the first pre-padding sample to the last
    /// post-padding sample.
    pub coords: Vec<C>,
    /// Number of leading pre-padding samples in `coords`.
    pub pre_pad: usize,
    /// Fewer than `pad_before` samples preceded the start crossing.
    pub truncated: bool,
    /// Stream index of the start crossing sample.
    pub start_sample: u64,
}

/// What happened on one sample.
#[derive(Debug, Clone, PartialEq)]
pub struct BoutStep<C> {
    /// The sample started a bout.
    pub started: bool,
    /// The sample finished a bout.
    pub finished: Option<Bout<C>>,
}

impl<C> Default for BoutStep<C> {
    fn default() -> Self {
        Self {
            started: false,
            finished: None,
        }
    }
}

/// Complete detector state.
#[derive(Debug, Clone)]
pub struct BoutState<C> {
    phase: BoutPhase,
    last_velocity: f64,
    /// Samples since the start crossing, inclusive.
    in_bout: usize,
    below: usize,
    pad_remaining: usize,
    /// The most recent samples, at most `pad_before` of them.
    history: VecDeque<C>,
    buffer: Vec<C>,
    pre_pad: usize,
    truncated: bool,
    start_sample: u64,
    samples: u64,
}

impl<C> Default for BoutState<C> {
    fn default() -> Self {
        Self {
            phase: BoutPhase::Idle,
            last_velocity: f64::NAN,
            in_bout: 0,
            below: 0,
            pad_remaining: 0,
            history: VecDeque::new(),
            buffer: Vec::new(),
            pre_pad: 0,
            truncated: false,
            start_sample: 0,
            samples: 0,
        }
    }
}

impl<C: Clone> BoutState<C> {
    pub fn phase(&self) -> BoutPhase {
        self.phase
    }

    /// Coordinates collected for the bout in progress.
    pub fn buffer(&self) -> &[C] {
        &self.buffer
    }

    /// Advances by one sample. Depends only on `self`, `params` and the
    /// sample itself.
    pub fn transition(
        mut self,
        params: &BoutParams,
        velocity: f64,
        coords: C,
    ) -> (Self, BoutStep<C>) {
        let thr = params.threshold;
        let above = velocity >= thr;
        let was_above = self.last_velocity >= thr;
        let mut step = BoutStep::default();

        match self.phase {
            BoutPhase::Idle => {
                if above && !was_above {
                    self.truncated = self.history.len() < params.pad_before;
                    self.pre_pad = self.history.len();
                    self.buffer.clear();
                    self.buffer.extend(self.history.iter().cloned());
                    self.buffer.push(coords.clone());
                    self.in_bout = 1;
                    self.below = 0;
                    self.start_sample = self.samples;
                    self.phase = BoutPhase::InBout;
                    step.started = true;
                }
            }
            BoutPhase::InBout | BoutPhase::PotentialEnd => {
                self.buffer.push(coords.clone());
                self.in_bout += 1;
                if above {
                    self.below = 0;
                    self.phase = BoutPhase::InBout;
                } else {
                    self.below += 1;
                    self.phase = BoutPhase::PotentialEnd;
                    if self.below >= params.n_without_crossing {
                        if self.in_bout >= params.min_bout_len {
                            self.phase = BoutPhase::Padding;
                            self.pad_remaining = params.pad_after;
                            if self.pad_remaining == 0 {
                                step.finished = Some(self.finish());
                            }
                        } else {
                            self.phase = BoutPhase::Idle;
                            self.buffer.clear();
                        }
                    }
                }
            }
            BoutPhase::Padding => {
                self.buffer.push(coords.clone());
                self.pad_remaining = self.pad_remaining.saturating_sub(1);
                if self.pad_remaining == 0 {
                    step.finished = Some(self.finish());
                }
            }
        }

        if params.pad_before > 0 {
            if self.history.len() == params.pad_before {
                self.history.pop_front();
            }
            self.history.push_back(coords);
        }
        self.last_velocity = velocity;
        self.samples += 1;
        (self, step)
    }

    fn finish(&mut self) -> Bout<C> {
        self.phase = BoutPhase::Idle;
        Bout {
            coords: std::mem::take(&mut self.buffer),
            pre_pad: self.pre_pad,
            truncated: self.truncated,
            start_sample: self.start_sample,
        }
    }
}

/// Stateful wrapper around [`BoutState::transition`].
#[derive(Debug, Clone)]
pub struct BoutDetector<C = Vec<f64>> {
    params: BoutParams,
    state: BoutState<C>,
}

impl<C: Clone> BoutDetector<C> {
    pub fn new(params: BoutParams) -> Self {
        Self {
            params,
            state: BoutState::default(),
        }
    }

    pub fn params(&self) -> &BoutParams {
        &self.params
    }

    /// Replaces the settings; a bout in progress is discarded.
    pub fn set_params(&mut self, params: BoutParams) {
        if params != self.params {
            self.params = params;
            self.reset();
        }
    }

    pub fn phase(&self) -> BoutPhase {
        self.state.phase()
    }

    pub fn in_bout(&self) -> bool {
        matches!(self.state.phase(), BoutPhase::InBout | BoutPhase::PotentialEnd)
    }

    pub fn step(&mut self, velocity: f64, coords: C) -> BoutStep<C> {
        let state = std::mem::take(&mut self.state);
        let (state, step) = state.transition(&self.params, velocity, coords);
        self.state = state;
        step
    }

    pub fn reset(&mut self) {
        self.state = BoutState::default();
    }
}
