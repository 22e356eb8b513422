//! Time-indexed feature storage shared between the collector and readers.

use crate::pipeline::{FeatureSchema, FeatureTuple};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

/// Name of the synthesized time column.
pub const TIME_COLUMN: &str = "t";

/// Errors raised by [`Accumulator::append`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AccumulatorError {
    #[error("timestamp {got} precedes the last stored timestamp {previous}")]
    NonMonotonic { previous: f64, got: f64 },
    #[error("timestamp is not finite")]
    InvalidTimestamp,
    #[error("expected {expected} values, got {got}")]
    WidthMismatch { expected: usize, got: usize },
    #[error("accumulator has no schema")]
    NoSchema,
}

/// Storage limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccumulatorConfig {
    /// Rows kept after an eviction.
    pub max_history: usize,
    /// Number of recent samples used for the framerate estimate.
    pub fps_window: usize,
}

impl Default for AccumulatorConfig {
    fn default() -> Self {
        Self {
            max_history: 20_000,
            fps_window: 10,
        }
    }
}

impl AccumulatorConfig {
    pub fn validate(&self) -> Result<(), crate::capture::ConfigError> {
        use crate::capture::ConfigError;
        if self.max_history == 0 {
            return Err(ConfigError::Invalid("max_history must be positive".into()));
        }
        if self.fps_window < 2 {
            return Err(ConfigError::Invalid("fps_window must be at least 2".into()));
        }
        Ok(())
    }
}

/// Result of a successful append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// The tuple's fields differed from the stored ones; previous rows were
    /// discarded before appending.
    SchemaChanged,
}

/// A copied-out block of rows.
///
/// Columns are `t` followed by the schema fields. A window taken from an
/// accumulator that never received data has no rows and only the `t`
/// column.
#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    columns: Vec<String>,
    times: Vec<f64>,
    /// Row-major values, `times.len() * (columns.len() - 1)` of them.
    values: Vec<f64>,
}

impl Window {
    /// The empty sentinel.
    pub fn empty() -> Self {
        Self {
            columns: vec![TIME_COLUMN.to_string()],
            times: Vec::new(),
            values: Vec::new(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.times.len()
    }

    /// Column names, `t` first.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    fn width(&self) -> usize {
        self.columns.len() - 1
    }

    /// Values of row `i`, excluding the time.
    pub fn row(&self, i: usize) -> Option<&[f64]> {
        let w = self.width();
        (i < self.len()).then(|| &self.values[i * w..(i + 1) * w])
    }

    /// A whole column by name; `"t"` yields the timestamps.
    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        if name == TIME_COLUMN {
            return Some(self.times.clone());
        }
        let index = self.columns[1..].iter().position(|c| c == name)?;
        let w = self.width();
        Some(self.values.iter().skip(index).step_by(w).copied().collect())
    }

    /// Rows as `(t, values)` pairs.
    pub fn rows(&self) -> impl Iterator<Item = (f64, &[f64])> + '_ {
        let w = self.width().max(1);
        self.times
            .iter()
            .copied()
            .zip(self.values.chunks(w).chain(std::iter::repeat(&[][..])))
    }
}

/// One stored sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub t: f64,
    pub values: Vec<f64>,
}

#[derive(Debug, Default)]
struct Store {
    schema: Option<Arc<FeatureSchema>>,
    times: Vec<f64>,
    values: Vec<f64>,
    recording: bool,
}

impl Store {
    fn width(&self) -> usize {
        self.schema.as_ref().map_or(0, |s| s.len())
    }

    fn clear(&mut self) {
        self.times.clear();
        self.values.clear();
    }

    fn window(&self, n: usize) -> Window {
        let Some(schema) = &self.schema else {
            return Window::empty();
        };
        let n = n.min(self.times.len());
        let start = self.times.len() - n;
        let w = schema.len();
        Window {
            columns: std::iter::once(TIME_COLUMN.to_string())
                .chain(schema.fields().iter().cloned())
                .collect(),
            times: self.times[start..].to_vec(),
            values: self.values[start * w..].to_vec(),
        }
    }

    fn push(&mut self, t: f64, values: &[f64]) -> Result<(), AccumulatorError> {
        if !t.is_finite() {
            return Err(AccumulatorError::InvalidTimestamp);
        }
        if let Some(&previous) = self.times.last() {
            if t < previous {
                return Err(AccumulatorError::NonMonotonic { previous, got: t });
            }
        }
        let expected = self.width();
        if values.len() != expected {
            return Err(AccumulatorError::WidthMismatch {
                expected,
                got: values.len(),
            });
        }
        self.times.push(t);
        self.values.extend_from_slice(values);
        Ok(())
    }

    fn evict(&mut self, max_history: usize) -> usize {
        let len = self.times.len();
        if self.recording || len <= max_history + max_history / 2 {
            return 0;
        }
        let drop = len - max_history;
        let w = self.width();
        self.times.drain(..drop);
        self.values.drain(..drop * w);
        drop
    }
}

/// Append-only store of timestamped feature tuples.
///
/// Cloning yields another handle to the same storage. One role appends;
/// any number of readers copy rows out under a read lock, so a reader never
/// sees a half-written row.
#[derive(Debug, Clone)]
pub struct Accumulator {
    store: Arc<RwLock<Store>>,
    config: AccumulatorConfig,
}

impl Default for Accumulator {
    fn default() -> Self {
        Self::new(AccumulatorConfig::default())
    }
}

impl Accumulator {
    pub fn new(config: AccumulatorConfig) -> Self {
        Self {
            store: Arc::new(RwLock::new(Store::default())),
            config,
        }
    }

    /// An accumulator with fixed, known fields.
    pub fn with_fields<I, S>(fields: I, config: AccumulatorConfig) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let acc = Self::new(config);
        acc.reset(Some(Arc::new(FeatureSchema::new(fields, 1))));
        acc
    }

    pub fn config(&self) -> &AccumulatorConfig {
        &self.config
    }

    fn read(&self) -> RwLockReadGuard<'_, Store> {
        self.store.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Store> {
        self.store.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drops every row. A new schema replaces the old one; `None` keeps it.
    pub fn reset(&self, schema: Option<Arc<FeatureSchema>>) {
        let mut store = self.write();
        store.clear();
        if let Some(schema) = schema {
            tracing::debug!(fields = schema.len(), version = schema.version(), "Accumulator reset");
            store.schema = Some(schema);
        }
    }

    /// Appends one tuple, resetting first if its fields differ from the
    /// stored ones.
    pub fn append(&self, t: f64, tuple: &FeatureTuple) -> Result<AppendOutcome, AccumulatorError> {
        let mut store = self.write();
        let mut outcome = AppendOutcome::Appended;
        let same = store
            .schema
            .as_ref()
            .is_some_and(|s| s.same_fields(tuple.schema()));
        if !same {
            if store.schema.is_some() {
                outcome = AppendOutcome::SchemaChanged;
                tracing::info!(
                    fields = tuple.schema().len(),
                    discarded = store.times.len(),
                    "Feature schema changed, accumulator reset"
                );
            }
            store.clear();
            store.schema = Some(Arc::clone(tuple.schema()));
        }
        store.push(t, tuple.values())?;
        let evicted = store.evict(self.config.max_history);
        if evicted > 0 {
            tracing::trace!(evicted, "Accumulator trimmed");
        }
        Ok(outcome)
    }

    /// Appends raw values matching the current schema.
    pub fn append_values(&self, t: f64, values: &[f64]) -> Result<(), AccumulatorError> {
        let mut store = self.write();
        if store.schema.is_none() {
            return Err(AccumulatorError::NoSchema);
        }
        store.push(t, values)?;
        store.evict(self.config.max_history);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.read().times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().times.is_empty()
    }

    pub fn schema(&self) -> Option<Arc<FeatureSchema>> {
        self.read().schema.clone()
    }

    /// While recording, rows are never evicted.
    pub fn set_recording(&self, recording: bool) {
        self.write().recording = recording;
    }

    pub fn is_recording(&self) -> bool {
        self.read().recording
    }

    pub fn last_time(&self) -> Option<f64> {
        self.read().times.last().copied()
    }

    /// The most recent `min(n, len)` rows.
    pub fn get_last_n(&self, n: usize) -> Window {
        self.read().window(n)
    }

    /// Roughly the last `seconds` of data, sized with [`Self::get_fps`].
    ///
    /// Falls back to the last row when no usable framerate is available.
    pub fn get_last_t(&self, seconds: f64) -> Window {
        let count = seconds * self.get_fps();
        if count.is_finite() && count >= 1.0 && count < usize::MAX as f64 {
            self.get_last_n(count.round() as usize)
        } else {
            self.get_last_n(1)
        }
    }

    /// Every stored row.
    pub fn dataframe(&self) -> Window {
        let store = self.read();
        store.window(store.times.len())
    }

    /// The latest sample taken at or before `t`.
    pub fn values_at_abs_time(&self, t: f64) -> Option<Sample> {
        let store = self.read();
        let idx = store.times.partition_point(|&x| x <= t);
        if idx == 0 {
            return None;
        }
        let i = idx - 1;
        let w = store.width();
        Some(Sample {
            t: store.times[i],
            values: store.values[i * w..(i + 1) * w].to_vec(),
        })
    }

    /// The most recent sample.
    pub fn last(&self) -> Option<Sample> {
        let store = self.read();
        let t = *store.times.last()?;
        let w = store.width();
        let start = store.values.len() - w;
        Some(Sample {
            t,
            values: store.values[start..].to_vec(),
        })
    }

    /// `K / (t[-1] - t[-K])` over the configured window, or 0.0 when there
    /// are fewer than `K` samples or no elapsed time.
    pub fn get_fps(&self) -> f64 {
        let k = self.config.fps_window;
        let store = self.read();
        let n = store.times.len();
        if k < 2 || n < k {
            return 0.0;
        }
        let dt = store.times[n - 1] - store.times[n - k];
        if dt > 0.0 {
            k as f64 / dt
        } else {
            0.0
        }
    }

    /// Mean spacing of the recent samples, if there are at least two.
    pub fn mean_dt(&self) -> Option<f64> {
        let store = self.read();
        let n = store.times.len();
        let k = self.config.fps_window.max(2).min(n);
        if k < 2 {
            return None;
        }
        let dt = (store.times[n - 1] - store.times[n - k]) / (k - 1) as f64;
        (dt > 0.0).then_some(dt)
    }
}
