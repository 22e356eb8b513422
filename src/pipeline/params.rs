//! Typed, bounded, live-tunable node parameters.
//!
//! Every stage declares its parameters as a plain struct implementing
//! [`NodeParams`], with a static table of [`ParamSpec`]s carrying bounds.
//! [`ParamSet`] wraps that struct and keeps a dirty set so only edited
//! values are pushed across the worker boundary.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Path key carrying the diagnostic image selector.
pub const DIAGNOSTICS_KEY: &str = "diagnostics";
/// Path key carrying the reset signal.
pub const RESET_KEY: &str = "reset";

/// A single parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            ParamValue::Float(v) => Some(v),
            ParamValue::Int(v) => Some(v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            ParamValue::Bool(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(v) => write!(f, "{v}"),
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Float(v) => write!(f, "{v}"),
            ParamValue::Text(v) => write!(f, "{v:?}"),
        }
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

/// Parameter updates keyed by node path, then parameter name.
///
/// Two reserved paths exist: [`DIAGNOSTICS_KEY`] (`{"image": <selector>}`)
/// and [`RESET_KEY`] (`{"reset": true}`).
pub type ParamUpdate = BTreeMap<String, BTreeMap<String, ParamValue>>;

/// Folds `newer` into `pending`, newer values winning.
pub fn merge_updates(pending: &mut ParamUpdate, newer: ParamUpdate) {
    for (path, values) in newer {
        pending.entry(path).or_default().extend(values);
    }
}

/// Errors raised when reading or writing parameters.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParamError {
    #[error("unknown parameter {0:?}")]
    Unknown(String),
    #[error("parameter {name:?} expects a {expected} value, got {got}")]
    TypeMismatch {
        name: String,
        expected: &'static str,
        got: ParamValue,
    },
    #[error("parameter {name:?} = {value} is outside [{min}, {max}]")]
    OutOfBounds {
        name: String,
        value: f64,
        min: f64,
        max: f64,
    },
}

/// Value type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Float,
    Int,
    Bool,
}

/// Declaration of one parameter: name, type, bounds, and whether editing it
/// changes the owning node's output fields.
#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub min: f64,
    pub max: f64,
    pub affects_schema: bool,
}

impl ParamSpec {
    pub const fn float(name: &'static str, min: f64, max: f64) -> Self {
        Self {
            name,
            kind: ParamKind::Float,
            min,
            max,
            affects_schema: false,
        }
    }

    /// Integer parameter; bounds are inclusive whole numbers.
    pub const fn int(name: &'static str, min: f64, max: f64) -> Self {
        Self {
            name,
            kind: ParamKind::Int,
            min,
            max,
            affects_schema: false,
        }
    }

    pub const fn flag(name: &'static str) -> Self {
        Self {
            name,
            kind: ParamKind::Bool,
            min: 0.0,
            max: 1.0,
            affects_schema: false,
        }
    }

    /// Marks the parameter as changing the node's output fields.
    pub const fn schema(mut self) -> Self {
        self.affects_schema = true;
        self
    }

    /// Checks type and bounds, returning the value in canonical form.
    pub fn validate(&self, value: &ParamValue) -> Result<ParamValue, ParamError> {
        match self.kind {
            ParamKind::Bool => value
                .as_bool()
                .map(ParamValue::Bool)
                .ok_or_else(|| self.mismatch("bool", value)),
            ParamKind::Float => {
                let v = value.as_f64().ok_or_else(|| self.mismatch("float", value))?;
                self.check_bounds(v)?;
                Ok(ParamValue::Float(v))
            }
            ParamKind::Int => {
                let v = value.as_f64().ok_or_else(|| self.mismatch("integer", value))?;
                if v.fract() != 0.0 {
                    return Err(self.mismatch("integer", value));
                }
                self.check_bounds(v)?;
                Ok(ParamValue::Int(v as i64))
            }
        }
    }

    fn check_bounds(&self, v: f64) -> Result<(), ParamError> {
        if !(self.min..=self.max).contains(&v) {
            return Err(ParamError::OutOfBounds {
                name: self.name.to_string(),
                value: v,
                min: self.min,
                max: self.max,
            });
        }
        Ok(())
    }

    fn mismatch(&self, expected: &'static str, got: &ParamValue) -> ParamError {
        ParamError::TypeMismatch {
            name: self.name.to_string(),
            expected,
            got: got.clone(),
        }
    }
}

/// A node's hand-written parameter struct.
///
/// `assign` is only called with values already validated against the
/// matching [`ParamSpec`], so implementations may rely on the canonical
/// variant being present.
pub trait NodeParams: Clone + fmt::Debug + Send {
    fn specs(&self) -> &'static [ParamSpec];
    fn value(&self, name: &str) -> Option<ParamValue>;
    fn assign(&mut self, name: &str, value: &ParamValue);
}

/// Object-safe view used by the pipeline to route updates to any node.
pub trait ParamTable {
    /// Applies one value; returns `true` when the node's output fields may
    /// have changed as a result.
    fn set_param(&mut self, name: &str, value: &ParamValue) -> Result<bool, ParamError>;
    /// Values edited since the previous call, clearing the dirty set.
    fn take_changed(&mut self) -> BTreeMap<String, ParamValue>;
    /// Every current value.
    fn snapshot(&self) -> BTreeMap<String, ParamValue>;
}

/// Parameter struct plus dirty tracking.
#[derive(Debug, Clone)]
pub struct ParamSet<P> {
    values: P,
    changed: BTreeSet<&'static str>,
}

impl<P: NodeParams> ParamSet<P> {
    pub fn new(values: P) -> Self {
        Self {
            values,
            changed: BTreeSet::new(),
        }
    }

    /// Current values.
    #[inline]
    pub fn get(&self) -> &P {
        &self.values
    }

    fn spec(&self, name: &str) -> Result<&'static ParamSpec, ParamError> {
        self.values
            .specs()
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| ParamError::Unknown(name.to_string()))
    }

    /// Returns true if any value is dirty.
    pub fn is_dirty(&self) -> bool {
        !self.changed.is_empty()
    }
}

impl<P: NodeParams> ParamTable for ParamSet<P> {
    fn set_param(&mut self, name: &str, value: &ParamValue) -> Result<bool, ParamError> {
        let spec = self.spec(name)?;
        let value = spec.validate(value)?;
        if self.values.value(spec.name).as_ref() == Some(&value) {
            return Ok(false);
        }
        self.values.assign(spec.name, &value);
        self.changed.insert(spec.name);
        Ok(spec.affects_schema)
    }

    fn take_changed(&mut self) -> BTreeMap<String, ParamValue> {
        let changed = std::mem::take(&mut self.changed);
        changed
            .into_iter()
            .filter_map(|name| self.values.value(name).map(|v| (name.to_string(), v)))
            .collect()
    }

    fn snapshot(&self) -> BTreeMap<String, ParamValue> {
        self.values
            .specs()
            .iter()
            .filter_map(|s| self.values.value(s.name).map(|v| (s.name.to_string(), v)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone)]
    struct Demo {
        gain: f64,
        count: usize,
        invert: bool,
    }

    const DEMO_SPECS: &[ParamSpec] = &[
        ParamSpec::float("gain", 0.0, 10.0),
        ParamSpec::int("count", 1.0, 20.0).schema(),
        ParamSpec::flag("invert"),
    ];

    impl NodeParams for Demo {
        fn specs(&self) -> &'static [ParamSpec] {
            DEMO_SPECS
        }

        fn value(&self, name: &str) -> Option<ParamValue> {
            match name {
                "gain" => Some(self.gain.into()),
                "count" => Some((self.count as i64).into()),
                "invert" => Some(self.invert.into()),
                _ => None,
            }
        }

        fn assign(&mut self, name: &str, value: &ParamValue) {
            match (name, value) {
                ("gain", ParamValue::Float(v)) => self.gain = *v,
                ("count", ParamValue::Int(v)) => self.count = *v as usize,
                ("invert", ParamValue::Bool(v)) => self.invert = *v,
                _ => {}
            }
        }
    }

    fn demo() -> ParamSet<Demo> {
        ParamSet::new(Demo {
            gain: 1.0,
            count: 5,
            invert: false,
        })
    }

    #[test]
    fn test_set_marks_dirty_once() {
        let mut params = demo();
        assert!(!params.set_param("gain", &ParamValue::Float(2.0)).unwrap());
        assert!(params.is_dirty());

        let changed = params.take_changed();
        assert_eq!(changed.get("gain"), Some(&ParamValue::Float(2.0)));
        assert!(params.take_changed().is_empty());
    }

    #[test]
    fn test_unchanged_value_not_dirty() {
        let mut params = demo();
        params.set_param("gain", &ParamValue::Int(1)).unwrap();
        assert!(!params.is_dirty());
    }

    #[test]
    fn test_schema_param_reported() {
        let mut params = demo();
        assert!(params.set_param("count", &ParamValue::Int(8)).unwrap());
        assert_eq!(params.get().count, 8);
    }

    #[test]
    fn test_bounds_and_types_rejected() {
        let mut params = demo();
        assert!(matches!(
            params.set_param("gain", &ParamValue::Float(11.0)),
            Err(ParamError::OutOfBounds { .. })
        ));
        assert!(matches!(
            params.set_param("count", &ParamValue::Float(2.5)),
            Err(ParamError::TypeMismatch { .. })
        ));
        assert!(matches!(
            params.set_param("invert", &ParamValue::Int(1)),
            Err(ParamError::TypeMismatch { .. })
        ));
        assert!(matches!(
            params.set_param("nope", &ParamValue::Int(1)),
            Err(ParamError::Unknown(_))
        ));
        assert!(!params.is_dirty());
    }

    #[test]
    fn test_merge_updates_newer_wins() {
        let mut pending = ParamUpdate::new();
        pending
            .entry("/a".into())
            .or_default()
            .insert("x".into(), ParamValue::Int(1));
        let mut newer = ParamUpdate::new();
        newer
            .entry("/a".into())
            .or_default()
            .insert("x".into(), ParamValue::Int(2));
        newer
            .entry("/b".into())
            .or_default()
            .insert("y".into(), ParamValue::Bool(true));

        merge_updates(&mut pending, newer);
        assert_eq!(pending["/a"]["x"], ParamValue::Int(2));
        assert_eq!(pending["/b"]["y"], ParamValue::Bool(true));
    }
}
