//! Feature tuples and the schemas describing them.
//!
//! A [`FeatureSchema`] is the ordered list of field names produced by a
//! pipeline, tagged with a version that increases every time the field set
//! changes. Tuples carry their schema so consumers can key values by name
//! and notice a schema change without inspecting widths.

use std::sync::Arc;

/// Ordered, versioned list of feature names.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureSchema {
    fields: Vec<String>,
    version: u64,
}

impl FeatureSchema {
    pub fn new<I, S>(fields: I, version: u64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
            version,
        }
    }

    /// Field names in tuple order.
    #[inline]
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Column position of `name`.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f == name)
    }

    /// True when both schemas describe the same columns.
    pub fn same_fields(&self, other: &FeatureSchema) -> bool {
        self.fields == other.fields
    }
}

/// One processed frame's worth of features.
///
/// `NaN` marks a value that could not be measured on that frame.
#[derive(Debug, Clone)]
pub struct FeatureTuple {
    schema: Arc<FeatureSchema>,
    values: Vec<f64>,
}

impl FeatureTuple {
    /// Pairs values with their schema.
    ///
    /// Returns `None` if the value count does not match the schema width.
    pub fn new(schema: Arc<FeatureSchema>, values: Vec<f64>) -> Option<Self> {
        (values.len() == schema.len()).then_some(Self { schema, values })
    }

    /// All-NaN tuple for `schema`.
    pub fn invalid(schema: Arc<FeatureSchema>) -> Self {
        let values = vec![f64::NAN; schema.len()];
        Self { schema, values }
    }

    #[inline]
    pub fn schema(&self) -> &Arc<FeatureSchema> {
        &self.schema
    }

    #[inline]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Value of the named field.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.schema.index_of(name).map(|i| self.values[i])
    }

    /// Iterates `(name, value)` pairs in schema order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> + '_ {
        self.schema
            .fields()
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().copied())
    }
}
