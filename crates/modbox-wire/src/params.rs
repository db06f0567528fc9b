//! Parameter values
//!
//! `Params` are already validated against the module's declared schema by
//! the caller; the wire form keeps their declared kind so a worker can tell
//! a column reference from an ordinary string.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Validated parameter dictionary
pub type Params = BTreeMap<String, ParamValue>;

/// One typed parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ParamValue {
    /// Absent value
    Null,
    /// Free text
    String(String),
    /// Whole number
    Integer(i64),
    /// Floating-point number
    Float(f64),
    /// Checkbox
    Boolean(bool),
    /// Name of a column of the input table
    Column(String),
    /// Slug of another tab
    Tab(String),
    /// File name inside the scratch directory
    Filename(String),
    /// Ordered values
    List(Vec<ParamValue>),
    /// Nested dictionary
    Map(BTreeMap<String, ParamValue>),
}

impl ParamValue {
    /// Plain JSON view, dropping the declared kind
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::String(s) | Self::Column(s) | Self::Tab(s) | Self::Filename(s) => {
                Value::String(s.clone())
            }
            Self::Integer(n) => Value::from(*n),
            Self::Float(f) => Value::from(*f),
            Self::Boolean(b) => Value::Bool(*b),
            Self::List(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    /// Every `Filename` referenced, depth first
    #[must_use]
    pub fn filenames(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_filenames(&mut out);
        out
    }

    fn collect_filenames<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Filename(name) => out.push(name),
            Self::List(items) => items.iter().for_each(|v| v.collect_filenames(out)),
            Self::Map(map) => map.values().for_each(|v| v.collect_filenames(out)),
            _ => {}
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

/// JSON view of a whole dictionary
#[must_use]
pub fn params_to_json(params: &Params) -> Value {
    Value::Object(
        params
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect(),
    )
}

/// Unvalidated parameters as stored by an older module version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawParams(pub Value);

impl RawParams {
    /// Wrap a JSON value
    #[inline]
    #[must_use]
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Borrow the JSON value
    #[inline]
    #[must_use]
    pub fn as_value(&self) -> &Value {
        &self.0
    }
}
