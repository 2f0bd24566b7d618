// Slots and Artifacts
// Typed values flowing along graph edges

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Declared kind of an input or output slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotKind {
    /// A single file or directory
    Path,
    /// An ordered list of files
    Paths,
    /// A parameter value
    Scalar,
}

impl fmt::Display for SlotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotKind::Path => write!(f, "path"),
            SlotKind::Paths => write!(f, "paths"),
            SlotKind::Scalar => write!(f, "scalar"),
        }
    }
}

/// Name, kind and optionality of a slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotSpec {
    pub name: String,
    pub kind: SlotKind,
    pub required: bool,
}

impl SlotSpec {
    pub fn new(name: impl Into<String>, kind: SlotKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
        }
    }

    pub fn path(name: impl Into<String>) -> Self {
        Self::new(name, SlotKind::Path)
    }

    pub fn paths(name: impl Into<String>) -> Self {
        Self::new(name, SlotKind::Paths)
    }

    pub fn scalar(name: impl Into<String>) -> Self {
        Self::new(name, SlotKind::Scalar)
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

/// Scalar parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    /// Whole numbers such as trigger codes; rendered without a fraction
    Integer(i64),
    Number(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Integer(n) => Some(*n as f64),
            Value::Number(n) => Some(*n),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Render for use in a command-line argument
    pub fn as_string(&self) -> String {
        match self {
            Value::Bool(b) => b.to_string(),
            Value::Integer(n) => n.to_string(),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    (*n as i64).to_string()
                } else {
                    n.to_string()
                }
            }
            Value::String(s) => s.clone(),
            Value::List(items) => items
                .iter()
                .map(Value::as_string)
                .collect::<Vec<_>>()
                .join(","),
            Value::Map(_) => serde_json::to_string(self).unwrap_or_default(),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Integer(i64::from(n))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<String>> for Value {
    fn from(items: Vec<String>) -> Self {
        Value::List(items.into_iter().map(Value::String).collect())
    }
}

/// Concrete value carried by a slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SlotValue {
    Path(PathBuf),
    Paths(Vec<PathBuf>),
    Scalar(Value),
}

impl SlotValue {
    pub fn scalar(value: impl Into<Value>) -> Self {
        SlotValue::Scalar(value.into())
    }

    pub fn kind(&self) -> SlotKind {
        match self {
            SlotValue::Path(_) => SlotKind::Path,
            SlotValue::Paths(_) => SlotKind::Paths,
            SlotValue::Scalar(_) => SlotKind::Scalar,
        }
    }

    pub fn as_path(&self) -> Option<&Path> {
        match self {
            SlotValue::Path(path) => Some(path),
            _ => None,
        }
    }

    pub fn as_paths(&self) -> Option<&[PathBuf]> {
        match self {
            SlotValue::Paths(paths) => Some(paths),
            _ => None,
        }
    }

    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            SlotValue::Scalar(value) => Some(value),
            _ => None,
        }
    }

    /// Every path referenced by this value
    pub fn paths(&self) -> Vec<&Path> {
        match self {
            SlotValue::Path(path) => vec![path.as_path()],
            SlotValue::Paths(paths) => paths.iter().map(PathBuf::as_path).collect(),
            SlotValue::Scalar(_) => Vec::new(),
        }
    }

    /// Render as command-line arguments: one per path, or the scalar string
    pub fn to_args(&self) -> Vec<String> {
        match self {
            SlotValue::Path(path) => vec![path.display().to_string()],
            SlotValue::Paths(paths) => paths.iter().map(|p| p.display().to_string()).collect(),
            SlotValue::Scalar(value) => vec![value.as_string()],
        }
    }
}

impl From<PathBuf> for SlotValue {
    fn from(path: PathBuf) -> Self {
        SlotValue::Path(path)
    }
}

impl From<Vec<PathBuf>> for SlotValue {
    fn from(paths: Vec<PathBuf>) -> Self {
        SlotValue::Paths(paths)
    }
}

impl From<Value> for SlotValue {
    fn from(value: Value) -> Self {
        SlotValue::Scalar(value)
    }
}

/// Identity of a node instance: a unit of work within one execution context
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeInstanceId {
    pub unit: String,
    pub context_key: String,
}

impl NodeInstanceId {
    pub fn new(unit: impl Into<String>, context_key: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            context_key: context_key.into(),
        }
    }
}

impl fmt::Display for NodeInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.unit, self.context_key)
    }
}

/// Handle to an output produced by a node instance
///
/// The value is shared, never mutated after production.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactRef {
    producer: NodeInstanceId,
    slot: String,
    value: Arc<SlotValue>,
}

impl ArtifactRef {
    pub fn new(producer: NodeInstanceId, slot: impl Into<String>, value: SlotValue) -> Self {
        Self {
            producer,
            slot: slot.into(),
            value: Arc::new(value),
        }
    }

    pub fn producer(&self) -> &NodeInstanceId {
        &self.producer
    }

    pub fn slot(&self) -> &str {
        &self.slot
    }

    pub fn value(&self) -> &SlotValue {
        &self.value
    }

    pub fn kind(&self) -> SlotKind {
        self.value.kind()
    }
}
