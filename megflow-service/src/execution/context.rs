// Execution Context
// Iteration axes and the per-instance bindings they expand into

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// A named dimension of parameterized iteration, e.g. `subject_id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationAxis {
    pub name: String,
    pub values: Vec<String>,
}

impl IterationAxis {
    pub fn new<I, V>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// First value that appears more than once, if any
    pub fn first_duplicate(&self) -> Option<&str> {
        let mut seen = HashSet::new();
        self.values
            .iter()
            .find(|value| !seen.insert(value.as_str()))
            .map(String::as_str)
    }
}

/// Axis bindings identifying one instantiation of a workflow
///
/// Bindings keep the declaration order of their axes, which also fixes the
/// on-disk context key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionContext {
    bindings: Vec<(String, String)>,
}

impl ExecutionContext {
    pub fn new(bindings: Vec<(String, String)>) -> Self {
        Self { bindings }
    }

    /// Context with a single axis binding
    pub fn single(axis: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            bindings: vec![(axis.into(), value.into())],
        }
    }

    /// Value bound to an axis
    pub fn get(&self, axis: &str) -> Option<&str> {
        self.bindings
            .iter()
            .find(|(name, _)| name == axis)
            .map(|(_, value)| value.as_str())
    }

    pub fn bindings(&self) -> &[(String, String)] {
        &self.bindings
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Directory-safe key for this context, e.g. `_subject_id_sub001`
    pub fn key(&self) -> String {
        if self.bindings.is_empty() {
            return "_default".to_string();
        }
        self.bindings
            .iter()
            .map(|(name, value)| format!("_{}_{}", name, sanitize(value)))
            .collect()
    }
}

impl fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .bindings
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect();
        write!(f, "{}", parts.join(", "))
    }
}

fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | ' ' => '_',
            c => c,
        })
        .collect()
}
