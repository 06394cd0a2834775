use crate::error::RunnerError;
use anyhow::{anyhow, Result};
use serde_json::Value;
use std::fs;
use std::path::Path;

/// Ordered, materialized sequence of opaque documents fed to one trial.
///
/// Every source is drained at construction, so repeated trials see the exact
/// same items.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Documents(Vec<Value>);

impl Documents {
    pub fn new(items: Vec<Value>) -> Self {
        Self(items)
    }

    /// Reads one JSON document per non-blank line.
    pub fn from_jsonl(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read documents {}: {}", path.display(), e))?;
        let mut items = Vec::new();
        for (lineno, line) in data.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let doc: Value = serde_json::from_str(line).map_err(|e| {
                anyhow!("{}:{}: invalid document: {}", path.display(), lineno + 1, e)
            })?;
            items.push(doc);
        }
        Ok(Self(items))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[Value] {
        &self.0
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.0.iter()
    }

    pub fn batches(&self, request_size: usize) -> std::slice::Chunks<'_, Value> {
        self.0.chunks(request_size.max(1))
    }
}

impl From<Vec<Value>> for Documents {
    fn from(items: Vec<Value>) -> Self {
        Self(items)
    }
}

/// A bare string is one document, kept verbatim.
impl From<&str> for Documents {
    fn from(text: &str) -> Self {
        Self(vec![Value::String(text.to_string())])
    }
}

impl From<String> for Documents {
    fn from(text: String) -> Self {
        Self(vec![Value::String(text)])
    }
}

impl FromIterator<Value> for Documents {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl TryFrom<Value> for Documents {
    type Error = RunnerError;

    fn try_from(value: Value) -> std::result::Result<Self, Self::Error> {
        match value {
            Value::Array(items) => Ok(Self(items)),
            Value::String(text) => Ok(Self::from(text)),
            other => Err(RunnerError::InvalidDocuments {
                found: value_type_name(&other),
            }),
        }
    }
}

impl<'a> IntoIterator for &'a Documents {
    type Item = &'a Value;
    type IntoIter = std::slice::Iter<'a, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

pub(crate) fn value_type_name(value: &Value) -> &'static str {
    if value.is_string() {
        "string"
    } else if value.is_boolean() {
        "boolean"
    } else if value.is_number() {
        "number"
    } else if value.is_array() {
        "array"
    } else if value.is_object() {
        "object"
    } else {
        "null"
    }
}
