use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A value stored in the [`StateContainer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum StateValue {
    Text(String),
    Record(serde_json::Value),
    Blob(Vec<u8>),
    List(Vec<StateValue>),
    Error(ErrorMarker),
}

/// A failure written into the state in place of a value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMarker {
    /// Node (or source) that produced the marker.
    pub origin: String,
    /// Short failure class, e.g. `malformed_output` or `no_content`.
    #[serde(default = "default_marker_kind")]
    pub kind: String,
    pub message: String,
    /// Raw output that could not be turned into a value, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

fn default_marker_kind() -> String {
    "error".to_string()
}

impl StateValue {
    pub fn error(
        origin: impl Into<String>,
        kind: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Error(ErrorMarker {
            origin: origin.into(),
            kind: kind.into(),
            message: message.into(),
            raw: None,
        })
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Record(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[StateValue]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Self::Blob(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&ErrorMarker> {
        match self {
            Self::Error(marker) => Some(marker),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Flatten into prompt-ready text.
    pub fn to_text(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Record(serde_json::Value::String(s)) => s.clone(),
            Self::Record(v) => v.to_string(),
            Self::Blob(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            Self::List(items) => items
                .iter()
                .map(StateValue::to_text)
                .collect::<Vec<_>>()
                .join("\n"),
            Self::Error(marker) => marker.message.clone(),
        }
    }

    /// JSON view used in results and merged answers. Blobs are summarized.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Text(s) => serde_json::Value::String(s.clone()),
            Self::Record(v) => v.clone(),
            Self::Blob(bytes) => serde_json::json!({ "bytes": bytes.len() }),
            Self::List(items) => serde_json::Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Error(marker) => serde_json::json!({
                "error": marker.message,
                "kind": marker.kind,
                "origin": marker.origin,
            }),
        }
    }
}

impl From<&str> for StateValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for StateValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<serde_json::Value> for StateValue {
    fn from(v: serde_json::Value) -> Self {
        Self::Record(v)
    }
}

impl From<Vec<u8>> for StateValue {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Blob(bytes)
    }
}

impl From<Vec<StateValue>> for StateValue {
    fn from(items: Vec<StateValue>) -> Self {
        Self::List(items)
    }
}

impl From<Vec<String>> for StateValue {
    fn from(items: Vec<String>) -> Self {
        Self::List(items.into_iter().map(StateValue::Text).collect())
    }
}

/// Writes produced by one node attempt, applied by the executor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateDelta {
    writes: Vec<(String, StateValue)>,
}

impl StateDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<StateValue>) {
        self.writes.push((key.into(), value.into()));
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<StateValue>) -> Self {
        self.set(key, value);
        self
    }

    /// Last value written for `key`.
    pub fn get(&self, key: &str) -> Option<&StateValue> {
        self.writes.iter().rev().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.writes.iter().map(|(k, _)| k.as_str())
    }
}

/// Shared state threaded through one source's execution.
///
/// Nodes communicate only through named keys; a missing key is an
/// ordinary `None`, never an error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateContainer {
    data: BTreeMap<String, StateValue>,
}

impl StateContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a container from initial data.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<StateValue>,
    {
        Self {
            data: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Get a value by key.
    pub fn get(&self, key: &str) -> Option<&StateValue> {
        self.data.get(key)
    }

    /// Get a value as a string, if it's text.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(StateValue::as_str)
    }

    pub fn get_record(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key).and_then(StateValue::as_record)
    }

    pub fn get_list(&self, key: &str) -> Option<&[StateValue]> {
        self.data.get(key).and_then(StateValue::as_list)
    }

    pub fn has(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Set a value, replacing any previous one.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<StateValue>) {
        self.data.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<StateValue> {
        self.data.remove(key)
    }

    /// Apply a node's writes in order.
    pub fn apply(&mut self, delta: StateDelta) {
        for (k, v) in delta.writes {
            self.data.insert(k, v);
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.data.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Get the underlying data map.
    pub fn data(&self) -> &BTreeMap<String, StateValue> {
        &self.data
    }

    /// JSON object view of every key.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.data
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}
