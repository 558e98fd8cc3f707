use serde::{Deserialize, Serialize};

use super::state::{StateContainer, StateValue};

/// An edge connecting two nodes in the execution graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    /// Source node name.
    pub from: String,
    /// Target node name.
    pub to: String,
    /// Condition that must be true to traverse this edge.
    #[serde(default)]
    pub condition: EdgeCondition,
    /// Marks a bounded loop edge: traversed at most this many times per
    /// execution, then treated as non-matching.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
}

/// Condition for traversing an edge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EdgeCondition {
    /// Always traverse this edge.
    #[default]
    Always,
    /// Traverse only if the source node succeeded cleanly.
    OnSuccess,
    /// Traverse only if the source node soft-failed.
    OnFailure,
    /// Traverse if the key is present in the state.
    Present { key: String },
    /// Traverse if the key is absent from the state.
    Absent { key: String },
    /// Traverse if a simple expression matches.
    /// Supported: `key == "value"`, `key != "value"`, `key contains "substr"`.
    Conditional { expr: String },
}

impl Edge {
    fn new(from: impl Into<String>, to: impl Into<String>, condition: EdgeCondition) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition,
            max_iterations: None,
        }
    }

    /// Create an unconditional edge.
    pub fn always(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::new(from, to, EdgeCondition::Always)
    }

    /// Create an edge that fires on success.
    pub fn on_success(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::new(from, to, EdgeCondition::OnSuccess)
    }

    /// Create an edge that fires on soft failure.
    pub fn on_failure(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::new(from, to, EdgeCondition::OnFailure)
    }

    pub fn present(from: impl Into<String>, to: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(from, to, EdgeCondition::Present { key: key.into() })
    }

    pub fn absent(from: impl Into<String>, to: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(from, to, EdgeCondition::Absent { key: key.into() })
    }

    /// Create a conditional edge.
    pub fn conditional(
        from: impl Into<String>,
        to: impl Into<String>,
        expr: impl Into<String>,
    ) -> Self {
        Self::new(from, to, EdgeCondition::Conditional { expr: expr.into() })
    }

    /// Mark this edge as a bounded loop.
    pub fn bounded(mut self, max_iterations: u32) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }

    pub fn is_bounded_loop(&self) -> bool {
        self.max_iterations.is_some()
    }

    /// Evaluate the edge predicate against the state after `self.from` ran.
    pub fn matches(&self, state: &StateContainer) -> bool {
        match &self.condition {
            EdgeCondition::Always => true,
            EdgeCondition::OnSuccess => status_of(&self.from, state) == Some("success"),
            EdgeCondition::OnFailure => status_of(&self.from, state) == Some("soft_failure"),
            EdgeCondition::Present { key } => state.has(key),
            EdgeCondition::Absent { key } => !state.has(key),
            EdgeCondition::Conditional { expr } => evaluate_condition(expr, state),
        }
    }
}

/// State key holding the outcome label of `node`.
pub fn status_key(node: &str) -> String {
    format!("{}_status", node)
}

fn status_of<'a>(node: &str, state: &'a StateContainer) -> Option<&'a str> {
    state.get_str(&status_key(node))
}

/// Comparison operator of a conditional expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionOp {
    Eq,
    NotEq,
    Contains,
}

/// Parse `key OP "value"` expressions, returning (key, op, value).
///
/// Returns `None` for unparseable expressions; the graph validator rejects
/// those at construction.
pub fn parse_condition(expr: &str) -> Option<(&str, ConditionOp, &str)> {
    let expr = expr.trim();
    for (token, op) in [
        (" contains ", ConditionOp::Contains),
        ("!=", ConditionOp::NotEq),
        ("==", ConditionOp::Eq),
    ] {
        if let Some((key, value)) = expr.split_once(token) {
            let key = key.trim();
            let value = value.trim();
            let valid_key = !key.is_empty() && !key.contains(char::is_whitespace);
            let quoted = value.len() >= 2 && value.starts_with('"') && value.ends_with('"');
            if !valid_key || !quoted {
                continue;
            }
            return Some((key, op, &value[1..value.len() - 1]));
        }
    }
    None
}

/// Evaluate a simple conditional expression against the state.
///
/// Supported expressions:
/// - `key == "value"`: exact match
/// - `key != "value"`: not equal
/// - `key contains "substr"`: substring match
///
/// Text values compare directly; records compare through their string
/// form. A missing key never matches.
pub fn evaluate_condition(expr: &str, state: &StateContainer) -> bool {
    let Some((key, op, value)) = parse_condition(expr) else {
        return false;
    };
    let Some(actual) = state.get(key).map(comparable) else {
        return false;
    };
    match op {
        ConditionOp::Eq => actual == value,
        ConditionOp::NotEq => actual != value,
        ConditionOp::Contains => actual.contains(value),
    }
}

fn comparable(value: &StateValue) -> String {
    match value {
        StateValue::Record(serde_json::Value::String(s)) => s.clone(),
        other => other.to_text(),
    }
}
