use serde::{Deserialize, Serialize};

use scrapeflow_core::config::{MergeStrategy, RetryConfig};
use scrapeflow_core::error::{GraphError, Result, ScrapeError};

use super::input::InputExpr;
use super::state::StateDelta;

/// A node in the execution graph.
///
/// Nodes are stateless; everything a node reads or writes goes through the
/// state container. `inputs` is resolved against the state at runtime and
/// the resolved keys are handed to the kind-specific step in order; the
/// step writes its results under `outputs`, again positionally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique name within a graph.
    pub name: String,
    pub kind: NodeKind,
    /// Required keys.
    pub inputs: InputExpr,
    /// Keys read when present, never required.
    #[serde(default)]
    pub optional_inputs: Vec<String>,
    /// Keys this node writes.
    pub outputs: Vec<String>,
    /// In-place retry for transient collaborator errors.
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

/// What a node does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
    Fetch(FetchNode),
    Parse(ParseNode),
    GenerateAnswer(GenerateAnswerNode),
    ImageToText(ImageToTextNode),
    Merge(MergeNode),
    /// Named branching point; executes nothing.
    Conditional,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchNode {
    /// Consult the robots collaborator before remote fetches.
    #[serde(default)]
    pub respect_robots: bool,
}

/// Per-node overrides of the global parse options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParseNode {
    #[serde(default)]
    pub chunk_size: Option<usize>,
    #[serde(default)]
    pub parse_html: Option<bool>,
    #[serde(default)]
    pub parse_urls: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerateAnswerNode {
    /// Extra instructions appended to every prompt.
    #[serde(default)]
    pub additional_info: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageToTextNode {
    #[serde(default)]
    pub max_images: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeNode {
    #[serde(default)]
    pub strategy: Option<MergeStrategy>,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fetch(_) => "fetch",
            Self::Parse(_) => "parse",
            Self::GenerateAnswer(_) => "generate_answer",
            Self::ImageToText(_) => "image_to_text",
            Self::Merge(_) => "merge",
            Self::Conditional => "conditional",
        }
    }

    /// Default `(inputs, optional_inputs, outputs)` contract.
    fn default_contract(&self) -> (&'static str, &'static [&'static str], &'static [&'static str]) {
        match self {
            Self::Fetch(_) => ("source", &[], &["doc", "content_kind"]),
            Self::Parse(_) => (
                "doc",
                &["source", "content_kind"],
                &["parsed_doc", "link_urls", "img_urls"],
            ),
            Self::GenerateAnswer(_) => (
                "user_prompt & (relevant_chunks | parsed_doc | doc)",
                &["schema", "img_desc"],
                &["answer"],
            ),
            Self::ImageToText(_) => ("img_urls", &[], &["img_desc"]),
            Self::Merge(_) => ("results", &["user_prompt"], &["answer"]),
            Self::Conditional => ("", &[], &[]),
        }
    }
}

/// Bounded in-place retry with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

fn default_initial_backoff() -> u64 { 500 }
fn default_max_backoff() -> u64 { 10_000 }

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }

    pub fn with_backoff(mut self, initial_ms: u64, max_ms: u64) -> Self {
        self.initial_backoff_ms = initial_ms;
        self.max_backoff_ms = max_ms;
        self
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff_ms: config.initial_backoff_ms,
            max_backoff_ms: config.max_backoff_ms,
        }
    }
}

impl Node {
    /// Create a node with the default key contract of its kind.
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        let (inputs, optional, outputs) = kind.default_contract();
        // Default contracts are static and well-formed
        let inputs = inputs.parse().unwrap_or_else(|_| InputExpr::And(vec![]));
        Self {
            name: name.into(),
            kind,
            inputs,
            optional_inputs: optional.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            retry: None,
        }
    }

    pub fn fetch(name: impl Into<String>) -> Self {
        Self::new(name, NodeKind::Fetch(FetchNode::default()))
    }

    pub fn parse(name: impl Into<String>) -> Self {
        Self::new(name, NodeKind::Parse(ParseNode::default()))
    }

    pub fn generate_answer(name: impl Into<String>) -> Self {
        Self::new(name, NodeKind::GenerateAnswer(GenerateAnswerNode::default()))
    }

    pub fn image_to_text(name: impl Into<String>) -> Self {
        Self::new(name, NodeKind::ImageToText(ImageToTextNode::default()))
    }

    pub fn merge(name: impl Into<String>) -> Self {
        Self::new(name, NodeKind::Merge(MergeNode::default()))
    }

    pub fn conditional(name: impl Into<String>) -> Self {
        Self::new(name, NodeKind::Conditional)
    }

    /// Replace the required-input expression.
    pub fn with_inputs(mut self, expr: &str) -> Result<Self> {
        self.inputs = expr.parse().map_err(|reason| {
            ScrapeError::Graph(GraphError::InvalidInputExpr {
                node: self.name.clone(),
                expr: expr.to_string(),
                reason,
            })
        })?;
        Ok(self)
    }

    pub fn with_optional_inputs(mut self, keys: Vec<String>) -> Self {
        self.optional_inputs = keys;
        self
    }

    pub fn with_outputs(mut self, keys: Vec<String>) -> Self {
        self.outputs = keys;
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Output key at `index`, falling back to the kind default.
    pub fn output(&self, index: usize) -> &str {
        match self.outputs.get(index) {
            Some(key) => key,
            None => self.kind.default_contract().2.get(index).copied().unwrap_or(""),
        }
    }
}

/// Outcome of one node attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeOutcome {
    Success,
    /// Partial or default values written; the path continues.
    SoftFailure(String),
    /// Transient collaborator error; the executor decides whether to retry.
    Retryable(String),
    /// The path aborts and the attempt's writes are discarded.
    Fatal(String),
}

impl NodeOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::SoftFailure(_) => "soft_failure",
            Self::Retryable(_) => "retryable",
            Self::Fatal(_) => "fatal",
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Success => None,
            Self::SoftFailure(m) | Self::Retryable(m) | Self::Fatal(m) => Some(m),
        }
    }
}

/// Writes plus outcome of one node attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRun {
    pub delta: StateDelta,
    pub outcome: NodeOutcome,
}

impl NodeRun {
    pub fn success(delta: StateDelta) -> Self {
        Self {
            delta,
            outcome: NodeOutcome::Success,
        }
    }

    pub fn soft(delta: StateDelta, message: impl Into<String>) -> Self {
        Self {
            delta,
            outcome: NodeOutcome::SoftFailure(message.into()),
        }
    }

    /// Classify a collaborator error.
    pub fn from_error(err: &ScrapeError) -> Self {
        let outcome = if err.is_transient() {
            NodeOutcome::Retryable(err.to_string())
        } else {
            NodeOutcome::Fatal(err.to_string())
        };
        Self {
            delta: StateDelta::new(),
            outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_contracts() {
        let fetch = Node::fetch("fetch");
        assert_eq!(fetch.inputs, InputExpr::key("source"));
        assert_eq!(fetch.outputs, vec!["doc", "content_kind"]);

        let gen = Node::generate_answer("generate_answer");
        assert_eq!(
            gen.inputs.to_string(),
            "user_prompt & (relevant_chunks | parsed_doc | doc)"
        );
        assert_eq!(gen.optional_inputs, vec!["schema", "img_desc"]);

        let cond = Node::conditional("branch");
        assert!(cond.inputs.is_satisfied_by(&|_| false));
        assert!(cond.outputs.is_empty());
    }

    #[test]
    fn test_with_inputs_rejects_bad_expression() {
        let err = Node::parse("parse").with_inputs("doc &").unwrap_err();
        assert!(matches!(
            err,
            ScrapeError::Graph(GraphError::InvalidInputExpr { ref node, .. }) if node == "parse"
        ));

        let node = Node::parse("parse").with_inputs("doc | html").unwrap();
        assert_eq!(node.inputs.keys().len(), 2);
    }

    #[test]
    fn test_output_falls_back_to_kind_default() {
        let node = Node::parse("parse").with_outputs(vec!["chunks".into()]);
        assert_eq!(node.output(0), "chunks");
        assert_eq!(node.output(1), "link_urls");
        assert_eq!(node.output(7), "");
    }

    #[test]
    fn test_retry_policy_from_config() {
        let policy = RetryPolicy::from(&RetryConfig::default());
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.initial_backoff_ms, 500);
        let fast = RetryPolicy::new(3).with_backoff(1, 5);
        assert_eq!(fast.max_backoff_ms, 5);
    }

    #[test]
    fn test_from_error_classification() {
        let run = NodeRun::from_error(&ScrapeError::transient("fetch", "reset"));
        assert!(matches!(run.outcome, NodeOutcome::Retryable(_)));

        let run = NodeRun::from_error(&ScrapeError::UnreachableSource("nope".into()));
        assert_eq!(run.outcome.label(), "fatal");
        assert!(run.delta.is_empty());
    }

    #[test]
    fn test_node_deserializes_from_toml() {
        let node: Node = toml::from_str(
            r#"
name = "parse"
inputs = "doc"
outputs = ["parsed_doc", "link_urls", "img_urls"]

[kind]
kind = "parse"
parse_urls = true

[retry]
max_retries = 1
"#,
        )
        .unwrap();
        assert_eq!(node.kind.as_str(), "parse");
        assert!(matches!(node.kind, NodeKind::Parse(ParseNode { parse_urls: Some(true), .. })));
        assert_eq!(node.retry.map(|r| r.max_retries), Some(1));
        assert_eq!(node.retry.map(|r| r.initial_backoff_ms), Some(500));
    }
}
