use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScrapeError {
    // Collaborator errors
    #[error("Transient {collaborator} error: {message}")]
    Transient {
        collaborator: String,
        message: String,
    },

    #[error("Source unreachable: {0}")]
    UnreachableSource(String),

    #[error("Source disallowed by robots policy: {0}")]
    Disallowed(String),

    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("Malformed model output: {0}")]
    MalformedOutput(String),

    #[error("Parse failed: {0}")]
    Parse(String),

    #[error("Image description failed: {0}")]
    ImageToText(String),

    #[error("Collaborator not configured: {0}")]
    MissingCollaborator(String),

    // Execution errors
    #[error("Node {node} is missing required input: {requirement}")]
    MissingInput { node: String, requirement: String },

    #[error("Node {node} timed out")]
    Timeout { node: String },

    #[error("Execution cancelled")]
    Cancelled,

    // Construction errors
    #[error("Invalid graph: {0}")]
    Graph(#[from] GraphError),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ScrapeError {
    /// Create a transient error attributed to a collaborator.
    pub fn transient(collaborator: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            collaborator: collaborator.into(),
            message: message.into(),
        }
    }

    /// Whether a bounded retry may succeed where this attempt failed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient { .. } => true,
            Self::LlmRequest(msg) => {
                msg.contains("429")
                    || msg.contains("500")
                    || msg.contains("502")
                    || msg.contains("503")
                    || msg.contains("timeout")
                    || msg.contains("connection")
            }
            _ => false,
        }
    }
}

/// Topology errors detected while building a graph, before any execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("graph has no nodes")]
    Empty,

    #[error("duplicate node name '{0}'")]
    DuplicateNode(String),

    #[error("entry node '{0}' does not exist")]
    MissingEntry(String),

    #[error("entry node '{entry}' has an incoming edge from '{from}'")]
    EntryHasIncoming { entry: String, from: String },

    #[error("edge {from} -> {to} references unknown node '{missing}'")]
    UnknownEndpoint {
        from: String,
        to: String,
        missing: String,
    },

    #[error("edge {from} -> {to} has an invalid condition '{expr}'")]
    InvalidCondition {
        from: String,
        to: String,
        expr: String,
    },

    #[error("loop edge {from} -> {to} must allow at least one iteration")]
    ZeroIterationLoop { from: String, to: String },

    #[error("nodes unreachable from entry: {}", .0.join(", "))]
    Unreachable(Vec<String>),

    #[error("node '{node}' has an invalid input expression '{expr}': {reason}")]
    InvalidInputExpr {
        node: String,
        expr: String,
        reason: String,
    },

    #[error("no upstream path of node '{node}' produces its input '{requirement}'")]
    UnsatisfiedInput { node: String, requirement: String },

    #[error("unbounded cycle: {}", .0.join(" -> "))]
    UnboundedCycle(Vec<String>),

    #[error("merge node '{node}': {reason}")]
    MisplacedMerge { node: String, reason: String },
}

pub type Result<T> = std::result::Result<T, ScrapeError>;
