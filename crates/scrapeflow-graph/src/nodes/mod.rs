//! Kind-specific node steps.
//!
//! Each step is a thin adapter between the state container and one
//! collaborator. Steps return `Result<NodeRun>`; errors are classified by
//! [`NodeRun::from_error`] so collaborators only decide transient or not.

mod fetch;
mod generate_answer;
mod image_to_text;
mod merge;
mod parse;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use scrapeflow_core::config::AppConfig;
use scrapeflow_core::error::{Result, ScrapeError};
use scrapeflow_core::traits::{
    ContentParser, Fetcher, ImageDescriber, LlmClient, RateLimiter, RobotsPolicy,
};
use scrapeflow_core::types::Admission;

use crate::graph::node::{Node, NodeKind, NodeOutcome, NodeRun};
use crate::graph::state::{StateContainer, StateDelta, StateValue};

pub use merge::concatenate_answers;

/// External services the nodes delegate to. A node whose collaborator is
/// missing fails fatally.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub fetcher: Option<Arc<dyn Fetcher>>,
    pub parser: Option<Arc<dyn ContentParser>>,
    pub llm: Option<Arc<dyn LlmClient>>,
    pub describer: Option<Arc<dyn ImageDescriber>>,
    pub limiter: Option<Arc<dyn RateLimiter>>,
    pub robots: Option<Arc<dyn RobotsPolicy>>,
}

impl Collaborators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn with_parser(mut self, parser: Arc<dyn ContentParser>) -> Self {
        self.parser = Some(parser);
        self
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_describer(mut self, describer: Arc<dyn ImageDescriber>) -> Self {
        self.describer = Some(describer);
        self
    }

    pub fn with_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn with_robots(mut self, robots: Arc<dyn RobotsPolicy>) -> Self {
        self.robots = Some(robots);
        self
    }
}

/// What a node step gets besides the state.
pub struct NodeContext<'a> {
    pub config: &'a AppConfig,
    pub collaborators: &'a Collaborators,
}

impl NodeContext<'_> {
    /// Wait until the rate limiter admits `cost`. No limiter admits everything.
    pub async fn acquire(&self, cost: u32) {
        let Some(ref limiter) = self.collaborators.limiter else {
            return;
        };
        loop {
            match limiter.admit(cost) {
                Admission::Granted => return,
                Admission::Denied { retry_after } => {
                    debug!(cost, retry_after_ms = retry_after.as_millis() as u64, "Rate limited");
                    tokio::time::sleep(retry_after.max(Duration::from_millis(1))).await;
                }
            }
        }
    }
}

fn require<'a, T: ?Sized>(slot: &'a Option<Arc<T>>, name: &str) -> Result<&'a Arc<T>> {
    slot.as_ref()
        .ok_or_else(|| ScrapeError::MissingCollaborator(name.to_string()))
}

/// Text view of a state value used as collaborator input.
fn text_input(state: &StateContainer, key: &str) -> Option<String> {
    match state.get(key)? {
        StateValue::Error(_) => None,
        value => Some(value.to_text()),
    }
}

/// Optional input at `index`, if the node declares it and the state holds it.
fn optional<'a>(node: &'a Node, state: &'a StateContainer, index: usize) -> Option<&'a StateValue> {
    node.optional_inputs
        .get(index)
        .and_then(|key| state.get(key))
}

/// Run one attempt of `node` against `state`.
///
/// `inputs` are the required keys resolved by the executor, in expression
/// order.
pub async fn run_node(
    node: &Node,
    inputs: &[String],
    state: &StateContainer,
    ctx: &NodeContext<'_>,
) -> NodeRun {
    let result = match &node.kind {
        NodeKind::Fetch(params) => fetch::run(node, params, inputs, state, ctx).await,
        NodeKind::Parse(params) => parse::run(node, params, inputs, state, ctx),
        NodeKind::GenerateAnswer(params) => {
            generate_answer::run(node, params, inputs, state, ctx).await
        }
        NodeKind::ImageToText(params) => image_to_text::run(node, params, inputs, state, ctx).await,
        NodeKind::Merge(params) => Ok(merge::run(node, params, inputs, state, ctx).await),
        NodeKind::Conditional => Ok(NodeRun::success(StateDelta::new())),
    };

    match result {
        Ok(run) => run,
        Err(e) => {
            let run = NodeRun::from_error(&e);
            if matches!(run.outcome, NodeOutcome::Fatal(_)) {
                error!(node = %node.name, error = %e, "Node failed");
            }
            run
        }
    }
}
