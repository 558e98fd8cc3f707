use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use scrapeflow_core::config::AppConfig;
use scrapeflow_core::event::{EventBus, GraphEvent};
use scrapeflow_core::types::RunId;

use super::edge::status_key;
use super::node::{Node, NodeOutcome, NodeRun, RetryPolicy};
use super::record::{ExecutionRecord, RecordEntry};
use super::state::{StateContainer, StateDelta, StateValue};
use super::topology::{Graph, LoopCounts};
use crate::nodes::{run_node, Collaborators, NodeContext};

/// Why an execution stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Fatal,
    Timeout,
    Cancelled,
    MissingInput,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fatal => "fatal",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::MissingInput => "missing_input",
        }
    }
}

/// The node an execution failed at, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureMarker {
    pub node: String,
    pub kind: FailureKind,
    pub message: String,
}

/// Terminal outcome of one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionStatus {
    Succeeded,
    /// Reached a terminal node with at least one soft failure on the way.
    Degraded,
    Failed(FailureMarker),
}

impl ExecutionStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Degraded => "degraded",
            Self::Failed(_) => "failed",
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    pub fn failure(&self) -> Option<&FailureMarker> {
        match self {
            Self::Failed(marker) => Some(marker),
            _ => None,
        }
    }
}

/// One finished execution of a graph over one source.
///
/// On failure `state` holds everything written up to the last node that
/// did not fail fatally.
#[derive(Debug, Clone, Serialize)]
pub struct Execution {
    pub source: String,
    pub status: ExecutionStatus,
    pub state: StateContainer,
    pub record: ExecutionRecord,
}

impl Execution {
    pub fn answer(&self) -> Option<&StateValue> {
        self.state.get("answer")
    }

    /// The value this execution ended with: the first declared output of
    /// the most recently run node that is present in the state, falling
    /// back to `answer`.
    pub fn terminal_output<'a>(&'a self, graph: &'a Graph) -> Option<(&'a str, &'a StateValue)> {
        self.record
            .entries
            .iter()
            .rev()
            .filter_map(|entry| graph.node(&entry.node))
            .flat_map(|node| node.outputs.iter())
            .find_map(|key| self.state.get(key).map(|value| (key.as_str(), value)))
            .or_else(|| self.answer().map(|value| ("answer", value)))
    }
}

enum Interrupt {
    Timeout,
    Cancelled,
}

#[derive(Default)]
struct Attempts {
    count: u32,
    errors: Vec<String>,
}

fn calculate_backoff(attempt: u32, policy: &RetryPolicy) -> Duration {
    let ms = policy
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(policy.max_backoff_ms);
    // Add jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

/// Run `fut` unless the token fires or the deadline passes first.
async fn guarded<F: Future>(
    cancel: &CancellationToken,
    deadline: Option<Instant>,
    fut: F,
) -> Result<F::Output, Interrupt> {
    let bounded = async move {
        match deadline {
            Some(at) => tokio::time::timeout_at(at, fut)
                .await
                .map_err(|_| Interrupt::Timeout),
            None => Ok(fut.await),
        }
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Interrupt::Cancelled),
        result = bounded => result,
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

/// Walks a [`Graph`] for one source, strictly sequentially.
///
/// The executor owns nothing per execution: every call to [`execute`]
/// gets its own state, record and loop counters, so one executor is
/// shared by all executions of a batch.
///
/// [`execute`]: Executor::execute
#[derive(Clone)]
pub struct Executor {
    config: Arc<AppConfig>,
    collaborators: Arc<Collaborators>,
    events: Option<Arc<EventBus>>,
}

impl Executor {
    pub fn new(config: Arc<AppConfig>, collaborators: Arc<Collaborators>) -> Self {
        Self {
            config,
            collaborators,
            events: None,
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    pub(crate) fn publish(&self, event: GraphEvent) {
        if let Some(ref events) = self.events {
            events.publish(event);
        }
    }

    /// Execute `graph` from its entry node over `state`.
    ///
    /// Never returns an error: every way an execution can end is a
    /// terminal [`ExecutionStatus`]. The per-source deadline from the
    /// configuration covers the whole walk, retries and backoff included.
    pub async fn execute(
        &self,
        graph: &Graph,
        source: &str,
        mut state: StateContainer,
        cancel: &CancellationToken,
    ) -> Execution {
        let start = Instant::now();
        let deadline = self.config.source_timeout().map(|timeout| start + timeout);
        let mut record = ExecutionRecord::new(source);
        let run_id = record.run_id;
        let ctx = NodeContext {
            config: &self.config,
            collaborators: &self.collaborators,
        };
        let mut loops = LoopCounts::new();
        let mut current = graph.entry().to_string();

        info!(run_id = %run_id, source, entry = %current, "Starting execution");

        let status = loop {
            let Some(node) = graph.node(&current) else {
                break ExecutionStatus::Failed(FailureMarker {
                    node: current.clone(),
                    kind: FailureKind::Fatal,
                    message: "node not found in graph".to_string(),
                });
            };

            let early = if cancel.is_cancelled() {
                Some((FailureKind::Cancelled, "execution cancelled".to_string()))
            } else if deadline.is_some_and(|at| Instant::now() >= at) {
                Some((FailureKind::Timeout, "source deadline exceeded".to_string()))
            } else {
                None
            };
            if let Some((kind, message)) = early {
                record.push(RecordEntry {
                    node: node.name.clone(),
                    attempts: 0,
                    elapsed_ms: 0,
                    outcome: kind.as_str().to_string(),
                    message: Some(message.clone()),
                    attempt_errors: vec![],
                });
                break self.fail(node, kind, message);
            }

            let Some(inputs) = node.inputs.resolve(&|key| state.has(key)) else {
                let message = format!("required input '{}' not in state", node.inputs);
                record.push(RecordEntry {
                    node: node.name.clone(),
                    attempts: 0,
                    elapsed_ms: 0,
                    outcome: FailureKind::MissingInput.as_str().to_string(),
                    message: Some(message.clone()),
                    attempt_errors: vec![],
                });
                break self.fail(node, FailureKind::MissingInput, message);
            };

            debug!(run_id = %run_id, node = %node.name, inputs = ?inputs, "Running node");
            let node_start = Instant::now();
            let (result, attempts) = self
                .run_with_retry(node, &inputs, &state, &ctx, deadline, cancel, run_id, source)
                .await;
            let elapsed = elapsed_ms(node_start);

            let run = match result {
                Ok(run) => run,
                Err(interrupt) => {
                    let (kind, message) = match interrupt {
                        Interrupt::Timeout => (FailureKind::Timeout, "source deadline exceeded"),
                        Interrupt::Cancelled => (FailureKind::Cancelled, "execution cancelled"),
                    };
                    self.finish_node(run_id, source, &node.name, kind.as_str(), elapsed);
                    record.push(RecordEntry {
                        node: node.name.clone(),
                        attempts: attempts.count,
                        elapsed_ms: elapsed,
                        outcome: kind.as_str().to_string(),
                        message: Some(message.to_string()),
                        attempt_errors: attempts.errors,
                    });
                    break self.fail(node, kind, message.to_string());
                }
            };

            let label = run.outcome.label();
            self.finish_node(run_id, source, &node.name, label, elapsed);
            record.push(RecordEntry {
                node: node.name.clone(),
                attempts: attempts.count,
                elapsed_ms: elapsed,
                outcome: label.to_string(),
                message: run.outcome.message().map(str::to_string),
                attempt_errors: attempts.errors,
            });

            match run.outcome {
                NodeOutcome::Fatal(message) => {
                    break self.fail(node, FailureKind::Fatal, message);
                }
                NodeOutcome::SoftFailure(ref message) => {
                    warn!(run_id = %run_id, node = %node.name, message = %message, "Node soft-failed");
                    state.apply(run.delta);
                    state.set(status_key(&node.name), label);
                }
                NodeOutcome::Success | NodeOutcome::Retryable(_) => {
                    state.apply(run.delta);
                    state.set(status_key(&node.name), label);
                }
            }

            match graph.resolve(&current, &state, &mut loops) {
                Some(next) => current = next.to_string(),
                None if record.degraded => break ExecutionStatus::Degraded,
                None => break ExecutionStatus::Succeeded,
            }
        };

        record.total_elapsed_ms = elapsed_ms(start);
        match &status {
            ExecutionStatus::Failed(marker) => error!(
                run_id = %run_id,
                source,
                node = %marker.node,
                kind = marker.kind.as_str(),
                message = %marker.message,
                "Execution failed"
            ),
            other => info!(
                run_id = %run_id,
                source,
                status = other.label(),
                nodes = record.entries.len(),
                elapsed_ms = record.total_elapsed_ms,
                "Execution finished"
            ),
        }
        self.publish(GraphEvent::ExecutionFinished {
            run_id,
            source: source.to_string(),
            status: status.label().to_string(),
        });

        Execution {
            source: source.to_string(),
            status,
            state,
            record,
        }
    }

    fn fail(&self, node: &Node, kind: FailureKind, message: String) -> ExecutionStatus {
        ExecutionStatus::Failed(FailureMarker {
            node: node.name.clone(),
            kind,
            message,
        })
    }

    fn finish_node(&self, run_id: RunId, source: &str, node: &str, outcome: &str, elapsed_ms: u64) {
        debug!(run_id = %run_id, node, outcome, elapsed_ms, "Node finished");
        self.publish(GraphEvent::NodeFinished {
            run_id,
            source: source.to_string(),
            node: node.to_string(),
            outcome: outcome.to_string(),
            elapsed_ms,
        });
    }

    /// Run one node, retrying transient failures in place.
    ///
    /// The returned run is never `Retryable`: with a policy it becomes
    /// fatal once the retries are used up, without one it is downgraded
    /// to a soft failure.
    #[allow(clippy::too_many_arguments)]
    async fn run_with_retry(
        &self,
        node: &Node,
        inputs: &[String],
        state: &StateContainer,
        ctx: &NodeContext<'_>,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
        run_id: RunId,
        source: &str,
    ) -> (Result<NodeRun, Interrupt>, Attempts) {
        let mut attempts = Attempts::default();
        loop {
            attempts.count += 1;
            self.publish(GraphEvent::NodeStarted {
                run_id,
                source: source.to_string(),
                node: node.name.clone(),
                attempt: attempts.count,
            });

            let run = match guarded(cancel, deadline, run_node(node, inputs, state, ctx)).await {
                Ok(run) => run,
                Err(interrupt) => return (Err(interrupt), attempts),
            };
            let message = match &run.outcome {
                NodeOutcome::Retryable(message) => message.clone(),
                _ => return (Ok(run), attempts),
            };

            match node.retry {
                Some(policy) if attempts.count <= policy.max_retries => {
                    let backoff = calculate_backoff(attempts.count - 1, &policy);
                    warn!(
                        run_id = %run_id,
                        node = %node.name,
                        attempt = attempts.count,
                        max_retries = policy.max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %message,
                        "Retrying node"
                    );
                    attempts.errors.push(message);
                    if let Err(interrupt) =
                        guarded(cancel, deadline, tokio::time::sleep(backoff)).await
                    {
                        return (Err(interrupt), attempts);
                    }
                }
                Some(policy) => {
                    let exhausted = NodeRun {
                        delta: StateDelta::new(),
                        outcome: NodeOutcome::Fatal(format!(
                            "retries exhausted after {} attempts: {}",
                            policy.max_retries + 1,
                            message
                        )),
                    };
                    attempts.errors.push(message);
                    return (Ok(exhausted), attempts);
                }
                None => {
                    let soft = NodeRun {
                        delta: run.delta,
                        outcome: NodeOutcome::SoftFailure(message),
                    };
                    return (Ok(soft), attempts);
                }
            }
        }
    }
}
