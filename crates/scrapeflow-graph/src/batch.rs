use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use scrapeflow_core::event::GraphEvent;

use crate::graph::executor::{Execution, ExecutionStatus, Executor};
use crate::graph::node::Node;
use crate::graph::record::RecordEntry;
use crate::graph::state::{StateContainer, StateValue};
use crate::graph::topology::Graph;
use crate::nodes::{run_node, NodeContext};

/// One source of a batch and how its execution ended.
#[derive(Debug, Clone, Serialize)]
pub struct BatchEntry {
    pub source: String,
    pub execution: Execution,
}

/// Every source's execution, in source order, plus the merged answer when
/// the graph has a merge node.
#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub entries: Vec<BatchEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merged: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge_record: Option<RecordEntry>,
}

impl BatchResult {
    pub fn get(&self, source: &str) -> Option<&Execution> {
        self.entries
            .iter()
            .find(|e| e.source == source)
            .map(|e| &e.execution)
    }

    pub fn failed(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.execution.status.is_failed())
            .count()
    }
}

/// The record a source contributes to the merge input.
///
/// `{source, status, state, output_key?, answer?, error?}`: `state` is the
/// full terminal state, `answer` the execution's terminal output (see
/// [`Execution::terminal_output`]). A failed execution, or a terminal
/// output left as an error marker, yields `error` instead of `answer`.
pub fn result_record(execution: &Execution, graph: &Graph) -> Value {
    let mut record = json!({
        "source": execution.source,
        "status": execution.status.label(),
        "state": execution.state.to_json(),
    });
    if let ExecutionStatus::Failed(ref marker) = execution.status {
        record["error"] = json!({
            "node": marker.node,
            "kind": marker.kind.as_str(),
            "message": marker.message,
        });
        return record;
    }
    if let Some((key, output)) = execution.terminal_output(graph) {
        record["output_key"] = json!(key);
        match output {
            StateValue::Error(marker) => {
                record["error"] = json!({
                    "node": marker.origin,
                    "kind": marker.kind,
                    "message": marker.message,
                });
            }
            value => record["answer"] = value.to_json(),
        }
    }
    record
}

/// Fans one graph out across many sources.
///
/// Each source gets its own execution and state container; at most
/// `concurrency_limit` executions run at once. A failing source never
/// affects the others.
pub struct BatchCoordinator {
    executor: Executor,
    concurrency_limit: usize,
}

impl BatchCoordinator {
    pub fn new(executor: Executor) -> Self {
        let concurrency_limit = executor.config().concurrency_limit.max(1);
        Self {
            executor,
            concurrency_limit,
        }
    }

    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit.max(1);
        self
    }

    /// Execute `graph` once per source, then run the merge node (if any)
    /// once over all terminal states.
    ///
    /// `initial` is copied into every execution with `source` set to that
    /// execution's source.
    pub async fn run(
        &self,
        graph: &Graph,
        sources: &[String],
        initial: &StateContainer,
        cancel: &CancellationToken,
    ) -> BatchResult {
        let start = Instant::now();
        let semaphore = Arc::new(Semaphore::new(self.concurrency_limit));
        info!(
            sources = sources.len(),
            concurrency_limit = self.concurrency_limit,
            "Starting batch"
        );

        let futs: Vec<_> = sources
            .iter()
            .map(|source| {
                let semaphore = semaphore.clone();
                let mut state = initial.clone();
                state.set("source", source.as_str());
                async move {
                    // Held until the execution finishes
                    let _permit = semaphore.acquire().await;
                    let execution = self.executor.execute(graph, source, state, cancel).await;
                    BatchEntry {
                        source: source.clone(),
                        execution,
                    }
                }
            })
            .collect();
        let entries: Vec<BatchEntry> = futures::future::join_all(futs).await;

        let mut result = BatchResult {
            entries,
            merged: None,
            merge_record: None,
        };
        if let Some(node) = graph.merge_node() {
            let (merged, record) = self.merge(graph, node, &result.entries, initial).await;
            result.merged = merged;
            result.merge_record = Some(record);
        }

        let failed = result.failed();
        info!(
            sources = sources.len(),
            failed,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Batch finished"
        );
        self.executor.publish(GraphEvent::BatchFinished {
            sources: sources.len(),
            failed,
        });
        result
    }

    async fn merge(
        &self,
        graph: &Graph,
        node: &Node,
        entries: &[BatchEntry],
        initial: &StateContainer,
    ) -> (Option<Value>, RecordEntry) {
        let start = Instant::now();
        let results: Vec<StateValue> = entries
            .iter()
            .map(|e| StateValue::Record(result_record(&e.execution, graph)))
            .collect();
        let mut state = StateContainer::new();
        state.set("results", results);
        if let Some(prompt) = initial.get("user_prompt") {
            state.set("user_prompt", prompt.clone());
        }

        let inputs = node
            .inputs
            .resolve(&|key| state.has(key))
            .unwrap_or_else(|| vec!["results".to_string()]);
        let ctx = NodeContext {
            config: self.executor.config(),
            collaborators: self.executor.collaborators(),
        };
        let run = run_node(node, &inputs, &state, &ctx).await;
        if let Some(message) = run.outcome.message() {
            warn!(node = %node.name, message, "Merge degraded");
        }

        let merged = run.delta.get(node.output(0)).map(StateValue::to_json);
        let record = RecordEntry {
            node: node.name.clone(),
            attempts: 1,
            elapsed_ms: start.elapsed().as_millis() as u64,
            outcome: run.outcome.label().to_string(),
            message: run.outcome.message().map(str::to_string),
            attempt_errors: vec![],
        };
        (merged, record)
    }
}
