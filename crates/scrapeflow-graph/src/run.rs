use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use scrapeflow_core::config::AppConfig;
use scrapeflow_core::error::Result;
use scrapeflow_core::event::EventBus;

use crate::batch::{BatchCoordinator, BatchResult};
use crate::graph::executor::{Execution, ExecutionStatus, Executor};
use crate::graph::record::ExecutionRecord;
use crate::graph::state::{StateContainer, StateValue};
use crate::graph::topology::Graph;
use crate::nodes::Collaborators;
use crate::pipelines;

/// One source or many.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sources {
    Single(String),
    Many(Vec<String>),
}

impl From<&str> for Sources {
    fn from(source: &str) -> Self {
        Self::Single(source.to_string())
    }
}

impl From<String> for Sources {
    fn from(source: String) -> Self {
        Self::Single(source)
    }
}

impl From<Vec<String>> for Sources {
    fn from(sources: Vec<String>) -> Self {
        Self::Many(sources)
    }
}

/// User-facing status of a single-source run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReportStatus {
    Clean,
    Degraded,
    Failed { reason: String },
}

/// Answer of a single-source run.
#[derive(Debug, Clone, Serialize)]
pub struct AnswerReport {
    pub status: ReportStatus,
    /// The validated answer. `None` only together with a failed status.
    pub answer: Option<Value>,
    pub record: ExecutionRecord,
}

impl From<Execution> for AnswerReport {
    fn from(execution: Execution) -> Self {
        let answer = match execution.answer() {
            Some(StateValue::Error(_)) | None => None,
            Some(value) => Some(value.to_json()),
        };
        let status = match execution.status {
            ExecutionStatus::Failed(ref marker) => ReportStatus::Failed {
                reason: format!("{} at {}: {}", marker.kind.as_str(), marker.node, marker.message),
            },
            _ if answer.is_none() => ReportStatus::Failed {
                reason: missing_answer_reason(&execution.record),
            },
            ExecutionStatus::Succeeded => ReportStatus::Clean,
            ExecutionStatus::Degraded => ReportStatus::Degraded,
        };
        Self {
            status,
            answer,
            record: execution.record,
        }
    }
}

/// Why a run that reached a terminal node has nothing to show.
fn missing_answer_reason(record: &ExecutionRecord) -> String {
    let soft: Vec<String> = record
        .soft_failures()
        .map(|e| {
            format!(
                "soft_failure at {}: {}",
                e.node,
                e.message.as_deref().unwrap_or("no message")
            )
        })
        .collect();
    if soft.is_empty() {
        "no answer produced".to_string()
    } else {
        soft.join("; ")
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum RunResult {
    Single(AnswerReport),
    Batch(BatchResult),
}

/// Single entry point: prompt plus one or many sources in, answers out.
///
/// A single source runs the per-source graph once; many sources go through
/// the [`BatchCoordinator`] with the batch graph, which carries the merge
/// node.
pub struct Scraper {
    executor: Executor,
    graph: Arc<Graph>,
    batch_graph: Arc<Graph>,
}

impl Scraper {
    /// Scraper running the smart scraper pipeline, merged for batches.
    pub fn new(config: Arc<AppConfig>, collaborators: Arc<Collaborators>) -> Result<Self> {
        let graph = pipelines::smart_scraper(&config)?;
        let batch_graph = pipelines::multi_scraper(&config)?;
        Ok(Self {
            executor: Executor::new(config, collaborators),
            graph: Arc::new(graph),
            batch_graph: Arc::new(batch_graph),
        })
    }

    /// Use custom graphs instead of the prebuilt ones.
    pub fn with_graphs(mut self, graph: Graph, batch_graph: Graph) -> Self {
        self.graph = Arc::new(graph);
        self.batch_graph = Arc::new(batch_graph);
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.executor = self.executor.with_events(events);
        self
    }

    pub async fn run(&self, prompt: &str, sources: impl Into<Sources>) -> RunResult {
        self.run_with_cancel(prompt, sources, &CancellationToken::new())
            .await
    }

    pub async fn run_with_cancel(
        &self,
        prompt: &str,
        sources: impl Into<Sources>,
        cancel: &CancellationToken,
    ) -> RunResult {
        let initial = StateContainer::from_pairs([("user_prompt", prompt)]);
        match sources.into() {
            Sources::Single(source) => {
                let mut state = initial;
                state.set("source", source.as_str());
                let execution = self.executor.execute(&self.graph, &source, state, cancel).await;
                RunResult::Single(execution.into())
            }
            Sources::Many(sources) => {
                let batch = BatchCoordinator::new(self.executor.clone());
                RunResult::Batch(batch.run(&self.batch_graph, &sources, &initial, cancel).await)
            }
        }
    }
}
