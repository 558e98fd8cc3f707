use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use scrapeflow_core::types::RunId;

/// Audit trail of one source execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub run_id: RunId,
    pub source: String,
    pub started_at: DateTime<Utc>,
    /// One entry per node visit, in execution order.
    pub entries: Vec<RecordEntry>,
    /// At least one node soft-failed.
    pub degraded: bool,
    pub total_elapsed_ms: u64,
}

/// Result of one node visit, retries included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordEntry {
    pub node: String,
    pub attempts: u32,
    pub elapsed_ms: u64,
    /// `success`, `soft_failure`, `fatal`, `timeout`, `cancelled` or `missing_input`.
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Errors of attempts that were retried.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempt_errors: Vec<String>,
}

impl ExecutionRecord {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            run_id: RunId::new(),
            source: source.into(),
            started_at: Utc::now(),
            entries: vec![],
            degraded: false,
            total_elapsed_ms: 0,
        }
    }

    pub fn push(&mut self, entry: RecordEntry) {
        if entry.outcome == "soft_failure" {
            self.degraded = true;
        }
        self.entries.push(entry);
    }

    /// Node names in the order they ran.
    pub fn node_order(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.node.as_str()).collect()
    }

    /// Most recent entry for `node`.
    pub fn entry(&self, node: &str) -> Option<&RecordEntry> {
        self.entries.iter().rev().find(|e| e.node == node)
    }

    pub fn soft_failures(&self) -> impl Iterator<Item = &RecordEntry> {
        self.entries.iter().filter(|e| e.outcome == "soft_failure")
    }
}
