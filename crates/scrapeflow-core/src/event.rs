use serde::Serialize;

use crate::types::RunId;

/// Execution telemetry published while graphs run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GraphEvent {
    NodeStarted {
        run_id: RunId,
        source: String,
        node: String,
        attempt: u32,
    },
    NodeFinished {
        run_id: RunId,
        source: String,
        node: String,
        outcome: String,
        elapsed_ms: u64,
    },
    ExecutionFinished {
        run_id: RunId,
        source: String,
        status: String,
    },
    BatchFinished {
        sources: usize,
        failed: usize,
    },
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<GraphEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: GraphEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<GraphEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
