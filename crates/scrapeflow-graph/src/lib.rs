pub mod batch;
pub mod chunk;
pub mod graph;
pub mod nodes;
pub mod output_validator;
pub mod pipelines;
pub mod run;
pub mod schema;

pub use batch::{BatchCoordinator, BatchEntry, BatchResult};
pub use graph::{
    Edge, EdgeCondition, Execution, ExecutionRecord, ExecutionStatus, Executor, FailureKind,
    Graph, GraphBuilder, GraphDefinition, Node, NodeKind, StateContainer, StateValue,
};
pub use nodes::{concatenate_answers, run_node, Collaborators, NodeContext};
pub use output_validator::{OutputCleaner, OutputValidator};
pub use run::{AnswerReport, ReportStatus, RunResult, Scraper, Sources};
