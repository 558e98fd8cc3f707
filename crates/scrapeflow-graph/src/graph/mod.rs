//! Graph execution engine.
//!
//! A pipeline is a validated [`Graph`] of [`Node`]s connected by [`Edge`]s.
//! Nodes communicate only through a [`StateContainer`]; edges are data
//! (always, on-success, on-failure, key present/absent, condition
//! expression, bounded loop) resolved in declared order.
//!
//! The [`Executor`] walks the graph from the entry node for one source,
//! applying each node's delta, retrying transient failures in place, and
//! records every visit in an [`ExecutionRecord`].

pub mod edge;
pub mod executor;
pub mod input;
pub mod node;
pub mod record;
pub mod state;
pub mod topology;

pub use edge::{Edge, EdgeCondition};
pub use executor::{Execution, ExecutionStatus, Executor, FailureKind, FailureMarker};
pub use input::InputExpr;
pub use node::{Node, NodeKind, NodeOutcome, NodeRun, RetryPolicy};
pub use record::{ExecutionRecord, RecordEntry};
pub use state::{ErrorMarker, StateContainer, StateDelta, StateValue};
pub use topology::{Graph, GraphBuilder, GraphDefinition};
