//! DAG workflow engine for the agent mesh.
//!
//! - [`graph`] - typed nodes and edges over string ids, validation, and a
//!   fluent builder
//! - [`executor`] - async execution with parallel fan-out/fan-in,
//!   conditional and fallback dispatch, checkpoints, and deadlines

pub mod executor;
pub mod graph;

pub use executor::{
    ExecutionResult, NodeStats, ServiceInvoker, WorkflowExecutor, WorkflowState,
};
pub use graph::{
    AggregationStrategy, EdgeCondition, EdgeContext, EdgeType, NodeType, WorkflowBuilder,
    WorkflowEdge, WorkflowGraph, WorkflowNode, END_NODE, START_NODE,
};
