//! Flowchart graph model.
//!
//! A flowchart is a directed graph of typed nodes and typed edges. This
//! module holds the definition types and the compiled [`FlowchartGraph`]:
//! nodes and edges stored in arrays with adjacency maps for O(1) lookup,
//! validated for duplicate ids, dangling edges, multiple starts, and
//! cycles.

mod graph;
mod model;

pub use graph::{EdgeIndex, FlowchartGraph, GraphError, NodeIndex};
pub use model::{
    ConditionOperator, DecisionCondition, Edge, Flowchart, Node, NodeType, RoutingMode,
    RuntimeClass,
};
