//! Compiled flowchart graph with adjacency maps and validation.
//!
//! The builder validates the definition and produces index-based adjacency
//! so the orchestrator walks the graph without pointer cycles or repeated
//! id lookups. Cycle detection uses Kahn's algorithm; the topological rank
//! it computes is reused for stable predecessor ordering.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use super::model::{Edge, Flowchart, Node, NodeType};

/// Index into the node array.
pub type NodeIndex = usize;

/// Index into the edge array.
pub type EdgeIndex = usize;

/// Validation failures for a flowchart definition.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("Duplicate node id: {0}")]
    DuplicateNodeId(String),

    #[error("Duplicate edge id: {0}")]
    DuplicateEdgeId(String),

    #[error("Edge {edge_id} references unknown node {node_id}")]
    UnknownEndpoint { edge_id: String, node_id: String },

    #[error("Flowchart has more than one start node: {0} and {1}")]
    MultipleStartNodes(String, String),

    #[error("Cycle detected involving nodes: {0:?}")]
    Cycle(Vec<String>),
}

/// A validated flowchart with O(1) adjacency lookups.
#[derive(Debug)]
pub struct FlowchartGraph {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    node_index: HashMap<String, NodeIndex>,
    /// node -> outgoing edge indices
    outgoing: Vec<Vec<EdgeIndex>>,
    /// node -> incoming edge indices
    incoming: Vec<Vec<EdgeIndex>>,
    /// Kahn rank of each node; used to order predecessors stably.
    topo_rank: Vec<usize>,
    start: Option<NodeIndex>,
}

impl FlowchartGraph {
    /// Validate a definition and compile it into a graph.
    pub fn compile(flowchart: &Flowchart) -> Result<Self, GraphError> {
        let mut node_index = HashMap::new();
        let mut start: Option<NodeIndex> = None;

        for (i, node) in flowchart.nodes.iter().enumerate() {
            if node_index.insert(node.id.clone(), i).is_some() {
                return Err(GraphError::DuplicateNodeId(node.id.clone()));
            }
            if node.node_type == NodeType::Start {
                if let Some(prev) = start {
                    return Err(GraphError::MultipleStartNodes(
                        flowchart.nodes[prev].id.clone(),
                        node.id.clone(),
                    ));
                }
                start = Some(i);
            }
        }

        let mut edge_ids = HashSet::new();
        let mut outgoing = vec![Vec::new(); flowchart.nodes.len()];
        let mut incoming = vec![Vec::new(); flowchart.nodes.len()];

        for (e, edge) in flowchart.edges.iter().enumerate() {
            if !edge_ids.insert(edge.id.as_str()) {
                return Err(GraphError::DuplicateEdgeId(edge.id.clone()));
            }
            let from = *node_index
                .get(&edge.from)
                .ok_or_else(|| GraphError::UnknownEndpoint {
                    edge_id: edge.id.clone(),
                    node_id: edge.from.clone(),
                })?;
            let to = *node_index
                .get(&edge.to)
                .ok_or_else(|| GraphError::UnknownEndpoint {
                    edge_id: edge.id.clone(),
                    node_id: edge.to.clone(),
                })?;
            outgoing[from].push(e);
            incoming[to].push(e);
        }

        let graph = Self {
            nodes: flowchart.nodes.clone(),
            edges: flowchart.edges.clone(),
            node_index,
            outgoing,
            incoming,
            topo_rank: Vec::new(),
            start,
        };
        graph.with_topo_rank()
    }

    /// Compute Kahn ranks, failing on cycles.
    fn with_topo_rank(mut self) -> Result<Self, GraphError> {
        let n = self.nodes.len();
        let mut in_degree: Vec<usize> = self.incoming.iter().map(Vec::len).collect();
        let mut rank = vec![0usize; n];
        let mut queue: Vec<NodeIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut processed = 0;
        let mut next_rank = 0;
        while !queue.is_empty() {
            let wave = std::mem::take(&mut queue);
            for node in wave {
                processed += 1;
                rank[node] = next_rank;
                for &e in &self.outgoing[node] {
                    let to = self.node_index[&self.edges[e].to];
                    in_degree[to] -= 1;
                    if in_degree[to] == 0 {
                        queue.push(to);
                    }
                }
            }
            next_rank += 1;
        }

        if processed != n {
            let cycle_nodes: Vec<String> = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .map(|(i, _)| self.nodes[i].id.clone())
                .collect();
            return Err(GraphError::Cycle(cycle_nodes));
        }

        self.topo_rank = rank;
        Ok(self)
    }

    /// Number of nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// All nodes.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// All edges.
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Look up a node index by id.
    pub fn index_of(&self, node_id: &str) -> Option<NodeIndex> {
        self.node_index.get(node_id).copied()
    }

    /// Node at an index.
    pub fn node(&self, index: NodeIndex) -> &Node {
        &self.nodes[index]
    }

    /// Edge at an index.
    pub fn edge(&self, index: EdgeIndex) -> &Edge {
        &self.edges[index]
    }

    /// The start node, if the flowchart declares one.
    pub fn start(&self) -> Option<NodeIndex> {
        self.start
    }

    /// Outgoing edge indices of a node.
    pub fn outgoing(&self, index: NodeIndex) -> &[EdgeIndex] {
        &self.outgoing[index]
    }

    /// Incoming edge indices of a node.
    pub fn incoming(&self, index: NodeIndex) -> &[EdgeIndex] {
        &self.incoming[index]
    }

    /// Topological rank of a node (nodes in the same Kahn wave share one).
    pub fn topo_rank(&self, index: NodeIndex) -> usize {
        self.topo_rank[index]
    }

    /// Predecessor node indices in stable order: topological rank first,
    /// lexicographic node id to break ties.
    pub fn stable_predecessors(&self, index: NodeIndex) -> Vec<NodeIndex> {
        let mut preds: Vec<NodeIndex> = self
            .incoming(index)
            .iter()
            .map(|&e| self.node_index[&self.edges[e].from])
            .collect();
        preds.sort_by(|&a, &b| {
            self.topo_rank[a]
                .cmp(&self.topo_rank[b])
                .then_with(|| self.nodes[a].id.cmp(&self.nodes[b].id))
        });
        preds.dedup();
        preds
    }

    /// Successor node indices reachable over activation-gating edges.
    pub fn trigger_successors(&self, index: NodeIndex) -> Vec<NodeIndex> {
        let mut out: Vec<NodeIndex> = self
            .outgoing(index)
            .iter()
            .filter(|&&e| self.edges[e].routing_mode.gates_activation())
            .map(|&e| self.node_index[&self.edges[e].to])
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flowchart::model::RoutingMode;

    fn node(id: &str, node_type: NodeType) -> Node {
        Node::new(id, node_type)
    }

    fn linear_chart() -> Flowchart {
        Flowchart {
            id: "f1".to_string(),
            name: String::new(),
            nodes: vec![
                node("start", NodeType::Start),
                node("a", NodeType::Task),
                node("end", NodeType::End),
            ],
            edges: vec![
                Edge::trigger("e1", "start", "a"),
                Edge::trigger("e2", "a", "end"),
            ],
        }
    }

    #[test]
    fn compile_linear_graph() {
        let graph = FlowchartGraph::compile(&linear_chart()).unwrap();
        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.start(), Some(0));
        let a = graph.index_of("a").unwrap();
        assert_eq!(graph.trigger_successors(graph.start().unwrap()), vec![a]);
    }

    #[test]
    fn duplicate_node_id_rejected() {
        let mut chart = linear_chart();
        chart.nodes.push(node("a", NodeType::Task));
        let err = FlowchartGraph::compile(&chart).unwrap_err();
        assert_eq!(err, GraphError::DuplicateNodeId("a".to_string()));
    }

    #[test]
    fn unknown_endpoint_rejected() {
        let mut chart = linear_chart();
        chart.edges.push(Edge::trigger("e3", "a", "ghost"));
        let err = FlowchartGraph::compile(&chart).unwrap_err();
        assert_eq!(
            err,
            GraphError::UnknownEndpoint {
                edge_id: "e3".to_string(),
                node_id: "ghost".to_string()
            }
        );
    }

    #[test]
    fn multiple_start_nodes_rejected() {
        let mut chart = linear_chart();
        chart.nodes.push(node("start2", NodeType::Start));
        assert!(matches!(
            FlowchartGraph::compile(&chart),
            Err(GraphError::MultipleStartNodes(_, _))
        ));
    }

    #[test]
    fn cycle_rejected() {
        let chart = Flowchart {
            id: "f".to_string(),
            name: String::new(),
            nodes: vec![
                node("a", NodeType::Task),
                node("b", NodeType::Task),
                node("c", NodeType::Task),
            ],
            edges: vec![
                Edge::trigger("e1", "a", "b"),
                Edge::trigger("e2", "b", "c"),
                Edge::trigger("e3", "c", "a"),
            ],
        };
        match FlowchartGraph::compile(&chart) {
            Err(GraphError::Cycle(nodes)) => assert_eq!(nodes.len(), 3),
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn stable_predecessors_order_by_rank_then_id() {
        // Diamond with an extra deep predecessor:
        //   start -> b, start -> a, a -> c, b -> join, a2 -> join (a2 after a)
        let chart = Flowchart {
            id: "f".to_string(),
            name: String::new(),
            nodes: vec![
                node("start", NodeType::Start),
                node("b", NodeType::Task),
                node("a", NodeType::Task),
                node("a2", NodeType::Task),
                node("join", NodeType::Task),
            ],
            edges: vec![
                Edge::trigger("e1", "start", "b"),
                Edge::trigger("e2", "start", "a"),
                Edge::trigger("e3", "a", "a2"),
                Edge::trigger("e4", "b", "join"),
                Edge::trigger("e5", "a2", "join"),
            ],
        };
        let graph = FlowchartGraph::compile(&chart).unwrap();
        let join = graph.index_of("join").unwrap();
        let preds: Vec<&str> = graph
            .stable_predecessors(join)
            .into_iter()
            .map(|i| graph.node(i).id.as_str())
            .collect();
        // b has rank 1, a2 has rank 2: rank order wins over id order.
        assert_eq!(preds, vec!["b", "a2"]);
    }

    #[test]
    fn stable_predecessors_tie_breaks_lexicographically() {
        let chart = Flowchart {
            id: "f".to_string(),
            name: String::new(),
            nodes: vec![
                node("start", NodeType::Start),
                node("zeta", NodeType::Task),
                node("alpha", NodeType::Task),
                node("join", NodeType::Task),
            ],
            edges: vec![
                Edge::trigger("e1", "start", "zeta"),
                Edge::trigger("e2", "start", "alpha"),
                Edge::trigger("e3", "zeta", "join"),
                Edge::trigger("e4", "alpha", "join"),
            ],
        };
        let graph = FlowchartGraph::compile(&chart).unwrap();
        let join = graph.index_of("join").unwrap();
        let preds: Vec<&str> = graph
            .stable_predecessors(join)
            .into_iter()
            .map(|i| graph.node(i).id.as_str())
            .collect();
        assert_eq!(preds, vec!["alpha", "zeta"]);
    }

    #[test]
    fn non_trigger_edges_do_not_appear_in_trigger_successors() {
        let chart = Flowchart {
            id: "f".to_string(),
            name: String::new(),
            nodes: vec![
                node("a", NodeType::Task),
                node("b", NodeType::Task),
                node("c", NodeType::Task),
            ],
            edges: vec![
                Edge::trigger("e1", "a", "b"),
                Edge::trigger("e2", "a", "c").with_mode(RoutingMode::ContextOnly),
            ],
        };
        let graph = FlowchartGraph::compile(&chart).unwrap();
        let a = graph.index_of("a").unwrap();
        let b = graph.index_of("b").unwrap();
        assert_eq!(graph.trigger_successors(a), vec![b]);
    }
}
