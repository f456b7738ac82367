//! Node input assembly.
//!
//! Context is the concatenation of predecessor `output_state` documents in
//! stable predecessor order (topological rank, then node id). Attachments
//! propagate only along attachment-carrying edges; each succeeded
//! predecessor contributes the `attachments` array of its output state.

use std::collections::HashMap;

use serde_json::Value;

use crate::flowchart::{FlowchartGraph, NodeIndex};

/// Assembled input for one node.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AssembledInput {
    /// Concatenated predecessor output, blank-line separated.
    pub context: String,
    /// Attachment references, deduplicated in arrival order.
    pub attachments: Vec<String>,
}

/// Assemble a node's input from its predecessors' outputs.
pub fn assemble_input(
    graph: &FlowchartGraph,
    node: NodeIndex,
    outputs: &HashMap<NodeIndex, Value>,
) -> AssembledInput {
    let mut context_parts = Vec::new();
    let mut attachments = Vec::new();

    for pred in graph.stable_predecessors(node) {
        let Some(output) = outputs.get(&pred) else {
            continue;
        };
        let carries_context = graph
            .incoming(node)
            .iter()
            .filter(|&&e| graph.index_of(&graph.edge(e).from) == Some(pred))
            .any(|&e| graph.edge(e).routing_mode.carries_context());
        let carries_attachments = graph
            .incoming(node)
            .iter()
            .filter(|&&e| graph.index_of(&graph.edge(e).from) == Some(pred))
            .any(|&e| graph.edge(e).routing_mode.carries_attachments());

        if carries_context {
            let rendered = match output {
                Value::String(text) => text.clone(),
                other => serde_json::to_string_pretty(other).unwrap_or_default(),
            };
            if !rendered.trim().is_empty() {
                context_parts.push(rendered);
            }
        }
        if carries_attachments
            && let Some(refs) = output.get("attachments").and_then(Value::as_array)
        {
            for item in refs {
                if let Some(reference) = item.as_str()
                    && !attachments.iter().any(|a| a == reference)
                {
                    attachments.push(reference.to_string());
                }
            }
        }
    }

    AssembledInput {
        context: context_parts.join("\n\n"),
        attachments,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flowchart::{Edge, Flowchart, Node, NodeType, RoutingMode};
    use serde_json::json;

    fn graph() -> FlowchartGraph {
        FlowchartGraph::compile(&Flowchart {
            id: "f".to_string(),
            name: String::new(),
            nodes: vec![
                Node::new("start", NodeType::Start),
                Node::new("zeta", NodeType::Task),
                Node::new("alpha", NodeType::Task),
                Node::new("files", NodeType::Task),
                Node::new("sink", NodeType::Task),
            ],
            edges: vec![
                Edge::trigger("e1", "start", "zeta"),
                Edge::trigger("e2", "start", "alpha"),
                Edge::trigger("e3", "start", "files"),
                Edge::trigger("e4", "zeta", "sink"),
                Edge::trigger("e5", "alpha", "sink"),
                Edge::trigger("e6", "files", "sink")
                    .with_mode(RoutingMode::AttachmentsOnly),
            ],
        })
        .unwrap()
    }

    #[test]
    fn context_in_stable_order() {
        let graph = graph();
        let sink = graph.index_of("sink").unwrap();
        let mut outputs = HashMap::new();
        outputs.insert(graph.index_of("zeta").unwrap(), json!("from zeta"));
        outputs.insert(graph.index_of("alpha").unwrap(), json!("from alpha"));

        let input = assemble_input(&graph, sink, &outputs);
        // Same rank, lexicographic tie-break: alpha before zeta.
        assert_eq!(input.context, "from alpha\n\nfrom zeta");
    }

    #[test]
    fn attachments_only_edge_contributes_no_context() {
        let graph = graph();
        let sink = graph.index_of("sink").unwrap();
        let mut outputs = HashMap::new();
        outputs.insert(
            graph.index_of("files").unwrap(),
            json!({"summary": "ignored", "attachments": ["s3://bucket/a.pdf", "s3://bucket/b.pdf"]}),
        );

        let input = assemble_input(&graph, sink, &outputs);
        assert!(input.context.is_empty());
        assert_eq!(
            input.attachments,
            vec!["s3://bucket/a.pdf".to_string(), "s3://bucket/b.pdf".to_string()]
        );
    }

    #[test]
    fn structured_output_renders_as_json() {
        let graph = graph();
        let sink = graph.index_of("sink").unwrap();
        let mut outputs = HashMap::new();
        outputs.insert(graph.index_of("alpha").unwrap(), json!({"x": 1}));

        let input = assemble_input(&graph, sink, &outputs);
        assert!(input.context.contains("\"x\": 1"));
    }

    #[test]
    fn missing_predecessor_output_is_skipped() {
        let graph = graph();
        let sink = graph.index_of("sink").unwrap();
        let input = assemble_input(&graph, sink, &HashMap::new());
        assert_eq!(input, AssembledInput::default());
    }

    #[test]
    fn duplicate_attachments_deduplicated() {
        let graph = graph();
        let sink = graph.index_of("sink").unwrap();
        let mut outputs = HashMap::new();
        outputs.insert(
            graph.index_of("files").unwrap(),
            json!({"attachments": ["s3://x", "s3://x"]}),
        );
        let input = assemble_input(&graph, sink, &outputs);
        assert_eq!(input.attachments, vec!["s3://x".to_string()]);
    }
}
