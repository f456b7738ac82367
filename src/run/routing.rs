//! Routing state interpretation.
//!
//! The executor returns `routing_state` as part of a successful result;
//! this module parses it into the matched connector set. The strict
//! decision contract applies under runtime cutover: a decision result
//! without `matched_connector_ids` fails the node.

use serde::Deserialize;
use serde_json::Value;

use llmctl_contract::{ErrorCode, ErrorEnvelope};

use crate::flowchart::NodeType;

/// Parsed routing declaration.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RoutingState {
    /// Route keys of outgoing edges that should propagate activation.
    pub matched_connector_ids: Vec<String>,
}

#[derive(Deserialize)]
struct RoutingWire {
    matched_connector_ids: Option<Vec<String>>,
}

/// Parse a node's routing state.
///
/// Non-decision nodes may omit the field entirely (their edges fire
/// unconditionally). Decision nodes must declare the list; under cutover
/// its absence is an error, outside cutover it degrades to an empty set.
pub fn parse_routing_state(
    raw: &Value,
    node_type: NodeType,
    cutover_enabled: bool,
) -> Result<RoutingState, ErrorEnvelope> {
    let wire: RoutingWire = if raw.is_null() {
        RoutingWire {
            matched_connector_ids: None,
        }
    } else {
        serde_json::from_value(raw.clone()).map_err(|e| {
            ErrorEnvelope::new(
                ErrorCode::ValidationError,
                format!("malformed routing_state: {e}"),
            )
        })?
    };

    match wire.matched_connector_ids {
        Some(matched) => Ok(RoutingState {
            matched_connector_ids: matched,
        }),
        None if node_type == NodeType::Decision && cutover_enabled => Err(ErrorEnvelope::new(
            ErrorCode::ValidationError,
            "decision routing_state is missing matched_connector_ids",
        )),
        None => Ok(RoutingState::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn task_without_connectors_is_fine() {
        let routing = parse_routing_state(&json!({}), NodeType::Task, true).unwrap();
        assert!(routing.matched_connector_ids.is_empty());
    }

    #[test]
    fn decision_with_connectors_parses() {
        let routing = parse_routing_state(
            &json!({"matched_connector_ids": ["edge_yes"]}),
            NodeType::Decision,
            true,
        )
        .unwrap();
        assert_eq!(routing.matched_connector_ids, vec!["edge_yes"]);
    }

    #[test]
    fn decision_missing_connectors_fails_under_cutover() {
        let err = parse_routing_state(&json!({}), NodeType::Decision, true).unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationError);
    }

    #[test]
    fn decision_missing_connectors_degrades_without_cutover() {
        let routing = parse_routing_state(&json!({}), NodeType::Decision, false).unwrap();
        assert!(routing.matched_connector_ids.is_empty());
    }

    #[test]
    fn wrong_shape_is_malformed() {
        let err = parse_routing_state(
            &json!({"matched_connector_ids": "edge_yes"}),
            NodeType::Decision,
            true,
        )
        .unwrap_err();
        assert!(err.message.contains("malformed"));
    }

    #[test]
    fn empty_matched_list_is_valid() {
        // An empty set is a legitimate "no branch taken" declaration.
        let routing = parse_routing_state(
            &json!({"matched_connector_ids": []}),
            NodeType::Decision,
            true,
        )
        .unwrap();
        assert!(routing.matched_connector_ids.is_empty());
    }
}
