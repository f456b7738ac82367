//! Decision evaluation domain.
//!
//! Evaluates a node's `decision_conditions` against the assembled input
//! context and produces the `matched_connector_ids` routing declaration.
//! The strict contract is enforced upstream: under runtime cutover a
//! decision node with no conditions never reaches this domain, and a
//! routing result without `matched_connector_ids` fails the node.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use llmctl_contract::ErrorCode;

use super::{DomainOutcome, ToolDomain, ToolDomainContext};
use crate::flowchart::{ConditionOperator, DecisionCondition};

/// The `decision` tool domain.
pub struct DecisionDomain;

#[derive(Deserialize)]
struct EvaluateArgs {
    conditions: Vec<DecisionCondition>,
    #[serde(default)]
    context: Value,
}

/// Look up a dot path inside a JSON value.
fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for part in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn holds(condition: &DecisionCondition, context: &Value) -> bool {
    let found = lookup(context, &condition.field);
    match condition.operator {
        ConditionOperator::Exists => found.is_some(),
        ConditionOperator::Equals => found == Some(&condition.value),
        ConditionOperator::NotEquals => found.is_some() && found != Some(&condition.value),
        ConditionOperator::Contains => match (found, condition.value.as_str()) {
            (Some(Value::String(haystack)), Some(needle)) => haystack.contains(needle),
            (Some(Value::Array(items)), _) => items.contains(&condition.value),
            _ => false,
        },
        ConditionOperator::GreaterThan => compare(found, &condition.value)
            .map(|ordering| ordering.is_gt())
            .unwrap_or(false),
        ConditionOperator::LessThan => compare(found, &condition.value)
            .map(|ordering| ordering.is_lt())
            .unwrap_or(false),
    }
}

fn compare(found: Option<&Value>, expected: &Value) -> Option<std::cmp::Ordering> {
    let left = found?.as_f64()?;
    let right = expected.as_f64()?;
    left.partial_cmp(&right)
}

/// Evaluate conditions into the matched connector set, preserving the
/// declared condition order and deduplicating connector ids.
pub fn evaluate_conditions(conditions: &[DecisionCondition], context: &Value) -> Vec<String> {
    let mut matched = Vec::new();
    for condition in conditions {
        if holds(condition, context) && !matched.contains(&condition.connector_id) {
            matched.push(condition.connector_id.clone());
        }
    }
    matched
}

#[async_trait]
impl ToolDomain for DecisionDomain {
    fn name(&self) -> &'static str {
        "decision"
    }

    async fn execute(
        &self,
        operation: &str,
        _ctx: &ToolDomainContext,
        payload: &Value,
    ) -> DomainOutcome {
        match operation {
            "evaluate" => {
                let args: EvaluateArgs = match super::parse_payload(payload) {
                    Ok(args) => args,
                    Err(outcome) => return outcome,
                };
                if args.conditions.is_empty() {
                    return DomainOutcome::fail(
                        ErrorCode::ValidationError,
                        "decision node has no conditions to evaluate",
                    );
                }
                let matched = evaluate_conditions(&args.conditions, &args.context);
                DomainOutcome::ok()
                    .with_count("conditions", args.conditions.len() as u64)
                    .with_count("matched", matched.len() as u64)
                    .with_data(json!({"matched_connector_ids": matched}))
            }
            other => DomainOutcome::fail(
                ErrorCode::ValidationError,
                format!("unknown decision operation '{other}'"),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn condition(connector: &str, field: &str, operator: ConditionOperator, value: Value) -> DecisionCondition {
        DecisionCondition {
            connector_id: connector.to_string(),
            field: field.to_string(),
            operator,
            value,
        }
    }

    #[test]
    fn lookup_walks_dot_paths() {
        let context = json!({"result": {"score": 7, "tags": ["ready"]}});
        assert_eq!(lookup(&context, "result.score"), Some(&json!(7)));
        assert_eq!(lookup(&context, "result.tags.0"), Some(&json!("ready")));
        assert_eq!(lookup(&context, "result.missing"), None);
    }

    #[test]
    fn operators_evaluate() {
        let context = json!({"status": "approved", "score": 7, "notes": "needs review"});

        assert!(holds(
            &condition("c", "status", ConditionOperator::Equals, json!("approved")),
            &context
        ));
        assert!(holds(
            &condition("c", "status", ConditionOperator::NotEquals, json!("rejected")),
            &context
        ));
        assert!(holds(
            &condition("c", "score", ConditionOperator::GreaterThan, json!(5)),
            &context
        ));
        assert!(!holds(
            &condition("c", "score", ConditionOperator::LessThan, json!(5)),
            &context
        ));
        assert!(holds(
            &condition("c", "notes", ConditionOperator::Contains, json!("review")),
            &context
        ));
        assert!(holds(
            &condition("c", "score", ConditionOperator::Exists, Value::Null),
            &context
        ));
        assert!(!holds(
            &condition("c", "ghost", ConditionOperator::Exists, Value::Null),
            &context
        ));
    }

    #[test]
    fn missing_field_never_matches_not_equals() {
        let context = json!({});
        assert!(!holds(
            &condition("c", "ghost", ConditionOperator::NotEquals, json!("x")),
            &context
        ));
    }

    #[test]
    fn evaluate_preserves_order_and_dedupes() {
        let context = json!({"a": 1, "b": 2});
        let conditions = vec![
            condition("edge_yes", "a", ConditionOperator::Exists, Value::Null),
            condition("edge_no", "ghost", ConditionOperator::Exists, Value::Null),
            condition("edge_yes", "b", ConditionOperator::Exists, Value::Null),
            condition("edge_b", "b", ConditionOperator::Equals, json!(2)),
        ];
        assert_eq!(
            evaluate_conditions(&conditions, &context),
            vec!["edge_yes".to_string(), "edge_b".to_string()]
        );
    }

    #[tokio::test]
    async fn evaluate_operation_returns_routing_payload() {
        use crate::tools::ToolDomainRegistry;
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let registry = ToolDomainRegistry::new().register(Arc::new(DecisionDomain));
        let ctx = ToolDomainContext::new(dir.path(), "exec-1", "req-1", "corr-1");

        let trace = registry
            .invoke(
                "decision",
                "evaluate",
                &ctx,
                &json!({
                    "conditions": [
                        {"connector_id": "edge_yes", "field": "approved", "operator": "equals", "value": true}
                    ],
                    "context": {"approved": true}
                }),
            )
            .await;
        assert!(!trace.is_error());
        assert_eq!(
            trace.data.unwrap()["matched_connector_ids"],
            json!(["edge_yes"])
        );
    }

    #[tokio::test]
    async fn empty_conditions_rejected() {
        use crate::tools::ToolDomainRegistry;
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let registry = ToolDomainRegistry::new().register(Arc::new(DecisionDomain));
        let ctx = ToolDomainContext::new(dir.path(), "exec-1", "req-1", "corr-1");

        let trace = registry
            .invoke("decision", "evaluate", &ctx, &json!({"conditions": []}))
            .await;
        assert!(trace.is_error());
        assert_eq!(trace.errors[0].code, ErrorCode::ValidationError);
    }
}
