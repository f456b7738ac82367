//! Definition types for flowcharts, nodes, and edges.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Node type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    /// LLM task executed by the remote executor.
    Task,
    /// Routing node; evaluates conditions into matched connectors.
    Decision,
    /// Plan document mutation node.
    Plan,
    /// Memory document mutation node.
    Memory,
    /// Milestone mutation node.
    Milestone,
    /// RAG indexing/query node.
    Rag,
    /// Entry marker; never dispatched.
    Start,
    /// Exit marker; never dispatched.
    End,
}

impl NodeType {
    /// Stable wire string for this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Decision => "decision",
            Self::Plan => "plan",
            Self::Memory => "memory",
            Self::Milestone => "milestone",
            Self::Rag => "rag",
            Self::Start => "start",
            Self::End => "end",
        }
    }

    /// Whether nodes of this type are dispatched to the executor.
    pub fn is_dispatchable(&self) -> bool {
        !matches!(self, Self::Start | Self::End)
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which executor image class a node runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeClass {
    /// Frontier-provider executor image.
    #[default]
    Frontier,
    /// Self-hosted vLLM executor image.
    Vllm,
}

/// How an edge participates in activation and input assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    /// Gates activation and contributes context.
    TriggerAndContext,
    /// Gates activation, contributes context and attachments.
    TriggerContextAndAttachments,
    /// Contributes context only; never gates activation.
    ContextOnly,
    /// Contributes attachments only; never gates activation.
    AttachmentsOnly,
}

impl RoutingMode {
    /// Whether the edge gates downstream activation.
    pub fn gates_activation(&self) -> bool {
        matches!(self, Self::TriggerAndContext | Self::TriggerContextAndAttachments)
    }

    /// Whether predecessor output flows along the edge as context.
    pub fn carries_context(&self) -> bool {
        matches!(
            self,
            Self::TriggerAndContext | Self::TriggerContextAndAttachments | Self::ContextOnly
        )
    }

    /// Whether attachment references flow along the edge.
    pub fn carries_attachments(&self) -> bool {
        matches!(self, Self::TriggerContextAndAttachments | Self::AttachmentsOnly)
    }
}

/// Comparison operator of a decision condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Contains,
    GreaterThan,
    LessThan,
    Exists,
}

/// One condition a decision node evaluates against its input context.
///
/// `field` is a dot path into the assembled context object; when the
/// condition holds, `connector_id` is added to the matched set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionCondition {
    /// Route key of the outgoing edge this condition activates.
    pub connector_id: String,
    /// Dot path into the context object.
    pub field: String,
    /// Comparison operator.
    pub operator: ConditionOperator,
    /// Right-hand side of the comparison; ignored for `exists`.
    #[serde(default)]
    pub value: Value,
}

/// One node of a flowchart definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique id within the flowchart.
    pub id: String,
    /// Human-readable name.
    #[serde(default)]
    pub name: String,
    /// Node type tag.
    pub node_type: NodeType,
    /// Opaque node configuration forwarded to the executor.
    #[serde(default)]
    pub configuration: Value,
    /// Conditions for decision nodes.
    #[serde(default)]
    pub decision_conditions: Vec<DecisionCondition>,
    /// A failure of this node does not fail the run.
    #[serde(default)]
    pub on_failure_continue: bool,
    /// Executor image class.
    #[serde(default)]
    pub runtime_class: RuntimeClass,
    /// MCP server keys selected for the node.
    #[serde(default)]
    pub mcp_server_keys: Vec<String>,
    /// Providers the node may call.
    #[serde(default)]
    pub enabled_providers: Vec<String>,
    /// Default model id when the node does not pin one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model_id: Option<String>,
}

impl Node {
    /// Create a bare node of the given type.
    pub fn new(id: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            node_type,
            configuration: Value::Null,
            decision_conditions: Vec::new(),
            on_failure_continue: false,
            runtime_class: RuntimeClass::default(),
            mcp_server_keys: Vec::new(),
            enabled_providers: Vec::new(),
            default_model_id: None,
        }
    }

    /// Set the configuration payload.
    pub fn with_configuration(mut self, configuration: Value) -> Self {
        self.configuration = configuration;
        self
    }

    /// Set the decision conditions.
    pub fn with_conditions(mut self, conditions: Vec<DecisionCondition>) -> Self {
        self.decision_conditions = conditions;
        self
    }

    /// Mark the node as non-fatal on failure.
    pub fn with_on_failure_continue(mut self, flag: bool) -> Self {
        self.on_failure_continue = flag;
        self
    }
}

/// One directed edge of a flowchart definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    /// Unique id within the flowchart.
    pub id: String,
    /// Source node id.
    pub from: String,
    /// Target node id.
    pub to: String,
    /// Activation/input semantics of the edge.
    pub routing_mode: RoutingMode,
    /// Route key for decision outputs; the edge only fires when the
    /// decision's matched connectors include it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_key: Option<String>,
}

impl Edge {
    /// Create a trigger-and-context edge.
    pub fn trigger(id: impl Into<String>, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            from: from.into(),
            to: to.into(),
            routing_mode: RoutingMode::TriggerAndContext,
            route_key: None,
        }
    }

    /// Set the routing mode.
    pub fn with_mode(mut self, mode: RoutingMode) -> Self {
        self.routing_mode = mode;
        self
    }

    /// Set the route key.
    pub fn with_route_key(mut self, key: impl Into<String>) -> Self {
        self.route_key = Some(key.into());
        self
    }
}

/// A flowchart definition: typed nodes plus typed directed edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flowchart {
    /// Flowchart id.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Node set; ids must be unique.
    pub nodes: Vec<Node>,
    /// Edge set; endpoints must exist.
    pub edges: Vec<Edge>,
}

impl Flowchart {
    /// Synthesize a single-task flowchart for quick "no-graph" triggers.
    ///
    /// Quick triggers share the full orchestrator path; a one-node graph
    /// keeps them on the same state machine as regular runs.
    pub fn quick(id: impl Into<String>, task_configuration: Value) -> Self {
        let id = id.into();
        Self {
            id: id.clone(),
            name: format!("quick:{id}"),
            nodes: vec![
                Node::new("start", NodeType::Start),
                Node::new("task", NodeType::Task).with_configuration(task_configuration),
                Node::new("end", NodeType::End),
            ],
            edges: vec![
                Edge::trigger("e-start", "start", "task"),
                Edge::trigger("e-end", "task", "end"),
            ],
        }
    }
}
