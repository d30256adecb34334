//! The declarative diagram model.
//!
//! Node types form a closed tagged union: every [`DomainNode`] carries a
//! [`NodeConfig`] variant with its typed static configuration, and handlers
//! register against the tag. There is no open-ended property bag.

use dipeo_state::{ContentType, NodeId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Closed set of node types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Start,
    PersonJob,
    CodeJob,
    ApiJob,
    Db,
    Condition,
    Endpoint,
    Hook,
    SubDiagram,
    TemplateJob,
    DiffPatch,
    UserResponse,
    JsonSchemaValidator,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeType::Start => "start",
            NodeType::PersonJob => "person_job",
            NodeType::CodeJob => "code_job",
            NodeType::ApiJob => "api_job",
            NodeType::Db => "db",
            NodeType::Condition => "condition",
            NodeType::Endpoint => "endpoint",
            NodeType::Hook => "hook",
            NodeType::SubDiagram => "sub_diagram",
            NodeType::TemplateJob => "template_job",
            NodeType::DiffPatch => "diff_patch",
            NodeType::UserResponse => "user_response",
            NodeType::JsonSchemaValidator => "json_schema_validator",
        };
        write!(f, "{s}")
    }
}

/// Retry policy for node execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Initial interval between retries in seconds.
    pub initial_interval: f64,
    /// Backoff multiplier for each retry.
    pub backoff_factor: f64,
    /// Maximum interval between retries in seconds.
    pub max_interval: f64,
    /// Maximum number of attempts (including the first).
    pub max_attempts: usize,
    /// Whether to add random jitter to intervals.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: 0.5,
            backoff_factor: 2.0,
            max_interval: 128.0,
            max_attempts: 3,
            jitter: true,
        }
    }
}

/// A person (LLM agent) referenced by `person_job` nodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersonDef {
    pub service: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_id: Option<String>,
}

/// How arrays are materialized at a batch-aware input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Packing {
    /// Multiple values on one handle are packed into a single array.
    #[default]
    Pack,
    /// Array elements are delivered as-is; multiple arrays concatenate.
    Spread,
}

/// Shape of a batch sub-diagram's final output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// Envelope body is just the array of child outputs.
    #[default]
    PureList,
    /// Wrapped `{total_items, successful, failed, results, errors}` object.
    RichObject,
}

/// `db` node operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DbOperation {
    Read,
    Write,
    Append,
}

/// `hook` node targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookType {
    File,
    Webhook,
}

fn default_true() -> bool {
    true
}

fn default_batch_input_key() -> String {
    "items".to_string()
}

fn default_result_key() -> String {
    "results".to_string()
}

fn default_prompt_timeout() -> u64 {
    60
}

/// Typed static configuration, one variant per node type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeConfig {
    Start {
        /// Extra variables merged over the execution variables.
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        custom_data: BTreeMap<String, Value>,
    },
    PersonJob {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        person: Option<String>,
        #[serde(default)]
        prompt: String,
        /// Prompt used only on the first iteration of a loop.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        first_only_prompt: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_iteration: Option<u32>,
        /// Attached by the compiler's bind phase.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resolved_person: Option<PersonDef>,
    },
    CodeJob {
        code: String,
    },
    ApiJob {
        url: String,
        #[serde(default = "default_http_method")]
        method: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_s: Option<u64>,
    },
    Db {
        operation: DbOperation,
        file: String,
    },
    Condition {
        expression: String,
    },
    Endpoint {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        save_to_file: Option<String>,
    },
    Hook {
        hook_type: HookType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    SubDiagram {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        diagram_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        diagram_data: Option<Box<DomainDiagram>>,
        #[serde(default)]
        batch: bool,
        #[serde(default = "default_batch_input_key")]
        batch_input_key: String,
        #[serde(default = "default_true")]
        batch_parallel: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_concurrent: Option<usize>,
        #[serde(default)]
        output_mode: OutputMode,
        #[serde(default = "default_result_key")]
        result_key: String,
    },
    TemplateJob {
        template: String,
    },
    DiffPatch {
        /// File to patch; when absent the patch applies to the text input.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        /// Inline unified diff; when absent the `patch` input handle is used.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        patch: Option<String>,
    },
    UserResponse {
        prompt: String,
        #[serde(default = "default_prompt_timeout")]
        timeout_s: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<Value>,
    },
    JsonSchemaValidator {
        schema: Value,
    },
}

fn default_http_method() -> String {
    "GET".to_string()
}

impl NodeConfig {
    /// The tag of this configuration.
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeConfig::Start { .. } => NodeType::Start,
            NodeConfig::PersonJob { .. } => NodeType::PersonJob,
            NodeConfig::CodeJob { .. } => NodeType::CodeJob,
            NodeConfig::ApiJob { .. } => NodeType::ApiJob,
            NodeConfig::Db { .. } => NodeType::Db,
            NodeConfig::Condition { .. } => NodeType::Condition,
            NodeConfig::Endpoint { .. } => NodeType::Endpoint,
            NodeConfig::Hook { .. } => NodeType::Hook,
            NodeConfig::SubDiagram { .. } => NodeType::SubDiagram,
            NodeConfig::TemplateJob { .. } => NodeType::TemplateJob,
            NodeConfig::DiffPatch { .. } => NodeType::DiffPatch,
            NodeConfig::UserResponse { .. } => NodeType::UserResponse,
            NodeConfig::JsonSchemaValidator { .. } => NodeType::JsonSchemaValidator,
        }
    }
}

/// A node in a declarative diagram.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DomainNode {
    pub id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(flatten)]
    pub config: NodeConfig,
    /// Iteration budget; defaults to 1 (`person_job` may override via its
    /// own `max_iteration`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

impl DomainNode {
    pub fn new(id: impl Into<NodeId>, config: NodeConfig) -> Self {
        Self {
            id: id.into(),
            label: None,
            config,
            max_iterations: None,
            retry: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_max_iterations(mut self, budget: u32) -> Self {
        self.max_iterations = Some(budget);
        self
    }

    pub fn node_type(&self) -> NodeType {
        self.config.node_type()
    }
}

/// A directed binding from one node's output handle to another's input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DomainEdge {
    pub source: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    pub target: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<ContentType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Higher runs first on ties within a ready batch.
    #[serde(default)]
    pub execution_priority: i32,
    #[serde(default)]
    pub packing: Packing,
}

impl DomainEdge {
    pub fn new(source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Self {
            source: source.into(),
            source_handle: None,
            target: target.into(),
            target_handle: None,
            content_type: None,
            label: None,
            execution_priority: 0,
            packing: Packing::Pack,
        }
    }

    pub fn with_source_handle(mut self, handle: impl Into<String>) -> Self {
        self.source_handle = Some(handle.into());
        self
    }

    pub fn with_target_handle(mut self, handle: impl Into<String>) -> Self {
        self.target_handle = Some(handle.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.execution_priority = priority;
        self
    }
}

/// A declarative typed graph of nodes and edges.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DomainDiagram {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub nodes: Vec<DomainNode>,
    #[serde(default)]
    pub edges: Vec<DomainEdge>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub persons: BTreeMap<String, PersonDef>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub variables: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl DomainDiagram {
    /// Stable identifier for persistence: the explicit id, else the name,
    /// else `"inline"`.
    pub fn diagram_id(&self) -> String {
        self.id
            .clone()
            .or_else(|| self.name.clone())
            .unwrap_or_else(|| "inline".to_string())
    }

    pub fn node(&self, id: &str) -> Option<&DomainNode> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_config_tagging() {
        let node: DomainNode = serde_json::from_value(json!({
            "id": "c1",
            "type": "condition",
            "expression": "x > 0"
        }))
        .unwrap();
        assert_eq!(node.node_type(), NodeType::Condition);
        assert!(matches!(node.config, NodeConfig::Condition { ref expression } if expression == "x > 0"));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let parsed: Result<DomainNode, _> = serde_json::from_value(json!({
            "id": "n1",
            "type": "quantum_job"
        }));
        assert!(parsed.is_err());
    }

    #[test]
    fn test_sub_diagram_defaults() {
        let node: DomainNode = serde_json::from_value(json!({
            "id": "s1",
            "type": "sub_diagram",
            "diagram_name": "child"
        }))
        .unwrap();
        let NodeConfig::SubDiagram {
            batch,
            batch_input_key,
            batch_parallel,
            output_mode,
            ..
        } = node.config
        else {
            panic!("expected sub_diagram config");
        };
        assert!(!batch);
        assert_eq!(batch_input_key, "items");
        assert!(batch_parallel);
        assert_eq!(output_mode, OutputMode::PureList);
    }

    #[test]
    fn test_diagram_round_trip() {
        let diagram = DomainDiagram {
            name: Some("demo".into()),
            nodes: vec![
                DomainNode::new(
                    "start",
                    NodeConfig::Start {
                        custom_data: BTreeMap::new(),
                    },
                ),
                DomainNode::new(
                    "end",
                    NodeConfig::Endpoint { save_to_file: None },
                ),
            ],
            edges: vec![DomainEdge::new("start", "end")],
            ..Default::default()
        };
        let text = serde_json::to_string(&diagram).unwrap();
        let back: DomainDiagram = serde_json::from_str(&text).unwrap();
        assert_eq!(diagram, back);
        assert_eq!(back.diagram_id(), "demo");
    }
}
