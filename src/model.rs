use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Static node id a flow routes to when authentication succeeds.
pub const SUCCESS_NODE_ID: &str = "70e691a5-1e33-4ac3-a356-e7b6d60d92e0";
/// Static node id a flow routes to when authentication fails.
pub const FAILURE_NODE_ID: &str = "e301438c-0bd0-429c-ab0c-66126501069a";
pub const START_NODE_ID: &str = "startNode";

/// Terminal markers are not steps and never appear in a flow's node map.
pub fn is_terminal(id: &str) -> bool {
    matches!(id, SUCCESS_NODE_ID | FAILURE_NODE_ID | START_NODE_ID)
}

/// The flow record ("tree").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDoc {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "entryNodeId", default, skip_serializing_if = "Option::is_none")]
    pub entry_node_id: Option<String>,
    #[serde(default)]
    pub nodes: IndexMap<String, NodeEntry>,
    #[serde(flatten, default)]
    pub extra: Map<String, Value>,
}

impl FlowDoc {
    pub fn new(id: impl Into<String>, entry: impl Into<String>) -> Self {
        FlowDoc {
            id: id.into(),
            entry_node_id: Some(entry.into()),
            nodes: IndexMap::new(),
            extra: Map::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.extra
            .get("enabled")
            .and_then(Value::as_bool)
            .unwrap_or(true)
    }
}

/// A step's entry inside its flow: type tag, display data and outcome transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEntry {
    #[serde(rename = "nodeType")]
    pub node_type: String,
    #[serde(rename = "displayName", default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub connections: IndexMap<String, String>,
    #[serde(flatten, default)]
    pub extra: Map<String, Value>,
}

impl NodeEntry {
    pub fn new(node_type: impl Into<String>) -> Self {
        NodeEntry {
            node_type: node_type.into(),
            display_name: None,
            connections: IndexMap::new(),
            extra: Map::new(),
        }
    }

    pub fn connect(mut self, outcome: impl Into<String>, target: impl Into<String>) -> Self {
        self.connections.insert(outcome.into(), target.into());
        self
    }

    pub fn strip_coordinates(&mut self) {
        self.extra.remove("x");
        self.extra.remove("y");
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeTypeRef {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<bool>,
}

/// Configuration body of a step or inner step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDoc {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_type", default, skip_serializing_if = "Option::is_none")]
    pub node_type: Option<NodeTypeRef>,
    #[serde(flatten, default)]
    pub config: Map<String, Value>,
}

impl StepDoc {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        StepDoc {
            id: id.into(),
            node_type: Some(NodeTypeRef {
                id: node_type.into(),
                name: None,
                collection: Some(true),
            }),
            config: Map::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    pub fn type_id(&self) -> Option<&str> {
        self.node_type.as_ref().map(|t| t.id.as_str())
    }

    pub fn from_value(value: Value) -> serde_json::Result<Self> {
        serde_json::from_value(value)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Reference from a container step to one of its inner steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InnerStepRef {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "nodeType")]
    pub node_type: String,
    #[serde(rename = "displayName", default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// Remove server-managed revision markers before a body is written back.
pub fn strip_revision(value: &mut Value) {
    if let Value::Object(map) = value {
        map.remove("_rev");
    }
}
