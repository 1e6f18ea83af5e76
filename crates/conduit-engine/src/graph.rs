use crate::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const SHAPE_START: &str = "Mdiamond";
pub const SHAPE_EXIT: &str = "Msquare";
pub const SHAPE_FAN_OUT: &str = "component";
pub const SHAPE_FAN_IN: &str = "tripleoctagon";
pub const SHAPE_CONDITIONAL: &str = "diamond";
pub const DEFAULT_SHAPE: &str = "box";

/// Shapes the runner interprets itself; they never need a registered handler.
pub const STRUCTURAL_SHAPES: [&str; 3] = [SHAPE_EXIT, SHAPE_FAN_OUT, SHAPE_FAN_IN];

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(value) => Some(*value),
            Self::String(value) => match value.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Some(true),
                "false" | "no" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            Self::String(value) => value.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(value) => Some(*value),
            Self::Integer(value) => Some(*value as f64),
            Self::String(value) => value.trim().parse().ok(),
            Self::Boolean(_) => None,
        }
    }

    pub fn to_string_value(&self) -> String {
        match self {
            Self::String(value) => value.clone(),
            Self::Integer(value) => value.to_string(),
            Self::Float(value) => value.to_string(),
            Self::Boolean(value) => value.to_string(),
        }
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for AttrValue {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<f64> for AttrValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attributes {
    values: BTreeMap<String, AttrValue>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn values(&self) -> &BTreeMap<String, AttrValue> {
        &self.values
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<AttrValue>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&AttrValue> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// String attributes only; blank values read as absent.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key)
            .and_then(AttrValue::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(AttrValue::as_bool)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(AttrValue::as_i64)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(AttrValue::as_f64)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(default = "default_shape")]
    pub shape: String,
    #[serde(default)]
    pub attrs: Attributes,
}

fn default_shape() -> String {
    DEFAULT_SHAPE.to_string()
}

impl Node {
    pub fn new(id: impl Into<String>, shape: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            shape: shape.into(),
            attrs: Attributes::new(),
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.attrs.set(key, value);
        self
    }

    pub fn is_fan_out(&self) -> bool {
        self.shape == SHAPE_FAN_OUT
    }

    pub fn is_fan_in(&self) -> bool {
        self.shape == SHAPE_FAN_IN
    }

    pub fn is_goal_gate(&self) -> bool {
        self.attrs.get_bool("goal_gate").unwrap_or(false)
    }

    pub fn retry_target(&self) -> Option<&str> {
        self.attrs.get_str("retry_target")
    }

    pub fn fallback_retry_target(&self) -> Option<&str> {
        self.attrs.get_str("fallback_retry_target")
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub weight: f64,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            label: None,
            condition: None,
            weight: 0.0,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// Trimmed condition text, empty when the edge is unconditioned.
    pub fn condition_expr(&self) -> &str {
        self.condition.as_deref().map(str::trim).unwrap_or("")
    }

    pub fn is_conditional(&self) -> bool {
        !self.condition_expr().is_empty()
    }

    pub fn label_text(&self) -> &str {
        self.label.as_deref().map(str::trim).unwrap_or("")
    }
}

/// Immutable pipeline definition. Built once with [`GraphBuilder`] (or
/// deserialized) and shared read-only by every run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    id: String,
    #[serde(default)]
    attrs: Attributes,
    nodes: BTreeMap<String, Node>,
    #[serde(default)]
    edges: Vec<Edge>,
}

impl Graph {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn attrs(&self) -> &Attributes {
        &self.attrs
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn contains_node(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn node(&self, node_id: &str) -> Result<&Node, EngineError> {
        self.nodes
            .get(node_id)
            .ok_or_else(|| EngineError::node_not_found(node_id))
    }

    /// Outgoing edges in definition order.
    pub fn outgoing_edges(&self, node_id: &str) -> Result<Vec<&Edge>, EngineError> {
        self.node(node_id)?;
        Ok(self
            .edges
            .iter()
            .filter(|edge| edge.from == node_id)
            .collect())
    }

    pub fn incoming_edges(&self, node_id: &str) -> Result<Vec<&Edge>, EngineError> {
        self.node(node_id)?;
        Ok(self.edges.iter().filter(|edge| edge.to == node_id).collect())
    }

    pub fn start_candidates(&self) -> Vec<&Node> {
        self.nodes
            .values()
            .filter(|node| node.shape == SHAPE_START || node.id == "start" || node.id == "Start")
            .collect()
    }

    pub fn start_node(&self) -> Option<&Node> {
        match self.start_candidates().as_slice() {
            [single] => Some(*single),
            _ => None,
        }
    }

    pub fn terminal_candidates(&self) -> Vec<&Node> {
        self.nodes
            .values()
            .filter(|node| self.is_terminal(node))
            .collect()
    }

    pub fn is_terminal(&self, node: &Node) -> bool {
        node.shape == SHAPE_EXIT || matches!(node.id.to_ascii_lowercase().as_str(), "exit" | "end")
    }

    pub fn retry_target(&self) -> Option<&str> {
        self.attrs.get_str("retry_target")
    }

    pub fn fallback_retry_target(&self) -> Option<&str> {
        self.attrs.get_str("fallback_retry_target")
    }
}

#[derive(Clone, Debug)]
pub struct GraphBuilder {
    graph: Graph,
}

impl GraphBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            graph: Graph {
                id: id.into(),
                attrs: Attributes::new(),
                nodes: BTreeMap::new(),
                edges: Vec::new(),
            },
        }
    }

    pub fn graph_attr(mut self, key: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.graph.attrs.set(key, value);
        self
    }

    /// Adds or replaces a node with the same id.
    pub fn node(mut self, node: Node) -> Self {
        self.graph.nodes.insert(node.id.clone(), node);
        self
    }

    pub fn edge(mut self, edge: Edge) -> Self {
        self.graph.edges.push(edge);
        self
    }

    /// Unconditioned edges between consecutive ids.
    pub fn chain(mut self, ids: &[&str]) -> Self {
        for pair in ids.windows(2) {
            self.graph.edges.push(Edge::new(pair[0], pair[1]));
        }
        self
    }

    pub fn build(self) -> Graph {
        self.graph
    }
}
