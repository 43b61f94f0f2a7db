//! The declared graph, as submitted by the workflow author.
//!
//! The host describes a workflow as an object of nodes keyed by id. Each node
//! has a class name and a map of inputs, where an input is either a literal or
//! a reference to another node's output slot, written as `["4", 0]`.
//!
//! ```json
//! {
//!   "3": { "class_type": "KSampler", "inputs": { "seed": 5, "model": ["4", 0] } },
//!   "4": { "class_type": "CheckpointLoaderSimple", "inputs": { "ckpt_name": "a.safetensors" } }
//! }
//! ```
//!
//! Alongside the node map, [`Workflow`] keeps a `petgraph` index with an edge
//! from producer to consumer for every reference, so that the tracer can walk
//! the graph backwards without re-scanning inputs.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};

use crate::error::WorkflowError;

pub type NodeId = String;

/// A single input of a declared node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputValue {
    /// Output `slot` of node `producer`.
    Reference(NodeId, usize),
    Literal(serde_json::Value),
}

impl InputValue {
    pub fn reference(producer: impl Into<NodeId>, slot: usize) -> Self {
        InputValue::Reference(producer.into(), slot)
    }

    pub fn literal(value: impl Into<serde_json::Value>) -> Self {
        InputValue::Literal(value.into())
    }

    pub fn as_reference(&self) -> Option<(&str, usize)> {
        match self {
            InputValue::Reference(producer, slot) => Some((producer, *slot)),
            InputValue::Literal(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct NodeMeta {
    title: Option<String>,
}

/// A vertex of the declared graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub class_type: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, InputValue>,
    /// Author-visible title, used as a naming hint.
    #[serde(
        default,
        rename = "_meta",
        deserialize_with = "de_title",
        skip_serializing
    )]
    pub title: Option<String>,
}

fn de_title<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let meta = Option::<NodeMeta>::deserialize(deserializer)?;
    Ok(meta.and_then(|meta| meta.title))
}

impl Node {
    pub fn new(class_type: impl Into<String>) -> Self {
        Self {
            class_type: class_type.into(),
            inputs: BTreeMap::new(),
            title: None,
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, value: InputValue) -> Self {
        self.inputs.insert(name.into(), value);
        self
    }

    pub fn with_link(self, name: impl Into<String>, producer: impl Into<NodeId>, slot: usize) -> Self {
        self.with_input(name, InputValue::reference(producer, slot))
    }

    pub fn with_literal(self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.with_input(name, InputValue::literal(value))
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// All references held by this node, `model` first, then in input order.
    pub fn references(&self) -> impl Iterator<Item = (&str, &str, usize)> {
        let model = self.inputs.get_key_value("model");
        let rest = self.inputs.iter().filter(|(name, _)| name.as_str() != "model");

        model
            .into_iter()
            .chain(rest)
            .filter_map(|(name, value)| {
                value
                    .as_reference()
                    .map(|(producer, slot)| (name.as_str(), producer, slot))
            })
    }
}

/// Edge weight in the reference index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub input: String,
    pub slot: usize,
}

/// Declared graph snapshot of a single run.
#[derive(Debug, Clone, Default)]
pub struct Workflow {
    nodes: BTreeMap<NodeId, Node>,
    index: DiGraph<NodeId, Link>,
    lookup: HashMap<NodeId, NodeIndex>,
}

impl Workflow {
    pub fn new(nodes: impl IntoIterator<Item = (NodeId, Node)>) -> Self {
        let nodes: BTreeMap<_, _> = nodes.into_iter().collect();

        let mut index = DiGraph::new();
        let mut lookup = HashMap::new();

        for id in nodes.keys() {
            lookup.insert(id.clone(), index.add_node(id.clone()));
        }

        for (id, node) in &nodes {
            let target = lookup[id];
            for (input, producer, slot) in node.references() {
                // Dangling references stay in the node map but get no edge.
                if let Some(&source) = lookup.get(producer) {
                    let link = Link {
                        input: input.to_string(),
                        slot,
                    };
                    index.add_edge(source, target, link);
                }
            }
        }

        Self {
            nodes,
            index,
            lookup,
        }
    }

    /// Parses a workflow in the host's API prompt format.
    pub fn from_json(text: &str) -> Result<Self, WorkflowError> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self, WorkflowError> {
        let kind = match &value {
            serde_json::Value::Object(_) => None,
            serde_json::Value::Array(_) => Some("array"),
            serde_json::Value::Null => Some("null"),
            _ => Some("scalar"),
        };

        if let Some(kind) = kind {
            return Err(WorkflowError::Shape(kind));
        }

        let nodes: BTreeMap<NodeId, Node> = serde_json::from_value(value)?;
        Ok(Self::new(nodes))
    }

    pub fn get(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// The stored id equal to `id`, borrowed from the workflow.
    pub fn key(&self, id: &str) -> Option<&str> {
        self.nodes.get_key_value(id).map(|(key, _)| key.as_str())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn class_of(&self, id: &str) -> Option<&str> {
        self.nodes.get(id).map(|node| node.class_type.as_str())
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.nodes.iter().map(|(id, node)| (id.as_str(), node))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Producers feeding `id`, each with the consuming input name.
    ///
    /// Read from the reference index, `model` first, then by input name.
    /// Dangling references have no edge and are left out.
    pub fn upstream(&self, id: &str) -> Vec<(&str, &str)> {
        let Some(&target) = self.lookup.get(id) else {
            return vec![];
        };

        let mut producers: Vec<_> = self
            .index
            .edges_directed(target, Direction::Incoming)
            .map(|edge| (edge.weight().input.as_str(), self.index[edge.source()].as_str()))
            .collect();

        producers.sort_unstable_by_key(|&(input, _)| (input != "model", input));
        producers
    }
}

/// Renders the declared graph as a Mermaid diagram for inspection.
impl Display for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for (id, node) in &self.nodes {
            let name = node.title.as_deref().unwrap_or(&node.class_type);
            let name = name.replace('"', "\\\"");
            writeln!(f, "    n{}[\"{}\"]", self.lookup[id].index(), name)?;
        }

        for edge in self.index.edge_indices() {
            if let Some((source, target)) = self.index.edge_endpoints(edge) {
                let link = &self.index[edge];
                writeln!(
                    f,
                    "    n{} -->|\"{}\"| n{}",
                    source.index(),
                    link.input,
                    target.index()
                )?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Workflow {
        Workflow::from_value(json!({
            "3": {
                "class_type": "KSampler",
                "inputs": { "seed": 5, "model": ["4", 0], "positive": ["6", 0], "latent_image": ["5", 0] },
                "_meta": { "title": "KSampler" }
            },
            "4": { "class_type": "CheckpointLoaderSimple", "inputs": { "ckpt_name": "a.safetensors" } },
            "6": {
                "class_type": "CLIPTextEncode",
                "inputs": { "text": "castle", "clip": ["4", 1] },
                "_meta": { "title": "Positive" }
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_parse_references_and_literals() {
        let workflow = sample();
        let sampler = workflow.get("3").unwrap();

        assert_eq!(sampler.inputs["seed"], InputValue::Literal(json!(5)));
        assert_eq!(sampler.inputs["model"], InputValue::reference("4", 0));
        assert_eq!(workflow.get("6").unwrap().title.as_deref(), Some("Positive"));
        assert_eq!(workflow.get("4").unwrap().title, None);
    }

    #[test]
    fn test_upstream_prefers_model_and_skips_dangling() {
        let workflow = sample();
        // "5" is referenced but not declared.
        assert_eq!(workflow.upstream("3"), vec![("model", "4"), ("positive", "6")]);
        assert!(workflow.upstream("missing").is_empty());
    }

    #[test]
    fn test_upstream_follows_index_edges() {
        let workflow = Workflow::from_value(json!({
            "1": { "class_type": "CLIPTextEncode", "inputs": { "text": "a" } },
            "2": { "class_type": "UNETLoader", "inputs": {} },
            "3": {
                "class_type": "ControlNetApplyAdvanced",
                "inputs": { "positive": ["1", 0], "negative": ["1", 0], "image": ["9", 0] }
            },
            "4": {
                "class_type": "KSampler",
                "inputs": { "positive": ["3", 0], "negative": ["3", 1], "model": ["2", 0] }
            }
        }))
        .unwrap();

        assert_eq!(
            workflow.upstream("4"),
            vec![("model", "2"), ("negative", "3"), ("positive", "3")]
        );
        assert_eq!(workflow.upstream("3"), vec![("negative", "1"), ("positive", "1")]);
        assert!(workflow.upstream("1").is_empty());
    }

    #[test]
    fn test_rejects_non_object() {
        assert!(matches!(
            Workflow::from_json("[1, 2]"),
            Err(WorkflowError::Shape("array"))
        ));
        assert!(matches!(
            Workflow::from_json("{"),
            Err(WorkflowError::Parse(_))
        ));
    }

    #[test]
    fn test_mermaid() {
        let text = sample().to_string();
        assert!(text.starts_with("graph LR"));
        assert!(text.contains("[\"Positive\"]"));
        assert!(text.contains("-->|\"model\"|"));
    }
}
