//! Categorized records of a single run.
//!
//! Records are grouped in a closed set of categories, one map per category,
//! keyed by the id of the node that produced them. An empty map means nothing
//! of that kind was observed. Every record also carries its own `node_id`.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::graph::{NodeId, Workflow};
use crate::value::Payload;

/// Record categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Models,
    Prompts,
    Sampling,
    Loras,
    Size,
    Images,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Checkpoint,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelRecord {
    pub node_id: NodeId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ModelKind,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PromptRecord {
    pub node_id: NodeId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub negative_text: Option<String>,
    /// Conditioning produced by this node, compared by identity only.
    #[serde(skip)]
    pub conditioning: Option<Payload>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SamplingRecord {
    pub node_id: NodeId,
    pub parameters: BTreeMap<String, serde_json::Value>,
    pub is_primary_candidate: bool,
    /// Conditioning seen on the `positive` input.
    #[serde(skip)]
    pub positive: Option<Payload>,
    /// Conditioning seen on the `negative` input.
    #[serde(skip)]
    pub negative: Option<Payload>,
}

impl SamplingRecord {
    pub fn new(node_id: impl Into<NodeId>, is_primary_candidate: bool) -> Self {
        Self {
            node_id: node_id.into(),
            is_primary_candidate,
            ..Default::default()
        }
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.parameters.get(key).filter(|value| !value.is_null())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoraEntry {
    pub name: String,
    pub strength: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoraRecord {
    pub node_id: NodeId,
    pub lora_list: Vec<LoraEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SizeRecord {
    pub node_id: NodeId,
    pub width: u64,
    pub height: u64,
}

#[derive(Debug, Clone)]
pub struct ImageRecord {
    pub node_id: NodeId,
    pub image: Payload,
}

#[derive(Debug, Clone, Default)]
pub struct Images {
    pub by_node: BTreeMap<NodeId, ImageRecord>,
    /// First decoded image of the run, never overwritten.
    pub first_decode: Option<ImageRecord>,
}

impl Images {
    pub fn is_empty(&self) -> bool {
        self.by_node.is_empty() && self.first_decode.is_none()
    }

    /// Stores a decoded image, remembering it as the first one if none was yet.
    pub fn insert(&mut self, record: ImageRecord) {
        if self.first_decode.is_none() {
            self.first_decode = Some(record.clone());
        }
        self.by_node.insert(record.node_id.clone(), record);
    }
}

/// Everything observed during a single run.
///
/// The declared graph of the run travels along under `graph`, so that a
/// snapshot handed to the tracer is self-contained.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Metadata {
    pub models: BTreeMap<NodeId, ModelRecord>,
    pub prompts: BTreeMap<NodeId, PromptRecord>,
    pub sampling: BTreeMap<NodeId, SamplingRecord>,
    pub loras: BTreeMap<NodeId, LoraRecord>,
    pub size: BTreeMap<NodeId, SizeRecord>,
    #[serde(skip)]
    pub images: Images,
    /// Node ids in the order the host dispatched them.
    pub execution_order: Vec<NodeId>,
    #[serde(skip)]
    pub graph: Option<Arc<Workflow>>,
}

impl Metadata {
    pub fn graph(&self) -> Option<&Workflow> {
        self.graph.as_deref()
    }

    /// Categories holding at least one record.
    pub fn categories(&self) -> Vec<Category> {
        let mut categories = Vec::new();

        if !self.models.is_empty() {
            categories.push(Category::Models);
        }
        if !self.prompts.is_empty() {
            categories.push(Category::Prompts);
        }
        if !self.sampling.is_empty() {
            categories.push(Category::Sampling);
        }
        if !self.loras.is_empty() {
            categories.push(Category::Loras);
        }
        if !self.size.is_empty() {
            categories.push(Category::Size);
        }
        if !self.images.is_empty() {
            categories.push(Category::Images);
        }

        categories
    }

    pub fn is_empty(&self) -> bool {
        self.categories().is_empty()
    }

    pub fn has_records(&self, node_id: &str) -> bool {
        self.models.contains_key(node_id)
            || self.prompts.contains_key(node_id)
            || self.sampling.contains_key(node_id)
            || self.loras.contains_key(node_id)
            || self.size.contains_key(node_id)
            || self.images.by_node.contains_key(node_id)
    }

    /// Existing sampling record of `node_id`, or a fresh one.
    ///
    /// Helper nodes use this to augment a record instead of replacing it.
    pub fn sampling_entry(&mut self, node_id: &str, is_primary_candidate: bool) -> &mut SamplingRecord {
        let record = self
            .sampling
            .entry(node_id.to_string())
            .or_insert_with(|| SamplingRecord::new(node_id, is_primary_candidate));

        record.is_primary_candidate |= is_primary_candidate;
        record
    }

    pub fn set_size(&mut self, node_id: &str, width: u64, height: u64) {
        let record = SizeRecord {
            node_id: node_id.to_string(),
            width,
            height,
        };
        self.size.insert(node_id.to_string(), record);
    }

    /// Snapshot of the records of one node, images excluded.
    pub fn node_records(&self, node_id: &str) -> NodeRecords {
        NodeRecords {
            model: self.models.get(node_id).cloned(),
            prompt: self.prompts.get(node_id).cloned(),
            sampling: self.sampling.get(node_id).cloned(),
            lora: self.loras.get(node_id).cloned(),
            size: self.size.get(node_id).cloned(),
        }
    }

    /// Inserts the snapshot under `node_id`, leaving existing records alone.
    pub fn merge_missing(&mut self, node_id: &str, records: NodeRecords) {
        let key = || node_id.to_string();

        if let Some(record) = records.model {
            self.models.entry(key()).or_insert(record);
        }
        if let Some(record) = records.prompt {
            self.prompts.entry(key()).or_insert(record);
        }
        if let Some(record) = records.sampling {
            self.sampling.entry(key()).or_insert(record);
        }
        if let Some(record) = records.lora {
            self.loras.entry(key()).or_insert(record);
        }
        if let Some(record) = records.size {
            self.size.entry(key()).or_insert(record);
        }
    }
}

/// Records of a single node across categories.
///
/// This is the unit kept in the cross-run node cache.
#[derive(Debug, Clone, Default)]
pub struct NodeRecords {
    pub model: Option<ModelRecord>,
    pub prompt: Option<PromptRecord>,
    pub sampling: Option<SamplingRecord>,
    pub lora: Option<LoraRecord>,
    pub size: Option<SizeRecord>,
}

impl NodeRecords {
    pub fn is_empty(&self) -> bool {
        self.model.is_none()
            && self.prompt.is_none()
            && self.sampling.is_none()
            && self.lora.is_none()
            && self.size.is_none()
    }

    /// The same records with every conditioning payload removed.
    pub fn without_payloads(mut self) -> Self {
        if let Some(prompt) = &mut self.prompt {
            prompt.conditioning = None;
        }
        if let Some(sampling) = &mut self.sampling {
            sampling.positive = None;
            sampling.negative = None;
        }
        self
    }
}
