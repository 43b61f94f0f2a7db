//! Process-wide collection state.
//!
//! The [`Registry`] owns the categorized records of every run it currently
//! tracks, plus a node cache that outlives runs. The host may skip executing a
//! node whose inputs did not change since the last run, reusing the previous
//! result. Such a node never reaches the extractors, so its records are taken
//! from the cache when the run's metadata is read.
//!
//! All state sits behind a single mutex. Reads return a copy, so a snapshot
//! handed to the tracer cannot change underneath it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::Config;
use crate::error::ConfigError;
use crate::extract::Extractor;
use crate::graph::{NodeId, Workflow};
use crate::metadata::{Metadata, NodeRecords};
use crate::tracer::Tracer;
use crate::value::{Inputs, Outputs, Payload};

pub type RunId = String;

/// Node cache key, the same node id may host a different class across runs.
type CacheKey = (NodeId, String);

#[derive(Default)]
struct Run {
    metadata: Metadata,
    executed: HashSet<NodeId>,
}

#[derive(Default)]
struct State {
    current: Option<RunId>,
    runs: HashMap<RunId, Run>,
    /// Oldest first.
    history: VecDeque<RunId>,
    cache: HashMap<CacheKey, NodeRecords>,
}

impl State {
    fn current_run(&mut self) -> Option<(&str, &mut Run)> {
        let id = self.current.as_deref()?;
        let run = self.runs.get_mut(id)?;
        Some((id, run))
    }
}

pub struct Registry {
    config: Config,
    state: Mutex<State>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_config(Config::default())
    }
}

impl Registry {
    /// Creates a registry, rejecting a configuration that could not hold a
    /// single run or trace a single hop.
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::with_config(config))
    }

    fn with_config(config: Config) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Tracer bounded by the configured depth.
    pub fn tracer(&self) -> Tracer {
        Tracer::new(self.config.max_trace_depth)
    }

    /// A panic in one observer must not take the registry down with it.
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens a run and makes it current. Starting a known run only makes it
    /// current again.
    pub fn start_collection(&self, run_id: &str) {
        let mut state = self.state();
        state.current = Some(run_id.to_string());

        if state.runs.contains_key(run_id) {
            tracing::debug!(run_id, "run already collecting");
            return;
        }

        state.runs.insert(run_id.to_string(), Run::default());
        state.history.push_back(run_id.to_string());
        tracing::info!(run_id, "started collection");

        while state.history.len() > self.config.max_history {
            if let Some(evicted) = state.history.pop_front() {
                state.runs.remove(&evicted);
                tracing::debug!(run_id = %evicted, "evicted run from history");
            }
        }
    }

    pub fn set_current_graph(&self, run_id: &str, graph: Arc<Workflow>) {
        let mut state = self.state();

        match state.runs.get_mut(run_id) {
            Some(run) => {
                tracing::debug!(run_id, nodes = graph.len(), "attached graph");
                run.metadata.graph = Some(graph);
            }
            None => tracing::debug!(run_id, "graph for unknown run ignored"),
        }
    }

    pub fn current_run(&self) -> Option<RunId> {
        self.state().current.clone()
    }

    /// Records a node dispatch into the current run.
    pub fn record_node_execution(
        &self,
        node_id: &str,
        class_name: &str,
        inputs: &Inputs,
        outputs: Option<&Outputs>,
    ) {
        let extractor = Extractor::for_class(class_name);
        let mut state = self.state();

        let Some((run_id, run)) = state.current_run() else {
            tracing::trace!(node_id, class_name, "no active run");
            return;
        };

        tracing::trace!(run_id, node_id, class_name, "record");

        if run.executed.insert(node_id.to_string()) {
            run.metadata.execution_order.push(node_id.to_string());
        }

        extractor.extract(node_id, inputs, outputs, &mut run.metadata);

        let records = run.metadata.node_records(node_id);
        self.refresh_cache(&mut state, node_id, class_name, extractor, records);
    }

    /// Feeds the outputs of an executed node into the current run.
    pub fn update_node_execution(&self, node_id: &str, class_name: &str, outputs: &Outputs) {
        let extractor = Extractor::for_class(class_name);
        let mut state = self.state();

        let Some((run_id, run)) = state.current_run() else {
            return;
        };

        tracing::trace!(run_id, node_id, class_name, "update");
        extractor.update(node_id, outputs, &mut run.metadata);

        let records = run.metadata.node_records(node_id);
        self.refresh_cache(&mut state, node_id, class_name, extractor, records);
    }

    fn refresh_cache(
        &self,
        state: &mut State,
        node_id: &str,
        class_name: &str,
        extractor: Extractor,
        records: NodeRecords,
    ) {
        if !self.config.node_cache || extractor.is_noop() || records.is_empty() {
            return;
        }

        // Conditioning payloads belong to a single run.
        let key = (node_id.to_string(), class_name.to_string());
        state.cache.insert(key, records.without_payloads());
    }

    /// Snapshot of a run, cached records filled in for skipped nodes.
    ///
    /// Unknown runs yield empty metadata.
    pub fn get_metadata(&self, run_id: &str) -> Metadata {
        let state = self.state();

        let Some(run) = state.runs.get(run_id) else {
            return Metadata::default();
        };

        let mut metadata = run.metadata.clone();

        if !self.config.node_cache {
            return metadata;
        }

        let Some(graph) = run.metadata.graph.as_deref() else {
            return metadata;
        };

        for (node_id, node) in graph.nodes() {
            if run.executed.contains(node_id) || metadata.has_records(node_id) {
                continue;
            }

            let key = (node_id.to_string(), node.class_type.clone());
            if let Some(records) = state.cache.get(&key) {
                tracing::trace!(run_id, node_id, "reusing cached records");
                metadata.merge_missing(node_id, records.clone());
            }
        }

        metadata
    }

    pub fn get_first_decoded_image(&self, run_id: &str) -> Option<Payload> {
        let state = self.state();
        let run = state.runs.get(run_id)?;
        let first = run.metadata.images.first_decode.as_ref()?;
        Some(first.image.clone())
    }

    /// Drops the records of a run. The node cache is left untouched.
    pub fn clear_metadata(&self, run_id: &str) {
        let mut state = self.state();

        if state.runs.remove(run_id).is_some() {
            tracing::debug!(run_id, "cleared run");
        }

        state.history.retain(|id| id != run_id);

        if state.current.as_deref() == Some(run_id) {
            state.current = None;
        }
    }

    pub fn has_cached(&self, node_id: &str, class_name: &str) -> bool {
        let key = (node_id.to_string(), class_name.to_string());
        self.state().cache.contains_key(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::json_inputs as inputs;
    use crate::graph::Node;
    use crate::value::Value;
    use serde_json::json;

    fn loader_graph() -> Arc<Workflow> {
        Arc::new(Workflow::new([
            (
                "4".to_string(),
                Node::new("CheckpointLoaderSimple").with_literal("ckpt_name", "model.safetensors"),
            ),
            (
                "3".to_string(),
                Node::new("KSampler").with_link("model", "4", 0).with_literal("seed", 1),
            ),
        ]))
    }

    fn record_loader(registry: &Registry) {
        registry.record_node_execution(
            "4",
            "CheckpointLoaderSimple",
            &inputs(&[("ckpt_name", json!("model.safetensors"))]),
            None,
        );
    }

    #[test]
    fn test_unknown_run_is_empty() {
        let registry = Registry::default();
        assert!(registry.get_metadata("nope").is_empty());
        assert!(registry.get_first_decoded_image("nope").is_none());
        registry.clear_metadata("nope");
    }

    #[test]
    fn test_record_without_run_is_ignored() {
        let registry = Registry::default();
        record_loader(&registry);
        assert!(!registry.has_cached("4", "CheckpointLoaderSimple"));
    }

    #[test]
    fn test_start_collection_is_idempotent() {
        let registry = Registry::default();
        registry.start_collection("a");
        record_loader(&registry);
        registry.start_collection("a");

        assert_eq!(registry.current_run().as_deref(), Some("a"));
        assert_eq!(registry.get_metadata("a").models["4"].name, "model.safetensors");
    }

    #[test]
    fn test_execution_order() {
        let registry = Registry::default();
        registry.start_collection("a");
        record_loader(&registry);
        registry.record_node_execution("3", "KSampler", &inputs(&[("seed", json!(1))]), None);
        record_loader(&registry);

        assert_eq!(registry.get_metadata("a").execution_order, vec!["4", "3"]);
    }

    #[test]
    fn test_cache_survives_clear() {
        let registry = Registry::default();

        registry.start_collection("a");
        registry.set_current_graph("a", loader_graph());
        record_loader(&registry);
        registry.clear_metadata("a");

        assert!(registry.get_metadata("a").is_empty());
        assert!(registry.has_cached("4", "CheckpointLoaderSimple"));

        // The host skips the unchanged loader in the next run.
        registry.start_collection("b");
        registry.set_current_graph("b", loader_graph());
        registry.record_node_execution("3", "KSampler", &inputs(&[("seed", json!(2))]), None);

        let metadata = registry.get_metadata("b");
        assert_eq!(metadata.models["4"].name, "model.safetensors");
        assert_eq!(metadata.models["4"].node_id, "4");
        assert_eq!(metadata.execution_order, vec!["3"]);
    }

    #[test]
    fn test_cache_requires_matching_class() {
        let registry = Registry::default();
        registry.start_collection("a");
        record_loader(&registry);

        let graph = Workflow::new([(
            "4".to_string(),
            Node::new("UNETLoader").with_literal("unet_name", "flux.safetensors"),
        )]);

        registry.start_collection("b");
        registry.set_current_graph("b", Arc::new(graph));
        assert!(registry.get_metadata("b").models.is_empty());
    }

    #[test]
    fn test_cache_disabled() {
        let registry = Registry::new(Config::default().with_node_cache(false)).unwrap();
        registry.start_collection("a");
        record_loader(&registry);
        assert!(!registry.has_cached("4", "CheckpointLoaderSimple"));

        registry.start_collection("b");
        registry.set_current_graph("b", loader_graph());
        assert!(registry.get_metadata("b").models.is_empty());
    }

    #[test]
    fn test_fresh_records_win_over_cache() {
        let registry = Registry::default();
        registry.start_collection("a");
        record_loader(&registry);

        registry.start_collection("b");
        registry.set_current_graph("b", loader_graph());
        registry.record_node_execution(
            "4",
            "CheckpointLoaderSimple",
            &inputs(&[("ckpt_name", json!("other.safetensors"))]),
            None,
        );

        assert_eq!(registry.get_metadata("b").models["4"].name, "other.safetensors");
    }

    #[test]
    fn test_history_evicts_oldest() {
        let registry = Registry::new(Config::default().with_max_history(2)).unwrap();
        for run in ["a", "b", "c"] {
            registry.start_collection(run);
            record_loader(&registry);
        }

        assert!(registry.get_metadata("a").is_empty());
        assert!(!registry.get_metadata("b").is_empty());
        assert!(!registry.get_metadata("c").is_empty());
    }

    #[test]
    fn test_new_rejects_zero_limits() {
        assert!(matches!(
            Registry::new(Config::default().with_max_history(0)),
            Err(ConfigError::Zero("max_history"))
        ));
        assert!(matches!(
            Registry::new(Config::default().with_max_trace_depth(0)),
            Err(ConfigError::Zero("max_trace_depth"))
        ));

        let registry = Registry::new(Config::default().with_max_history(1)).unwrap();
        registry.start_collection("a");
        record_loader(&registry);
        assert_eq!(registry.get_metadata("a").models["4"].name, "model.safetensors");
    }

    #[test]
    fn test_cache_drops_conditioning_payloads() {
        let registry = Registry::default();
        registry.start_collection("a");

        let graph = Workflow::new([(
            "6".to_string(),
            Node::new("CLIPTextEncode").with_literal("text", "a castle"),
        )]);
        registry.set_current_graph("a", Arc::new(graph.clone()));

        let conditioning = Value::object("conditioning");
        registry.record_node_execution("6", "CLIPTextEncode", &inputs(&[("text", json!("a castle"))]), None);
        registry.update_node_execution("6", "CLIPTextEncode", &vec![conditioning.clone()]);
        assert!(registry.get_metadata("a").prompts["6"].conditioning.is_some());

        registry.start_collection("b");
        registry.set_current_graph("b", Arc::new(graph));

        let metadata = registry.get_metadata("b");
        let prompt = &metadata.prompts["6"];
        assert_eq!(prompt.text.as_deref(), Some("a castle"));
        assert!(prompt.conditioning.is_none());

        // Only the run's own record still holds the payload.
        assert_eq!(Arc::strong_count(conditioning.as_payload().unwrap()), 2);
    }

    #[test]
    fn test_first_decoded_image() {
        let registry = Registry::default();
        registry.start_collection("a");

        let image: Payload = Arc::new(vec![7u8; 3]);
        registry.record_node_execution("8", "VAEDecode", &Inputs::new(), None);
        registry.update_node_execution("8", "VAEDecode", &vec![Value::Object(image.clone())]);
        registry.update_node_execution("9", "VAEDecode", &vec![Value::object(vec![1u8])]);

        let first = registry.get_first_decoded_image("a").unwrap();
        assert!(Arc::ptr_eq(&first, &image));
    }

    #[test]
    fn test_clear_resets_current() {
        let registry = Registry::default();
        registry.start_collection("a");
        registry.clear_metadata("a");

        assert!(registry.current_run().is_none());
        record_loader(&registry);
        assert!(registry.get_metadata("a").is_empty());
    }

    #[test]
    fn test_shared_across_threads() {
        let registry = Arc::new(Registry::default());
        registry.start_collection("a");

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    registry.record_node_execution(
                        &format!("{i}"),
                        "EmptyLatentImage",
                        &inputs(&[("width", json!(512)), ("height", json!(512))]),
                        None,
                    );
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.get_metadata("a").size.len(), 4);
    }
}
