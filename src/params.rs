//! Flat generation parameters, assembled from the records of one run.
//!
//! Every field is optional. A field that cannot be resolved, because the
//! workflow never produced it or the graph does not connect it to the final
//! image, is left out rather than guessed.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;

use crate::graph::Workflow;
use crate::metadata::{Metadata, PromptRecord, SamplingRecord, SizeRecord};
use crate::tracer::{Origin, Tracer};
use crate::value::{Payload, same_payload};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GenerationParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steps: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cfg_scale: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guidance: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denoise: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clip_skip: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampler: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<String>,
    /// Space separated `<lora:name:strength>` tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loras: Option<String>,
    /// `{width}x{height}`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
}

impl GenerationParams {
    /// Every resolved field rendered as a string.
    pub fn to_dict(&self) -> BTreeMap<String, String> {
        let Ok(serde_json::Value::Object(fields)) = serde_json::to_value(self) else {
            return BTreeMap::new();
        };

        fields
            .into_iter()
            .filter_map(|(key, value)| match value {
                serde_json::Value::Null => None,
                serde_json::Value::String(text) => Some((key, text)),
                other => Some((key, other.to_string())),
            })
            .collect()
    }
}

/// Resolution context for a single run.
struct Resolver<'m> {
    tracer: Tracer,
    metadata: &'m Metadata,
    graph: Option<&'m Workflow>,
    sampler: Option<(&'m str, &'m SamplingRecord)>,
    /// Nodes upstream of the sampler, nearest first.
    upstream: Vec<&'m str>,
}

impl<'m> Resolver<'m> {
    fn new(tracer: Tracer, metadata: &'m Metadata, anchor: Option<&str>) -> Self {
        let graph = metadata.graph();

        // An anchor which reaches no sampler falls back to the latest one.
        let sampler = tracer
            .find_primary_sampler(metadata, anchor)
            .or_else(|| anchor.and_then(|_| tracer.find_primary_sampler(metadata, None)));

        let upstream = match (graph, sampler) {
            (Some(graph), Some((id, _))) => tracer.reachable(graph, id),
            _ => vec![],
        };

        Self {
            tracer,
            metadata,
            graph,
            sampler,
            upstream,
        }
    }

    /// Node ids in execution order, then every other recorded id.
    fn encounter_order<'a, V>(&self, records: &'a BTreeMap<String, V>) -> Vec<&'a str>
    where
        'm: 'a,
    {
        let mut seen = HashSet::new();
        let executed = self.metadata.execution_order.iter().map(String::as_str);
        let recorded = records.keys().map(String::as_str);

        executed
            .chain(recorded)
            .filter(|id| seen.insert(*id))
            .filter_map(|id| records.get_key_value(id).map(|(key, _)| key.as_str()))
            .collect()
    }

    /// Helper records which are not primary samplers, nearest first.
    fn helpers(&self) -> Vec<&'m SamplingRecord> {
        let sampling = &self.metadata.sampling;
        let is_helper = |record: &&SamplingRecord| !record.is_primary_candidate;

        let near = self
            .upstream
            .iter()
            .filter_map(|id| sampling.get(*id))
            .filter(is_helper);

        let rest = self
            .encounter_order(sampling)
            .into_iter()
            .filter_map(|id| sampling.get(id))
            .filter(is_helper);

        near.chain(rest).collect()
    }

    /// A sampler parameter, from the primary record first, then helpers.
    fn parameter(&self, helpers: &[&'m SamplingRecord], key: &str) -> Option<serde_json::Value> {
        self.sampler
            .and_then(|(_, record)| record.get(key))
            .or_else(|| helpers.iter().find_map(|record| record.get(key)))
            .cloned()
    }

    /// Conditioning payloads feeding the sampler on `input`.
    fn conditioning(&self, helpers: &[&'m SamplingRecord], negative: bool) -> Option<&'m Payload> {
        let pick = |record: &'m SamplingRecord| {
            if negative {
                record.negative.as_ref()
            } else {
                record.positive.as_ref()
            }
        };

        self.sampler
            .and_then(|(_, record)| pick(record))
            .or_else(|| helpers.iter().find_map(|record| pick(*record)))
    }

    /// Prompt record wired into `input` of the sampler, or of its guider.
    fn traced_prompt(&self, input: &str) -> Option<&'m PromptRecord> {
        let graph = self.graph?;
        let (sampler, _) = self.sampler?;
        let prompts = &self.metadata.prompts;
        let is_prompt = |id: &str| prompts.contains_key(id);

        let node = graph.get(sampler)?;
        let found = if node.inputs.contains_key(input) {
            self.tracer.trace_input_until(graph, sampler, input, is_prompt)
        } else {
            let (guider, _) = node.inputs.get("guider")?.as_reference()?;

            self.tracer
                .trace_input_until(graph, guider, input, is_prompt)
                .or_else(|| match input {
                    "positive" => self.tracer.trace_input_until(graph, guider, "conditioning", is_prompt),
                    _ => None,
                })
        };

        prompts.get(found?)
    }

    fn matched_prompt(&self, payload: Option<&Payload>) -> Option<&'m PromptRecord> {
        let payload = payload?;
        self.metadata
            .prompts
            .values()
            .find(|record| same_payload(record.conditioning.as_ref(), Some(payload)))
    }

    fn is_negative_hint(&self, record: &PromptRecord) -> bool {
        let title = self
            .graph
            .and_then(|graph| graph.get(&record.node_id))
            .and_then(|node| node.title.as_deref());

        title.is_some_and(|title| title.to_lowercase().contains("negative"))
    }

    fn prompts(&self, helpers: &[&'m SamplingRecord]) -> (Option<String>, Option<String>) {
        let positive = self
            .traced_prompt("positive")
            .or_else(|| self.matched_prompt(self.conditioning(helpers, false)));
        let negative = self
            .traced_prompt("negative")
            .or_else(|| self.matched_prompt(self.conditioning(helpers, true)));

        let mut prompt = positive.and_then(|record| record.text.clone());
        let mut negative_prompt = negative.and_then(negative_text);

        // Last resort, without any wiring to go by.
        if prompt.is_none() || negative_prompt.is_none() {
            let prompts = &self.metadata.prompts;

            for id in self.encounter_order(prompts) {
                let record = &prompts[id];

                if self.is_negative_hint(record) {
                    if negative_prompt.is_none() {
                        negative_prompt = negative_text(record);
                    }
                    continue;
                }

                if prompt.is_none() {
                    prompt = record.text.clone();
                }
                if negative_prompt.is_none() {
                    negative_prompt = record.negative_text.clone();
                }
            }
        }

        (prompt, negative_prompt)
    }

    fn loras(&self) -> Option<String> {
        let reachable: Option<HashSet<&str>> = match (self.graph, self.sampler) {
            (Some(_), Some(_)) => Some(self.upstream.iter().copied().collect()),
            _ => None,
        };

        let loras = &self.metadata.loras;
        let tokens: Vec<String> = self
            .encounter_order(loras)
            .into_iter()
            .filter(|id| reachable.as_ref().is_none_or(|set| set.contains(id)))
            .flat_map(|id| &loras[id].lora_list)
            .map(|entry| format!("<lora:{}:{}>", entry.name, strength(entry.strength)))
            .collect();

        (!tokens.is_empty()).then(|| tokens.join(" "))
    }

    fn size(&self) -> Option<String> {
        let sizes = &self.metadata.size;

        let own = self.sampler.and_then(|(id, _)| sizes.get(id));
        let near = || self.upstream.iter().find_map(|id| sizes.get(*id));
        let any = || {
            self.encounter_order(sizes)
                .into_iter()
                .find_map(|id| sizes.get(id))
        };

        own.or_else(near)
            .or_else(any)
            .map(|SizeRecord { width, height, .. }| format!("{width}x{height}"))
    }

    fn checkpoint(&self) -> Option<String> {
        let origin = match self.sampler {
            Some((id, _)) => Origin::Sampler(id),
            None => Origin::Latest,
        };

        self.tracer.find_primary_checkpoint(self.metadata, origin)
    }

    fn resolve(&self) -> GenerationParams {
        let helpers = self.helpers();
        let text = |value: serde_json::Value| match value {
            serde_json::Value::String(text) => text,
            other => other.to_string(),
        };

        let (prompt, negative_prompt) = self.prompts(&helpers);

        GenerationParams {
            prompt,
            negative_prompt,
            seed: self.parameter(&helpers, "seed"),
            steps: self.parameter(&helpers, "steps"),
            cfg_scale: self.parameter(&helpers, "cfg"),
            guidance: self.parameter(&helpers, "guidance"),
            denoise: self.parameter(&helpers, "denoise"),
            clip_skip: self.parameter(&helpers, "clip_skip"),
            sampler: self.parameter(&helpers, "sampler_name").map(text),
            scheduler: self.parameter(&helpers, "scheduler").map(text),
            checkpoint: self.checkpoint(),
            loras: self.loras(),
            size: self.size(),
        }
    }
}

fn negative_text(record: &PromptRecord) -> Option<String> {
    record.negative_text.clone().or_else(|| record.text.clone())
}

/// Whole strengths keep one decimal, so `1` reads `1.0`.
fn strength(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{value:.1}")
    } else {
        value.to_string()
    }
}

impl Tracer {
    /// Parameters of the image produced downstream of `anchor`.
    ///
    /// Without an anchor the first decoded image of the run is used.
    pub fn generation_params(&self, metadata: &Metadata, anchor: Option<&str>) -> GenerationParams {
        let first_decode = metadata
            .images
            .first_decode
            .as_ref()
            .map(|record| record.node_id.as_str());

        let resolver = Resolver::new(*self, metadata, anchor.or(first_decode));
        let params = resolver.resolve();

        tracing::debug!(
            sampler = resolver.sampler.map(|(id, _)| id),
            checkpoint = params.checkpoint.as_deref(),
            "resolved generation parameters"
        );

        params
    }
}

pub fn extract_generation_params(metadata: &Metadata) -> GenerationParams {
    Tracer::default().generation_params(metadata, None)
}

pub fn to_dict(metadata: &Metadata) -> BTreeMap<String, String> {
    extract_generation_params(metadata).to_dict()
}
