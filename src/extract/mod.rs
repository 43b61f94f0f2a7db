//! Per-class extraction strategies.
//!
//! Every node class the collector understands maps to one [`Extractor`]
//! variant. Unknown classes map to [`Extractor::Noop`], so observing an
//! arbitrary graph is always safe.
//!
//! Extraction happens in two steps:
//! * [`Extractor::extract`] runs once the host has resolved the node inputs,
//!   before the node itself executes.
//! * [`Extractor::update`] runs after the node produced its outputs, for data
//!   that only exists post-execution (conditioning, decoded images).
//!
//! Extractors only read the input keys they know about. A missing or mistyped
//! key never raises, the extractor writes less or nothing at all.

mod images;
mod loras;
mod models;
mod prompts;
mod sampling;

use crate::graph::NodeId;
use crate::metadata::Metadata;
use crate::value::{Inputs, Outputs};

/// Pixels per latent cell along each axis.
pub const LATENT_SCALE: u64 = 8;

/// Flavour of a full sampler node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerKind {
    /// `KSampler`
    Basic,
    /// `KSamplerAdvanced`
    Advanced,
    /// `SamplerCustom`, `SamplerCustomAdvanced`
    Custom,
}

/// Input pair of a two-encoder prompt node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DualEncoder {
    /// `clip_l` + `t5xxl`
    Flux,
    /// `text_l` + `text_g`
    Sdxl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extractor {
    /// Checkpoint or diffusion model loader reading the given input.
    Checkpoint(&'static str),
    /// All-in-one loader carrying checkpoint, prompts, LoRA and size.
    EfficientLoader,
    Lora,
    LoraStack,
    TextEncode,
    DualTextEncode(DualEncoder),
    Sampler(SamplerKind),
    Noise,
    SamplerSelect,
    /// Sigma scheduler, with the scheduler name implied by the class if any.
    Scheduler(Option<&'static str>),
    Guider,
    Guidance,
    ClipSkip,
    LatentSize,
    Decode,
    Noop,
}

impl Extractor {
    pub fn for_class(class_name: &str) -> Self {
        match class_name {
            "CheckpointLoaderSimple" | "CheckpointLoader" | "ImageOnlyCheckpointLoader" => {
                Extractor::Checkpoint("ckpt_name")
            }
            "UNETLoader" | "UnetLoaderGGUF" => Extractor::Checkpoint("unet_name"),
            "Efficient Loader" => Extractor::EfficientLoader,
            "LoraLoader" | "LoraLoaderModelOnly" => Extractor::Lora,
            "Lora Loader (LoraManager)" | "Lora Stacker (LoraManager)" => Extractor::LoraStack,
            "CLIPTextEncode" => Extractor::TextEncode,
            "CLIPTextEncodeFlux" => Extractor::DualTextEncode(DualEncoder::Flux),
            "CLIPTextEncodeSDXL" => Extractor::DualTextEncode(DualEncoder::Sdxl),
            "KSampler" => Extractor::Sampler(SamplerKind::Basic),
            "KSamplerAdvanced" => Extractor::Sampler(SamplerKind::Advanced),
            "SamplerCustom" | "SamplerCustomAdvanced" => Extractor::Sampler(SamplerKind::Custom),
            "RandomNoise" => Extractor::Noise,
            "KSamplerSelect" => Extractor::SamplerSelect,
            "BasicScheduler" => Extractor::Scheduler(None),
            "KarrasScheduler" => Extractor::Scheduler(Some("karras")),
            "ExponentialScheduler" => Extractor::Scheduler(Some("exponential")),
            "AlignYourStepsScheduler" => Extractor::Scheduler(Some("align_your_steps")),
            "CFGGuider" | "BasicGuider" => Extractor::Guider,
            "FluxGuidance" => Extractor::Guidance,
            "CLIPSetLastLayer" => Extractor::ClipSkip,
            "EmptyLatentImage" | "EmptySD3LatentImage" => Extractor::LatentSize,
            "VAEDecode" | "VAEDecodeTiled" => Extractor::Decode,
            _ => Extractor::Noop,
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, Extractor::Noop)
    }

    /// Reads resolved inputs, and outputs when already known.
    pub fn extract(
        &self,
        node_id: &str,
        inputs: &Inputs,
        outputs: Option<&Outputs>,
        metadata: &mut Metadata,
    ) {
        match *self {
            Extractor::Checkpoint(key) => models::checkpoint(node_id, inputs, key, metadata),
            Extractor::EfficientLoader => models::efficient_loader(node_id, inputs, metadata),
            Extractor::Lora => loras::single(node_id, inputs, metadata),
            Extractor::LoraStack => loras::stack(node_id, inputs, metadata),
            Extractor::TextEncode => prompts::text(node_id, inputs, metadata),
            Extractor::DualTextEncode(kind) => prompts::dual(node_id, inputs, kind, metadata),
            Extractor::Sampler(kind) => sampling::sampler(node_id, inputs, kind, metadata),
            Extractor::Noise => sampling::noise(node_id, inputs, metadata),
            Extractor::SamplerSelect => sampling::select(node_id, inputs, metadata),
            Extractor::Scheduler(name) => sampling::scheduler(node_id, inputs, name, metadata),
            Extractor::Guider => sampling::guider(node_id, inputs, metadata),
            Extractor::Guidance => sampling::guidance(node_id, inputs, metadata),
            Extractor::ClipSkip => sampling::clip_skip(node_id, inputs, metadata),
            Extractor::LatentSize => images::latent_size(node_id, inputs, metadata),
            Extractor::Decode | Extractor::Noop => {}
        }

        if let Some(outputs) = outputs {
            self.update(node_id, outputs, metadata);
        }
    }

    /// Reads outputs once the node has executed.
    pub fn update(&self, node_id: &str, outputs: &Outputs, metadata: &mut Metadata) {
        match *self {
            Extractor::TextEncode | Extractor::DualTextEncode(_) => {
                prompts::link_conditioning(node_id, outputs, metadata)
            }
            Extractor::Decode => images::decoded(node_id, outputs, metadata),
            _ => {}
        }
    }
}

fn literal<'a>(inputs: &'a Inputs, key: &str) -> Option<&'a serde_json::Value> {
    inputs.get(key).and_then(|value| value.as_json())
}

fn text<'a>(inputs: &'a Inputs, key: &str) -> Option<&'a str> {
    inputs.get(key).and_then(|value| value.as_str())
}

/// Numbers, also when the host hands them over as strings.
fn number(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// File stem of a model path, without directories or extension.
pub(crate) fn model_stem(path: &str) -> &str {
    let file = path.rsplit(['/', '\\']).next().unwrap_or(path);

    match file.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => file,
    }
}

/// Node ids are owned strings in records.
fn id(node_id: &str) -> NodeId {
    node_id.to_string()
}

#[cfg(test)]
pub(crate) fn json_inputs(pairs: &[(&str, serde_json::Value)]) -> Inputs {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), crate::value::Value::from(value.clone())))
        .collect()
}
