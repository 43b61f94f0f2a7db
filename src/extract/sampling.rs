use crate::extract::{LATENT_SCALE, SamplerKind, literal, number};
use crate::metadata::{Metadata, SamplingRecord};
use crate::value::Inputs;

/// Parameters copied from a sampler, as `(input, parameter)` pairs.
const BASIC: &[(&str, &str)] = &[
    ("seed", "seed"),
    ("steps", "steps"),
    ("cfg", "cfg"),
    ("sampler_name", "sampler_name"),
    ("scheduler", "scheduler"),
    ("denoise", "denoise"),
];

const ADVANCED: &[(&str, &str)] = &[
    ("noise_seed", "seed"),
    ("steps", "steps"),
    ("cfg", "cfg"),
    ("sampler_name", "sampler_name"),
    ("scheduler", "scheduler"),
    ("start_at_step", "start_at_step"),
    ("end_at_step", "end_at_step"),
    ("add_noise", "add_noise"),
];

const CUSTOM: &[(&str, &str)] = &[
    ("noise_seed", "seed"),
    ("cfg", "cfg"),
    ("add_noise", "add_noise"),
];

fn copy(record: &mut SamplingRecord, inputs: &Inputs, keys: &[(&str, &str)]) {
    for (input, parameter) in keys {
        if let Some(value) = inputs.get(*input).and_then(|value| value.as_scalar()) {
            record.parameters.insert(parameter.to_string(), value.clone());
        }
    }
}

/// Full samplers, the only primary candidates.
pub(super) fn sampler(node_id: &str, inputs: &Inputs, kind: SamplerKind, metadata: &mut Metadata) {
    let keys = match kind {
        SamplerKind::Basic => BASIC,
        SamplerKind::Advanced => ADVANCED,
        SamplerKind::Custom => CUSTOM,
    };

    let mut record = SamplingRecord::new(node_id, true);
    copy(&mut record, inputs, keys);
    record.positive = inputs.get("positive").and_then(|v| v.as_payload()).cloned();
    record.negative = inputs.get("negative").and_then(|v| v.as_payload()).cloned();

    tracing::trace!(node_id, ?kind, parameters = record.parameters.len(), "sampler");
    metadata.sampling.insert(node_id.to_string(), record);

    let latent = inputs.get("latent_image").and_then(|v| v.as_latent());
    if let Some((width, height)) = latent.and_then(|latent| latent.dimensions()) {
        let scale = |side: usize| (side as u64).saturating_mul(LATENT_SCALE);
        metadata.set_size(node_id, scale(width), scale(height));
    }
}

fn helper(node_id: &str, inputs: &Inputs, keys: &[(&str, &str)], metadata: &mut Metadata) {
    let present = keys
        .iter()
        .any(|(input, _)| inputs.get(*input).and_then(|v| v.as_scalar()).is_some());

    if !present {
        return;
    }

    copy(metadata.sampling_entry(node_id, false), inputs, keys);
}

pub(super) fn noise(node_id: &str, inputs: &Inputs, metadata: &mut Metadata) {
    helper(node_id, inputs, &[("noise_seed", "seed")], metadata);
}

pub(super) fn select(node_id: &str, inputs: &Inputs, metadata: &mut Metadata) {
    helper(node_id, inputs, &[("sampler_name", "sampler_name")], metadata);
}

pub(super) fn scheduler(
    node_id: &str,
    inputs: &Inputs,
    implied: Option<&'static str>,
    metadata: &mut Metadata,
) {
    const KEYS: &[(&str, &str)] = &[
        ("scheduler", "scheduler"),
        ("steps", "steps"),
        ("denoise", "denoise"),
    ];

    helper(node_id, inputs, KEYS, metadata);

    if let Some(name) = implied
        && let Some(record) = metadata.sampling.get_mut(node_id)
    {
        record
            .parameters
            .entry("scheduler".into())
            .or_insert_with(|| name.into());
    }
}

/// Guiders carry cfg and the conditioning for custom samplers.
pub(super) fn guider(node_id: &str, inputs: &Inputs, metadata: &mut Metadata) {
    let positive = inputs
        .get("positive")
        .or_else(|| inputs.get("conditioning"))
        .and_then(|v| v.as_payload())
        .cloned();
    let negative = inputs.get("negative").and_then(|v| v.as_payload()).cloned();
    let cfg = inputs.get("cfg").and_then(|v| v.as_scalar()).cloned();

    if positive.is_none() && negative.is_none() && cfg.is_none() {
        return;
    }

    let record = metadata.sampling_entry(node_id, false);
    if let Some(cfg) = cfg {
        record.parameters.insert("cfg".into(), cfg);
    }
    record.positive = positive;
    record.negative = negative;
}

/// Merges `guidance` into whatever this node already recorded.
pub(super) fn guidance(node_id: &str, inputs: &Inputs, metadata: &mut Metadata) {
    let Some(guidance) = literal(inputs, "guidance").filter(|v| v.is_number()) else {
        return;
    };

    metadata
        .sampling_entry(node_id, false)
        .parameters
        .insert("guidance".into(), guidance.clone());
}

pub(super) fn clip_skip(node_id: &str, inputs: &Inputs, metadata: &mut Metadata) {
    let Some(layer) = literal(inputs, "stop_at_clip_layer").and_then(number) else {
        return;
    };

    metadata
        .sampling_entry(node_id, false)
        .parameters
        .insert("clip_skip".into(), (layer.abs() as i64).into());
}
