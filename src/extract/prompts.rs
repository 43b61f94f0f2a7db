use crate::extract::{DualEncoder, id, literal, text as text_input};
use crate::metadata::{Metadata, PromptRecord};
use crate::value::{Inputs, Outputs};

pub(super) fn text(node_id: &str, inputs: &Inputs, metadata: &mut Metadata) {
    let Some(text) = text_input(inputs, "text") else {
        return;
    };

    write(node_id, text.to_string(), metadata);
}

/// Two-encoder prompt nodes.
///
/// With one side empty the other side is taken verbatim. With both sides
/// filled the text becomes a JSON object, so each part can be recovered.
pub(super) fn dual(node_id: &str, inputs: &Inputs, kind: DualEncoder, metadata: &mut Metadata) {
    let (primary_key, primary_label, secondary_key, secondary_label) = match kind {
        DualEncoder::Flux => ("t5xxl", "T5", "clip_l", "CLIP-L"),
        DualEncoder::Sdxl => ("text_g", "G", "text_l", "L"),
    };

    let primary = text_input(inputs, primary_key);
    let secondary = text_input(inputs, secondary_key);

    if primary.is_none() && secondary.is_none() {
        return;
    }

    let primary = primary.unwrap_or_default();
    let secondary = secondary.unwrap_or_default();

    let text = match (primary.trim().is_empty(), secondary.trim().is_empty()) {
        (true, _) => secondary.to_string(),
        (false, true) => primary.to_string(),
        (false, false) => {
            let mut parts = serde_json::Map::new();
            parts.insert(primary_label.into(), primary.into());
            parts.insert(secondary_label.into(), secondary.into());
            serde_json::Value::Object(parts).to_string()
        }
    };

    write(node_id, text, metadata);

    if let (DualEncoder::Flux, Some(guidance)) = (kind, literal(inputs, "guidance")) {
        metadata
            .sampling_entry(node_id, false)
            .parameters
            .insert("guidance".into(), guidance.clone());
    }
}

fn write(node_id: &str, text: String, metadata: &mut Metadata) {
    tracing::trace!(node_id, len = text.len(), "prompt");

    let record = metadata
        .prompts
        .entry(id(node_id))
        .or_insert_with(|| PromptRecord {
            node_id: id(node_id),
            ..Default::default()
        });

    record.text = Some(text);
}

/// Links the produced conditioning to the prompt written by `extract`.
pub(super) fn link_conditioning(node_id: &str, outputs: &Outputs, metadata: &mut Metadata) {
    let Some(record) = metadata.prompts.get_mut(node_id) else {
        return;
    };

    if let Some(payload) = outputs.first().and_then(|value| value.as_payload()) {
        record.conditioning = Some(payload.clone());
    }
}
