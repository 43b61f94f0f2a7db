use crate::extract::{id, literal, loras, number, text};
use crate::metadata::{Metadata, ModelKind, ModelRecord, PromptRecord};
use crate::value::Inputs;

pub(super) fn checkpoint(node_id: &str, inputs: &Inputs, key: &str, metadata: &mut Metadata) {
    let Some(name) = text(inputs, key) else {
        return;
    };

    tracing::trace!(node_id, name, "checkpoint");

    metadata.models.insert(
        id(node_id),
        ModelRecord {
            node_id: id(node_id),
            name: name.to_string(),
            kind: ModelKind::Checkpoint,
        },
    );
}

/// Loader nodes bundling checkpoint, prompts, one LoRA and the latent size.
pub(super) fn efficient_loader(node_id: &str, inputs: &Inputs, metadata: &mut Metadata) {
    checkpoint(node_id, inputs, "ckpt_name", metadata);

    let positive = text(inputs, "positive");
    let negative = text(inputs, "negative");

    if positive.is_some() || negative.is_some() {
        metadata.prompts.insert(
            id(node_id),
            PromptRecord {
                node_id: id(node_id),
                text: positive.map(str::to_string),
                negative_text: negative.map(str::to_string),
                conditioning: None,
            },
        );
    }

    let width = literal(inputs, "empty_latent_width").and_then(number);
    let height = literal(inputs, "empty_latent_height").and_then(number);

    if let (Some(width), Some(height)) = (width, height) {
        metadata.set_size(node_id, width as u64, height as u64);
    }

    loras::single_with(node_id, inputs, "lora_name", "lora_model_strength", metadata);
}
