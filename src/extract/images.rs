use crate::extract::{id, literal, number};
use crate::metadata::{ImageRecord, Metadata};
use crate::value::{Inputs, Outputs};

pub(super) fn latent_size(node_id: &str, inputs: &Inputs, metadata: &mut Metadata) {
    let width = literal(inputs, "width").and_then(number);
    let height = literal(inputs, "height").and_then(number);

    if let (Some(width), Some(height)) = (width, height) {
        metadata.set_size(node_id, width as u64, height as u64);
    }
}

pub(super) fn decoded(node_id: &str, outputs: &Outputs, metadata: &mut Metadata) {
    let Some(image) = outputs.first().and_then(|value| value.as_payload()) else {
        return;
    };

    let first = metadata.images.first_decode.is_none();
    tracing::trace!(node_id, first, "decoded image");

    metadata.images.insert(ImageRecord {
        node_id: id(node_id),
        image: image.clone(),
    });
}
