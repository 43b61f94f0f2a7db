use serde_json::Value as Json;

use crate::extract::{id, literal, model_stem, number, round2, text};
use crate::metadata::{LoraEntry, LoraRecord, Metadata};
use crate::value::Inputs;

/// Key under which newer widget versions wrap the LoRA list.
const WRAPPED: &str = "__value__";

pub(super) fn single(node_id: &str, inputs: &Inputs, metadata: &mut Metadata) {
    single_with(node_id, inputs, "lora_name", "strength_model", metadata);
}

pub(super) fn single_with(
    node_id: &str,
    inputs: &Inputs,
    name_key: &str,
    strength_key: &str,
    metadata: &mut Metadata,
) {
    let Some(name) = text(inputs, name_key).filter(|name| is_named(name)) else {
        return;
    };
    let Some(strength) = literal(inputs, strength_key).and_then(number) else {
        return;
    };

    let entry = LoraEntry {
        name: model_stem(name).to_string(),
        strength: round2(strength),
    };

    write(node_id, vec![entry], metadata);
}

/// LoRA list widgets, optionally chained after an upstream stack.
///
/// Entries of the upstream `lora_stack` come first since they were applied
/// earlier in the chain.
pub(super) fn stack(node_id: &str, inputs: &Inputs, metadata: &mut Metadata) {
    let upstream = literal(inputs, "lora_stack").map(stack_entries);
    let own = literal(inputs, "loras").and_then(widget_entries);

    if upstream.is_none() && own.is_none() {
        return;
    }

    let list: Vec<_> = upstream
        .into_iter()
        .flatten()
        .chain(own.into_iter().flatten())
        .collect();

    if list.is_empty() {
        return;
    }

    write(node_id, list, metadata);
}

fn write(node_id: &str, lora_list: Vec<LoraEntry>, metadata: &mut Metadata) {
    tracing::trace!(node_id, count = lora_list.len(), "loras");

    metadata.loras.insert(
        id(node_id),
        LoraRecord {
            node_id: id(node_id),
            lora_list,
        },
    );
}

/// Accepts both a bare list and a `{"__value__": [...]}` wrapper.
fn widget_entries(value: &Json) -> Option<Vec<LoraEntry>> {
    let items = match value {
        Json::Array(items) => items,
        Json::Object(map) => map.get(WRAPPED)?.as_array()?,
        _ => return None,
    };

    Some(items.iter().filter_map(widget_entry).collect())
}

fn widget_entry(item: &Json) -> Option<LoraEntry> {
    let active = item.get("active").and_then(Json::as_bool).unwrap_or(true);
    let dummy = item.get("_isDummy").and_then(Json::as_bool).unwrap_or(false);

    if !active || dummy {
        return None;
    }

    let name = item.get("name")?.as_str().filter(|name| is_named(name))?;
    let strength = item.get("strength").and_then(number).unwrap_or(1.0);

    Some(LoraEntry {
        name: model_stem(name).to_string(),
        strength: round2(strength),
    })
}

/// Stack tuples of `[path, model_strength, clip_strength]`.
fn stack_entries(value: &Json) -> Vec<LoraEntry> {
    let Some(items) = value.as_array() else {
        return vec![];
    };

    items
        .iter()
        .filter_map(|item| {
            let tuple = item.as_array()?;
            let name = tuple.first()?.as_str().filter(|name| is_named(name))?;
            let strength = tuple.get(1).and_then(number)?;

            Some(LoraEntry {
                name: model_stem(name).to_string(),
                strength: round2(strength),
            })
        })
        .collect()
}

fn is_named(name: &str) -> bool {
    let name = name.trim();
    !name.is_empty() && name != "None"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{Extractor, json_inputs as inputs};
    use serde_json::json;

    fn names(metadata: &Metadata, node_id: &str) -> Vec<(String, f64)> {
        metadata.loras[node_id]
            .lora_list
            .iter()
            .map(|entry| (entry.name.clone(), entry.strength))
            .collect()
    }

    #[test]
    fn test_lora_loader() {
        let mut metadata = Metadata::default();
        let inputs = inputs(&[
            ("lora_name", json!("styles/my-lora.safetensors")),
            ("strength_model", json!(0.6000000238418579)),
            ("strength_clip", json!(1.0)),
        ]);
        Extractor::for_class("LoraLoader").extract("10", &inputs, None, &mut metadata);

        assert_eq!(names(&metadata, "10"), vec![("my-lora".to_string(), 0.6)]);
        assert_eq!(metadata.loras["10"].node_id, "10");
    }

    #[test]
    fn test_lora_loader_missing_strength() {
        let mut metadata = Metadata::default();
        let inputs = inputs(&[("lora_name", json!("a.safetensors"))]);
        Extractor::for_class("LoraLoaderModelOnly").extract("10", &inputs, None, &mut metadata);
        assert!(metadata.loras.is_empty());
    }

    #[test]
    fn test_bare_list_shape() {
        let mut metadata = Metadata::default();
        let inputs = inputs(&[(
            "loras",
            json!([
                { "name": "first", "strength": 0.8, "active": true },
                { "name": "off", "strength": 1.0, "active": false },
                { "name": "second.safetensors", "strength": "0.456" }
            ]),
        )]);
        Extractor::for_class("Lora Loader (LoraManager)").extract("7", &inputs, None, &mut metadata);

        assert_eq!(
            names(&metadata, "7"),
            vec![("first".to_string(), 0.8), ("second".to_string(), 0.46)]
        );
    }

    #[test]
    fn test_wrapped_shape_skips_placeholders() {
        let mut metadata = Metadata::default();
        let inputs = inputs(&[(
            "loras",
            json!({
                "__value__": [
                    { "name": "", "strength": 1.0, "_isDummy": true },
                    { "name": "kept", "strength": 0.5, "active": true },
                    { "name": "ghost", "strength": 0.5, "_isDummy": true }
                ]
            }),
        )]);
        Extractor::for_class("Lora Stacker (LoraManager)").extract("7", &inputs, None, &mut metadata);

        assert_eq!(names(&metadata, "7"), vec![("kept".to_string(), 0.5)]);
    }

    #[test]
    fn test_upstream_stack_comes_first() {
        let mut metadata = Metadata::default();
        let inputs = inputs(&[
            ("lora_stack", json!([["loras/base.safetensors", 0.7, 0.7]])),
            ("loras", json!([{ "name": "top", "strength": 1.0 }])),
        ]);
        Extractor::for_class("Lora Loader (LoraManager)").extract("7", &inputs, None, &mut metadata);

        assert_eq!(
            names(&metadata, "7"),
            vec![("base".to_string(), 0.7), ("top".to_string(), 1.0)]
        );
    }

    #[test]
    fn test_all_inactive_writes_nothing() {
        let mut metadata = Metadata::default();
        let inputs = inputs(&[("loras", json!([{ "name": "off", "strength": 1.0, "active": false }]))]);
        Extractor::for_class("Lora Loader (LoraManager)").extract("7", &inputs, None, &mut metadata);
        assert!(metadata.loras.is_empty());
    }
}
