//! Tiny randomly initialized checkpoints for unit tests.

use std::fs;
use std::path::Path;

use kjarni_decode::weights::{InMemoryWeights, WeightLoader};
use ndarray::{ArrayD, IxDyn};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use safetensors::tensor::TensorView;
use safetensors::Dtype;
use tokenizers::Tokenizer;

use crate::config::MistralConfig;
use crate::model::MistralModel;

pub(crate) const TINY_VOCAB: usize = 11;

pub(crate) fn tiny_config_json(tied: bool) -> String {
    format!(
        r#"{{
            "hidden_size": 16, "num_hidden_layers": 2, "num_attention_heads": 4,
            "num_key_value_heads": 2, "intermediate_size": 24, "vocab_size": {TINY_VOCAB},
            "max_position_embeddings": 8, "tie_word_embeddings": {tied},
            "eos_token_id": 10
        }}"#
    )
}

pub(crate) fn tiny_config(tied: bool) -> MistralConfig {
    MistralConfig::from_json(&tiny_config_json(tied)).unwrap()
}

/// Word-level tokenizer over `<unk>`, `w1`..`w9` and `</s>`, matching [`TINY_VOCAB`].
pub(crate) fn tiny_tokenizer_json() -> String {
    let mut vocab = serde_json::Map::new();
    vocab.insert("<unk>".into(), 0.into());
    for i in 1..TINY_VOCAB - 1 {
        vocab.insert(format!("w{i}"), i.into());
    }
    vocab.insert("</s>".into(), (TINY_VOCAB - 1).into());
    serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": { "type": "Whitespace" },
        "post_processor": null,
        "decoder": null,
        "model": { "type": "WordLevel", "vocab": vocab, "unk_token": "<unk>" }
    })
    .to_string()
}

pub(crate) fn tiny_tokenizer() -> Tokenizer {
    tiny_tokenizer_json().parse().unwrap()
}

/// BPE tokenizer with byte fallback: `<0xE2>`, `<0x82>` and `<0xAC>` (ids
/// 1..=3) spell "€"; id 4 is `a`.
pub(crate) fn byte_fallback_tokenizer() -> Tokenizer {
    serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": null,
        "post_processor": null,
        "decoder": {
            "type": "Sequence",
            "decoders": [{ "type": "ByteFallback" }, { "type": "Fuse" }]
        },
        "model": {
            "type": "BPE",
            "dropout": null,
            "unk_token": "<unk>",
            "continuing_subword_prefix": null,
            "end_of_word_suffix": null,
            "fuse_unk": false,
            "byte_fallback": true,
            "ignore_merges": false,
            "vocab": { "<unk>": 0, "<0xE2>": 1, "<0x82>": 2, "<0xAC>": 3, "a": 4 },
            "merges": []
        }
    })
    .to_string()
    .parse()
    .unwrap()
}

/// Writes `config.json`, `model.safetensors` and `tokenizer.json` into `dir`.
pub(crate) fn write_checkpoint(dir: &Path, tied: bool, weights: &InMemoryWeights) {
    fs::write(dir.join("config.json"), tiny_config_json(tied)).unwrap();
    fs::write(dir.join("tokenizer.json"), tiny_tokenizer_json()).unwrap();

    let mut names = weights.tensor_names();
    names.sort();
    let buffers: Vec<(String, Vec<usize>, Vec<u8>)> = names
        .into_iter()
        .map(|name| {
            let tensor = weights.get_array(&name).unwrap();
            let bytes = tensor.iter().flat_map(|v| v.to_le_bytes()).collect();
            (name, tensor.shape().to_vec(), bytes)
        })
        .collect();
    let views: Vec<(&str, TensorView<'_>)> = buffers
        .iter()
        .map(|(name, shape, bytes)| {
            (name.as_str(), TensorView::new(Dtype::F32, shape.clone(), bytes).unwrap())
        })
        .collect();
    safetensors::serialize_to_file(views, &None, &dir.join("model.safetensors")).unwrap();
}

fn shape_for(name: &str, config: &MistralConfig) -> Vec<usize> {
    let hidden = config.hidden_size;
    let q_out = config.num_attention_heads * config.resolved_head_dim();
    let kv_out = config.kv_heads() * config.resolved_head_dim();
    match name.rsplit('.').nth(1).unwrap_or_default() {
        "embed_tokens" | "lm_head" => vec![config.vocab_size, hidden],
        "q_proj" => vec![q_out, hidden],
        "k_proj" | "v_proj" => vec![kv_out, hidden],
        "o_proj" => vec![hidden, q_out],
        "gate_proj" | "up_proj" => vec![config.intermediate_size, hidden],
        "down_proj" => vec![hidden, config.intermediate_size],
        _ => vec![hidden],
    }
}

pub(crate) fn random_weights(config: &MistralConfig, seed: u64) -> InMemoryWeights {
    let mut rng = StdRng::seed_from_u64(seed);
    MistralModel::tensor_names(config)
        .into_iter()
        .map(|name| {
            let shape = shape_for(&name, config);
            let tensor = if name.ends_with("norm.weight") {
                ArrayD::ones(IxDyn(&shape))
            } else {
                ArrayD::random_using(IxDyn(&shape), Uniform::new(-0.3f32, 0.3), &mut rng)
            };
            (name, tensor)
        })
        .collect()
}
