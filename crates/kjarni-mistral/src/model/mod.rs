//! Mistral-style decoder-only transformer.

mod block;

pub use block::TransformerBlock;

use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context, Result};
use kjarni_decode::masks::create_attention_mask;
use kjarni_decode::{
    CausalLanguageModel, DynamicNtkRoPE, Embedding, KVCache, LinearLayer, ModelWeights, RMSNorm,
};
use ndarray::{Array3, ArrayView2};

use crate::config::MistralConfig;

/// Precomputed rotary tables some checkpoints ship; the encoding is
/// recomputed at runtime so these are never loaded.
const ROTARY_TABLE_SUFFIX: &str = "self_attn.rotary_emb.inv_freq";

/// Drops tensors the model never reads.
pub fn sanitize(names: impl IntoIterator<Item = String>) -> Vec<String> {
    names
        .into_iter()
        .filter(|name| !name.contains(ROTARY_TABLE_SUFFIX))
        .collect()
}

/// Token embedding, decoder blocks, final norm and LM head.
///
/// Immutable once built; share it between sessions through an `Arc`.
#[derive(Debug)]
pub struct MistralModel {
    config: MistralConfig,
    embed_tokens: Embedding,
    layers: Vec<TransformerBlock>,
    norm: RMSNorm,
    lm_head: LinearLayer,
}

impl MistralModel {
    /// Loads `config.json` and safetensors weights from a model directory.
    pub fn from_pretrained(model_dir: &Path) -> Result<Self> {
        let config = MistralConfig::from_file(&model_dir.join("config.json"))?;
        let weights = ModelWeights::from_safetensors(model_dir)?;
        Self::from_weights(&weights, config)
    }

    pub fn from_weights(weights: &ModelWeights, config: MistralConfig) -> Result<Self> {
        config.validate()?;
        let head_dim = config.resolved_head_dim();
        log::info!(
            "building {} model: {} layers, {} heads ({} kv), head_dim {}, vocab {}",
            if config.model_type.is_empty() { "mistral" } else { config.model_type.as_str() },
            config.num_hidden_layers,
            config.num_attention_heads,
            config.kv_heads(),
            head_dim,
            config.vocab_size
        );

        let rope = DynamicNtkRoPE::new(
            head_dim,
            config.max_position_embeddings,
            config.rope_traditional,
            config.rope_theta,
            1.0,
            config.rope_type(),
            config.rope_scaling.as_ref(),
        )?;

        let embed_tokens = Embedding::new(weights.get_array2("model.embed_tokens.weight")?);
        if embed_tokens.vocab_size() != config.vocab_size
            || embed_tokens.hidden_size() != config.hidden_size
        {
            bail!(
                "embedding table is {}x{}, config expects {}x{}",
                embed_tokens.vocab_size(),
                embed_tokens.hidden_size(),
                config.vocab_size,
                config.hidden_size
            );
        }

        let layers = (0..config.num_hidden_layers)
            .map(|i| {
                TransformerBlock::from_weights(weights, &config, i, &rope)
                    .with_context(|| format!("failed to load layer {i}"))
            })
            .collect::<Result<Vec<_>>>()?;

        let norm = RMSNorm::new(weights.get_array1("model.norm.weight")?, config.rms_norm_eps);
        let lm_head = if config.tie_word_embeddings {
            embed_tokens.as_linear()
        } else {
            LinearLayer::from_weights(weights, "lm_head", false)?
        };
        if lm_head.out_features() != config.vocab_size {
            bail!(
                "lm_head produces {} logits, config expects {}",
                lm_head.out_features(),
                config.vocab_size
            );
        }

        let expected: HashSet<String> = Self::tensor_names(&config).into_iter().collect();
        let unused: Vec<String> = sanitize(weights.tensor_names())
            .into_iter()
            .filter(|name| !expected.contains(name))
            .collect();
        if !unused.is_empty() {
            log::warn!("{} tensors were not used: {:?}", unused.len(), unused);
        }

        Ok(Self {
            config,
            embed_tokens,
            layers,
            norm,
            lm_head,
        })
    }

    /// Every tensor name the model reads for `config`.
    pub fn tensor_names(config: &MistralConfig) -> Vec<String> {
        let mut names = vec!["model.embed_tokens.weight".to_string()];
        for i in 0..config.num_hidden_layers {
            for proj in ["q_proj", "k_proj", "v_proj", "o_proj"] {
                names.push(format!("model.layers.{i}.self_attn.{proj}.weight"));
                if config.attention_bias {
                    names.push(format!("model.layers.{i}.self_attn.{proj}.bias"));
                }
            }
            for proj in ["gate_proj", "up_proj", "down_proj"] {
                names.push(format!("model.layers.{i}.mlp.{proj}.weight"));
                if config.mlp_bias {
                    names.push(format!("model.layers.{i}.mlp.{proj}.bias"));
                }
            }
            names.push(format!("model.layers.{i}.input_layernorm.weight"));
            names.push(format!("model.layers.{i}.post_attention_layernorm.weight"));
        }
        names.push("model.norm.weight".to_string());
        if !config.tie_word_embeddings {
            names.push("lm_head.weight".to_string());
        }
        names
    }

    pub fn config(&self) -> &MistralConfig {
        &self.config
    }
}

impl CausalLanguageModel for MistralModel {
    fn forward(
        &self,
        tokens: ArrayView2<'_, u32>,
        cache: Option<&mut [KVCache]>,
    ) -> Result<Array3<f32>> {
        let seq_len = tokens.ncols();
        if seq_len == 0 {
            bail!("forward called with no tokens");
        }
        let mut hidden = self.embed_tokens.forward(tokens)?;

        match cache {
            Some(cache) => {
                if cache.len() != self.layers.len() {
                    bail!(
                        "cache has {} layers, model has {}",
                        cache.len(),
                        self.layers.len()
                    );
                }
                let offset = cache.first().map_or(0, KVCache::offset);
                let mask = create_attention_mask(seq_len, offset);
                for (layer, layer_cache) in self.layers.iter().zip(cache.iter_mut()) {
                    hidden = layer.forward(&hidden, mask.as_ref(), Some(layer_cache))?;
                }
            }
            None => {
                let mask = create_attention_mask(seq_len, 0);
                for layer in &self.layers {
                    hidden = layer.forward(&hidden, mask.as_ref(), None)?;
                }
            }
        }

        self.lm_head.forward_3d(&self.norm.forward_3d(&hidden))
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn num_layers(&self) -> usize {
        self.layers.len()
    }

    fn num_kv_heads(&self) -> usize {
        self.config.kv_heads()
    }

    fn head_dim(&self) -> usize {
        self.config.resolved_head_dim()
    }
}
