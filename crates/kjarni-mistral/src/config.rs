//! Hugging Face `config.json` for Mistral-family checkpoints.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use kjarni_decode::rope::{rope_type, RopeScaling};
use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::Deserialize;

fn deserialize_token_ids<'de, D>(deserializer: D) -> Result<Vec<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    struct TokenIdsVisitor;
    impl<'de> Visitor<'de> for TokenIdsVisitor {
        type Value = Vec<u32>;
        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.write_str("a token id, an array of token ids, or null")
        }
        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
            u32::try_from(v).map(|id| vec![id]).map_err(E::custom)
        }
        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
            u32::try_from(v).map(|id| vec![id]).map_err(E::custom)
        }
        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(Vec::new())
        }
        fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(Vec::new())
        }
        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let mut ids = Vec::new();
            while let Some(id) = seq.next_element::<u32>()? {
                ids.push(id);
            }
            Ok(ids)
        }
    }
    deserializer.deserialize_any(TokenIdsVisitor)
}

fn default_rms_norm_eps() -> f32 {
    1e-5
}

fn default_rope_theta() -> f32 {
    10_000.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct MistralConfig {
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    /// Defaults to `num_attention_heads` (no grouping) when absent.
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    #[serde(default)]
    pub max_position_embeddings: Option<usize>,

    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f32,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f32,
    #[serde(default)]
    pub rope_traditional: bool,
    #[serde(default)]
    pub rope_scaling: Option<RopeScaling>,
    #[serde(default)]
    pub head_dim: Option<usize>,

    #[serde(default)]
    pub tie_word_embeddings: bool,
    #[serde(default)]
    pub attention_bias: bool,
    #[serde(default)]
    pub mlp_bias: bool,

    #[serde(default)]
    pub bos_token_id: Option<u32>,
    #[serde(default, deserialize_with = "deserialize_token_ids")]
    pub eos_token_id: Vec<u32>,

    #[serde(default)]
    pub model_type: String,
}

impl MistralConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("failed to parse model config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {:?}", path))?;
        Self::from_json(&json)
    }

    pub fn kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    pub fn resolved_head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads.max(1))
    }

    /// Rope variant named by `rope_scaling`, `"default"` when unset.
    pub fn rope_type(&self) -> &str {
        rope_type(self.rope_scaling.as_ref())
    }

    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 {
            bail!("vocab_size must be positive");
        }
        if self.num_hidden_layers == 0 {
            bail!("num_hidden_layers must be positive");
        }
        if self.num_attention_heads == 0 {
            bail!("num_attention_heads must be positive");
        }
        let kv_heads = self.kv_heads();
        if kv_heads == 0 || self.num_attention_heads % kv_heads != 0 {
            bail!(
                "num_attention_heads ({}) must be a multiple of num_key_value_heads ({})",
                self.num_attention_heads,
                kv_heads
            );
        }
        let head_dim = self.resolved_head_dim();
        if head_dim == 0 || head_dim % 2 != 0 {
            bail!("head_dim must be even and positive, got {}", head_dim);
        }
        Ok(())
    }
}
