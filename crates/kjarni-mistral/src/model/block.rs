//! Pre-norm decoder block.

use anyhow::Result;
use kjarni_decode::{
    Attention, DynamicNtkRoPE, KVCache, LinearLayer, ModelWeights, RMSNorm, SwiGluFeedForward,
};
use ndarray::{Array2, Array3};

use crate::config::MistralConfig;

/// `h = x + attn(norm(x))`, then `h + mlp(norm(h))`.
#[derive(Debug, Clone)]
pub struct TransformerBlock {
    self_attn: Attention,
    mlp: SwiGluFeedForward,
    input_layernorm: RMSNorm,
    post_attention_layernorm: RMSNorm,
}

impl TransformerBlock {
    pub fn new(
        self_attn: Attention,
        mlp: SwiGluFeedForward,
        input_layernorm: RMSNorm,
        post_attention_layernorm: RMSNorm,
    ) -> Self {
        Self {
            self_attn,
            mlp,
            input_layernorm,
            post_attention_layernorm,
        }
    }

    pub fn from_weights(
        weights: &ModelWeights,
        config: &MistralConfig,
        layer: usize,
        rope: &DynamicNtkRoPE,
    ) -> Result<Self> {
        let prefix = format!("model.layers.{layer}");
        let attn = |name: &str| {
            LinearLayer::from_weights(
                weights,
                &format!("{prefix}.self_attn.{name}"),
                config.attention_bias,
            )
        };
        let self_attn = Attention::new(
            attn("q_proj")?,
            attn("k_proj")?,
            attn("v_proj")?,
            attn("o_proj")?,
            config.num_attention_heads,
            config.kv_heads(),
            config.resolved_head_dim(),
            rope.clone(),
        )?;
        let mlp = SwiGluFeedForward::from_weights(weights, &format!("{prefix}.mlp"), config.mlp_bias)?;
        let norm = |name: &str| -> Result<RMSNorm> {
            Ok(RMSNorm::new(
                weights.get_array1(&format!("{prefix}.{name}.weight"))?,
                config.rms_norm_eps,
            ))
        };
        Ok(Self::new(
            self_attn,
            mlp,
            norm("input_layernorm")?,
            norm("post_attention_layernorm")?,
        ))
    }

    pub fn forward(
        &self,
        x: &Array3<f32>,
        mask: Option<&Array2<f32>>,
        cache: Option<&mut KVCache>,
    ) -> Result<Array3<f32>> {
        let attn_out = self
            .self_attn
            .forward(&self.input_layernorm.forward_3d(x), mask, cache)?;
        let h = x + &attn_out;
        let mlp_out = self.mlp.forward(&self.post_attention_layernorm.forward_3d(&h))?;
        Ok(h + &mlp_out)
    }
}
