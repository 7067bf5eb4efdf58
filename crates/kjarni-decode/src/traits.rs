//! Model interface consumed by the token generator.

use anyhow::Result;
use ndarray::{Array3, ArrayView2};

use crate::cache::KVCache;

/// A decoder-only language model.
pub trait CausalLanguageModel: Send + Sync {
    /// Runs `[batch, seq]` token ids through the model, returning
    /// `[batch, seq, vocab_size]` logits.
    ///
    /// When `cache` is supplied it holds one entry per layer; each entry's
    /// offset must advance by `seq`.
    fn forward(&self, tokens: ArrayView2<'_, u32>, cache: Option<&mut [KVCache]>)
        -> Result<Array3<f32>>;

    /// Fresh, empty cache with one entry per layer.
    fn new_cache(&self) -> Vec<KVCache> {
        (0..self.num_layers())
            .map(|_| KVCache::new(self.num_kv_heads(), self.head_dim()))
            .collect()
    }

    fn vocab_size(&self) -> usize;

    fn num_layers(&self) -> usize;

    fn num_kv_heads(&self) -> usize;

    fn head_dim(&self) -> usize;
}
