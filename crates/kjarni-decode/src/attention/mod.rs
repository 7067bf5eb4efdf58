//! Grouped-query self-attention with rotary encoding and KV caching.

use anyhow::{bail, Result};
use ndarray::{s, Array2, Array3, Array4, ArrayView4};
use rayon::prelude::*;

use crate::activations::softmax_rows_inplace;
use crate::cache::KVCache;
use crate::linear_layer::LinearLayer;
use crate::rope::DynamicNtkRoPE;

/// Self-attention block.
///
/// Query heads are split into groups sharing one key/value head, so
/// `num_heads` must be a multiple of `num_kv_heads`.
#[derive(Debug, Clone)]
pub struct Attention {
    q_proj: LinearLayer,
    k_proj: LinearLayer,
    v_proj: LinearLayer,
    o_proj: LinearLayer,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    scale: f32,
    rope: DynamicNtkRoPE,
}

impl Attention {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        q_proj: LinearLayer,
        k_proj: LinearLayer,
        v_proj: LinearLayer,
        o_proj: LinearLayer,
        num_heads: usize,
        num_kv_heads: usize,
        head_dim: usize,
        rope: DynamicNtkRoPE,
    ) -> Result<Self> {
        if num_kv_heads == 0 || num_heads % num_kv_heads != 0 {
            bail!(
                "num_heads ({}) must be a positive multiple of num_kv_heads ({})",
                num_heads,
                num_kv_heads
            );
        }
        let q_out = num_heads * head_dim;
        let kv_out = num_kv_heads * head_dim;
        if q_proj.out_features() != q_out
            || k_proj.out_features() != kv_out
            || v_proj.out_features() != kv_out
            || o_proj.in_features() != q_out
        {
            bail!(
                "attention projections do not match {} heads, {} kv heads, head_dim {}",
                num_heads,
                num_kv_heads,
                head_dim
            );
        }
        if rope.dims() > head_dim {
            bail!("rotary dims {} exceed head_dim {}", rope.dims(), head_dim);
        }
        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            num_heads,
            num_kv_heads,
            head_dim,
            scale: (head_dim as f32).powf(-0.5),
            rope,
        })
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_kv_heads
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Attends over `[batch, seq, hidden]`.
    ///
    /// With a cache, new positions start at `cache.offset()` and attention
    /// covers every cached position. `mask` is additive with shape
    /// `[seq, offset + seq]`.
    pub fn forward(
        &self,
        x: &Array3<f32>,
        mask: Option<&Array2<f32>>,
        cache: Option<&mut KVCache>,
    ) -> Result<Array3<f32>> {
        let (batch, seq_len, _) = x.dim();

        let q = split_heads(self.q_proj.forward_3d(x)?, self.num_heads, self.head_dim)?;
        let k = split_heads(self.k_proj.forward_3d(x)?, self.num_kv_heads, self.head_dim)?;
        let v = split_heads(self.v_proj.forward_3d(x)?, self.num_kv_heads, self.head_dim)?;

        let context = match cache {
            Some(cache) => {
                let offset = cache.offset();
                let q = self.rope.forward(q.view(), offset)?;
                let k = self.rope.forward(k.view(), offset)?;
                let (keys, values) = cache.update(k.view(), v.view())?;
                scaled_dot_product_attention(q.view(), keys, values, self.scale, mask)?
            }
            None => {
                let q = self.rope.forward(q.view(), 0)?;
                let k = self.rope.forward(k.view(), 0)?;
                scaled_dot_product_attention(q.view(), k.view(), v.view(), self.scale, mask)?
            }
        };

        let merged = context
            .permuted_axes([0, 2, 1, 3])
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((batch, seq_len, self.num_heads * self.head_dim))?;
        self.o_proj.forward_3d(&merged)
    }
}

/// `[batch, seq, heads * head_dim]` to `[batch, heads, seq, head_dim]`.
fn split_heads(x: Array3<f32>, heads: usize, head_dim: usize) -> Result<Array4<f32>> {
    let (batch, seq, _) = x.dim();
    Ok(x
        .into_shape_with_order((batch, seq, heads, head_dim))?
        .permuted_axes([0, 2, 1, 3]))
}

/// `softmax(q k^T * scale + mask) v`, per head.
///
/// `q` is `[batch, heads, q_len, dim]`; `k` and `v` are
/// `[batch, kv_heads, kv_len, dim]` with `heads` a multiple of `kv_heads`.
pub fn scaled_dot_product_attention(
    q: ArrayView4<'_, f32>,
    k: ArrayView4<'_, f32>,
    v: ArrayView4<'_, f32>,
    scale: f32,
    mask: Option<&Array2<f32>>,
) -> Result<Array4<f32>> {
    let (batch, heads, q_len, dim) = q.dim();
    let (k_batch, kv_heads, kv_len, k_dim) = k.dim();
    if k.dim() != v.dim() {
        bail!("key shape {:?} and value shape {:?} differ", k.shape(), v.shape());
    }
    if k_batch != batch || k_dim != dim || kv_heads == 0 || heads % kv_heads != 0 {
        bail!(
            "query shape {:?} incompatible with key shape {:?}",
            q.shape(),
            k.shape()
        );
    }
    if let Some(mask) = mask {
        if mask.dim() != (q_len, kv_len) {
            bail!(
                "mask shape {:?} does not match [{}, {}]",
                mask.shape(),
                q_len,
                kv_len
            );
        }
    }
    let groups = heads / kv_heads;

    let per_head: Vec<Array2<f32>> = (0..batch * heads)
        .into_par_iter()
        .map(|idx| {
            let (b, h) = (idx / heads, idx % heads);
            let q_bh = q.slice(s![b, h, .., ..]);
            let k_bh = k.slice(s![b, h / groups, .., ..]);
            let v_bh = v.slice(s![b, h / groups, .., ..]);

            let mut scores = q_bh.dot(&k_bh.t()) * scale;
            if let Some(mask) = mask {
                scores += mask;
            }
            softmax_rows_inplace(&mut scores);
            scores.dot(&v_bh)
        })
        .collect();

    let mut out = Array4::<f32>::zeros((batch, heads, q_len, dim));
    for (idx, head) in per_head.into_iter().enumerate() {
        out.slice_mut(s![idx / heads, idx % heads, .., ..]).assign(&head);
    }
    Ok(out)
}
