//! Per-layer key/value cache for autoregressive decoding.
//!
//! Keys and values are stored as `[batch, kv_heads, capacity, head_dim]`.
//! Capacity grows in multiples of [`CACHE_GROWTH_STEP`] positions, so most
//! single-token updates write in place without reallocating.

use anyhow::{bail, Result};
use ndarray::{s, Array4, ArrayView4};

/// Positions added to the backing storage whenever it runs out of room.
pub const CACHE_GROWTH_STEP: usize = 256;

#[derive(Debug, Clone)]
pub struct KVCache {
    keys: Option<Array4<f32>>,
    values: Option<Array4<f32>>,
    offset: usize,
    kv_heads: usize,
    head_dim: usize,
}

impl KVCache {
    pub fn new(kv_heads: usize, head_dim: usize) -> Self {
        Self {
            keys: None,
            values: None,
            offset: 0,
            kv_heads,
            head_dim,
        }
    }

    /// Number of positions accumulated so far.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn kv_heads(&self) -> usize {
        self.kv_heads
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    pub fn is_empty(&self) -> bool {
        self.offset == 0
    }

    /// Positions the backing storage can hold before the next reallocation.
    pub fn capacity(&self) -> usize {
        self.keys.as_ref().map_or(0, |k| k.shape()[2])
    }

    /// Appends `[batch, kv_heads, new_len, head_dim]` keys and values.
    ///
    /// Returns views over every cached position, oldest first, including the
    /// ones just written. The offset advances by `new_len`.
    pub fn update(
        &mut self,
        keys: ArrayView4<'_, f32>,
        values: ArrayView4<'_, f32>,
    ) -> Result<(ArrayView4<'_, f32>, ArrayView4<'_, f32>)> {
        if keys.dim() != values.dim() {
            bail!(
                "key shape {:?} does not match value shape {:?}",
                keys.shape(),
                values.shape()
            );
        }
        let (batch, heads, new_len, dim) = keys.dim();
        if heads != self.kv_heads || dim != self.head_dim {
            bail!(
                "cache expects {} heads of dim {}, got {} heads of dim {}",
                self.kv_heads,
                self.head_dim,
                heads,
                dim
            );
        }
        if let Some(existing) = &self.keys {
            if existing.shape()[0] != batch {
                bail!(
                    "cache holds batch {}, update has batch {}",
                    existing.shape()[0],
                    batch
                );
            }
        }

        let end = self.offset + new_len;
        if end > self.capacity() {
            self.grow(batch, end);
        }

        let (Some(cache_k), Some(cache_v)) = (self.keys.as_mut(), self.values.as_mut()) else {
            bail!("cache storage missing after allocation");
        };
        cache_k.slice_mut(s![.., .., self.offset..end, ..]).assign(&keys);
        cache_v.slice_mut(s![.., .., self.offset..end, ..]).assign(&values);
        self.offset = end;

        Ok((
            cache_k.slice(s![.., .., ..end, ..]),
            cache_v.slice(s![.., .., ..end, ..]),
        ))
    }

    /// Views over the cached positions, or `None` before the first update.
    pub fn state(&self) -> Option<(ArrayView4<'_, f32>, ArrayView4<'_, f32>)> {
        match (&self.keys, &self.values) {
            (Some(k), Some(v)) => Some((
                k.slice(s![.., .., ..self.offset, ..]),
                v.slice(s![.., .., ..self.offset, ..]),
            )),
            _ => None,
        }
    }

    fn grow(&mut self, batch: usize, required: usize) {
        let capacity = required.div_ceil(CACHE_GROWTH_STEP) * CACHE_GROWTH_STEP;
        let shape = (batch, self.kv_heads, capacity, self.head_dim);
        let mut new_k = Array4::<f32>::zeros(shape);
        let mut new_v = Array4::<f32>::zeros(shape);
        if let (Some(old_k), Some(old_v)) = (&self.keys, &self.values) {
            let live = s![.., .., ..self.offset, ..];
            new_k.slice_mut(live).assign(&old_k.slice(live));
            new_v.slice_mut(live).assign(&old_v.slice(live));
        }
        log::trace!(
            "KV cache grown from {} to {} positions",
            self.capacity(),
            capacity
        );
        self.keys = Some(new_k);
        self.values = Some(new_v);
    }
}
