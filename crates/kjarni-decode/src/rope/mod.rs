//! Rotary Position Embeddings with dynamic NTK scaling.
//!
//! Queries and keys are rotated pairwise by position-dependent angles. When
//! the total sequence length (cached offset plus new tokens) grows past the
//! model's trained context, the rotation base is stretched so long-range
//! positions remain distinguishable.
//!
//! Two pairing layouts are supported:
//! - traditional: interleaved pairs `(2i, 2i + 1)`
//! - rotate-half: split pairs `(i, i + dims / 2)`

mod scaling;

pub use scaling::{compute_base_frequency, rope_type, RopeScaling, ScalingValue};

use anyhow::{anyhow, Result};
use ndarray::{Array2, Array4, ArrayView4, Axis};

#[derive(Debug, Clone)]
pub struct DynamicNtkRoPE {
    dims: usize,
    max_position_embeddings: Option<usize>,
    traditional: bool,
    base: f32,
    scale: f32,
}

impl DynamicNtkRoPE {
    /// Builds the encoding, resolving any `llama3` frequency remapping once.
    ///
    /// `dims` must be even and at least 4 when `max_position_embeddings` is
    /// set, since the NTK exponent divides by `dims - 2`.
    pub fn new(
        dims: usize,
        max_position_embeddings: Option<usize>,
        traditional: bool,
        base: f32,
        scale: f32,
        rope_type: &str,
        rope_scaling: Option<&RopeScaling>,
    ) -> Result<Self> {
        if dims == 0 || dims % 2 != 0 {
            return Err(anyhow!("rotary dims must be even and positive, got {}", dims));
        }
        if max_position_embeddings.is_some() && dims <= 2 {
            return Err(anyhow!(
                "dynamic NTK scaling needs more than 2 rotary dims, got {}",
                dims
            ));
        }
        let base = compute_base_frequency(base, dims, rope_type, rope_scaling);
        log::debug!(
            "RoPE: dims={} base={} scale={} traditional={} max_positions={:?}",
            dims,
            base,
            scale,
            traditional,
            max_position_embeddings
        );
        Ok(Self {
            dims,
            max_position_embeddings,
            traditional,
            base,
            scale,
        })
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Base frequency after any `llama3` remapping, before NTK adjustment.
    pub fn base(&self) -> f32 {
        self.base
    }

    /// Base used for a call whose total sequence length is `seq_len`.
    pub fn effective_base(&self, seq_len: usize) -> f32 {
        match self.max_position_embeddings {
            Some(max) if seq_len > max => {
                let growth = seq_len as f32 / max as f32 - 1.0;
                let exponent = self.dims as f32 / (self.dims as f32 - 2.0);
                self.base * self.scale * (1.0 + growth).powf(exponent)
            }
            _ => self.base,
        }
    }

    /// Rotates `[batch, heads, seq, head_dim]` for absolute positions
    /// `offset..offset + seq`. Features past `dims` pass through unchanged.
    pub fn forward(&self, x: ArrayView4<'_, f32>, offset: usize) -> Result<Array4<f32>> {
        let (_, _, seq_len, head_dim) = x.dim();
        if self.dims > head_dim {
            return Err(anyhow!(
                "rotary dims {} exceed head dimension {}",
                self.dims,
                head_dim
            ));
        }

        let base = self.effective_base(offset + seq_len);
        let (cos, sin) = self.angle_tables(base, offset, seq_len);
        let half = self.dims / 2;

        let mut out = x.as_standard_layout().into_owned();
        for mut batch in out.axis_iter_mut(Axis(0)) {
            for mut head in batch.axis_iter_mut(Axis(0)) {
                for (pos, mut row) in head.axis_iter_mut(Axis(0)).enumerate() {
                    for i in 0..half {
                        let (a, b) = if self.traditional {
                            (2 * i, 2 * i + 1)
                        } else {
                            (i, i + half)
                        };
                        let (c, s) = (cos[[pos, i]], sin[[pos, i]]);
                        let (x0, x1) = (row[a], row[b]);
                        row[a] = x0 * c - x1 * s;
                        row[b] = x0 * s + x1 * c;
                    }
                }
            }
        }
        Ok(out)
    }

    fn angle_tables(&self, base: f32, offset: usize, seq_len: usize) -> (Array2<f32>, Array2<f32>) {
        let half = self.dims / 2;
        let inv_freq: Vec<f32> = (0..half)
            .map(|i| 1.0 / base.powf((2 * i) as f32 / self.dims as f32))
            .collect();
        let angles = Array2::from_shape_fn((seq_len, half), |(pos, i)| {
            (offset + pos) as f32 * self.scale * inv_freq[i]
        });
        (angles.mapv(f32::cos), angles.mapv(f32::sin))
    }
}
