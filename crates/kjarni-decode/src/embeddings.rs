//! Token embedding table.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use ndarray::{Array2, Array3, ArrayView2};

use crate::linear_layer::LinearLayer;

#[derive(Debug, Clone)]
pub struct Embedding {
    weight: Arc<Array2<f32>>,
}

impl Embedding {
    /// `weight` is `[vocab_size, hidden_size]`.
    pub fn new(weight: Array2<f32>) -> Self {
        Self {
            weight: Arc::new(weight),
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.weight.nrows()
    }

    pub fn hidden_size(&self) -> usize {
        self.weight.ncols()
    }

    /// Looks up `[batch, seq]` token ids into `[batch, seq, hidden]`.
    pub fn forward(&self, tokens: ArrayView2<'_, u32>) -> Result<Array3<f32>> {
        let (batch, seq) = tokens.dim();
        let hidden = self.hidden_size();
        let mut out = Array3::<f32>::zeros((batch, seq, hidden));
        for ((b, s), &token) in tokens.indexed_iter() {
            let idx = token as usize;
            if idx >= self.vocab_size() {
                return Err(anyhow!(
                    "token id {} out of range for vocabulary of {}",
                    token,
                    self.vocab_size()
                ));
            }
            out.slice_mut(ndarray::s![b, s, ..])
                .assign(&self.weight.row(idx));
        }
        Ok(out)
    }

    /// Reuses the table as an output projection (tied embeddings).
    pub fn as_linear(&self) -> LinearLayer {
        LinearLayer::from_arc(Arc::clone(&self.weight), None)
    }
}
