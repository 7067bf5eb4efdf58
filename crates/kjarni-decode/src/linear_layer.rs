//! Dense projection layer stored in PyTorch `[out_features, in_features]` layout.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use ndarray::{Array1, Array2, Array3, ArrayView2};

use crate::weights::ModelWeights;

#[derive(Debug, Clone)]
pub struct LinearLayer {
    weight: Arc<Array2<f32>>,
    bias: Option<Array1<f32>>,
}

impl LinearLayer {
    pub fn new(weight: Array2<f32>, bias: impl Into<Option<Array1<f32>>>) -> Self {
        Self::from_arc(Arc::new(weight), bias)
    }

    /// Wraps a shared weight matrix, used for tied embeddings.
    pub fn from_arc(weight: Arc<Array2<f32>>, bias: impl Into<Option<Array1<f32>>>) -> Self {
        Self {
            weight,
            bias: bias.into(),
        }
    }

    /// Loads `<prefix>.weight` and, when `with_bias` is set, `<prefix>.bias`.
    pub fn from_weights(weights: &ModelWeights, prefix: &str, with_bias: bool) -> Result<Self> {
        let weight = weights.get_array2(&format!("{prefix}.weight"))?;
        let bias = if with_bias {
            let bias = weights.get_array1(&format!("{prefix}.bias"))?;
            if bias.len() != weight.nrows() {
                return Err(anyhow!(
                    "bias for '{}' has {} entries, expected {}",
                    prefix,
                    bias.len(),
                    weight.nrows()
                ));
            }
            Some(bias)
        } else {
            None
        };
        Ok(Self::new(weight, bias))
    }

    /// `input @ W^T + b` for a `[rows, in_features]` input.
    pub fn matmul(&self, input: &ArrayView2<f32>) -> Array2<f32> {
        let mut out = input.dot(&self.weight.t());
        if let Some(bias) = &self.bias {
            out += bias;
        }
        out
    }

    /// Applies the projection to a `[batch, seq, in_features]` tensor.
    pub fn forward_3d(&self, input: &Array3<f32>) -> Result<Array3<f32>> {
        let (batch, seq, features) = input.dim();
        if features != self.in_features() {
            return Err(anyhow!(
                "linear layer expects {} input features, got {}",
                self.in_features(),
                features
            ));
        }
        let flat = input
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((batch * seq, features))?;
        let out = self.matmul(&flat.view());
        Ok(out.into_shape_with_order((batch, seq, self.out_features()))?)
    }

    pub fn weight(&self) -> &Array2<f32> {
        &self.weight
    }

    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    pub fn has_bias(&self) -> bool {
        self.bias.is_some()
    }
}

impl From<Array2<f32>> for LinearLayer {
    fn from(weight: Array2<f32>) -> Self {
        Self::new(weight, None)
    }
}
