//! SwiGLU feed-forward network: `down(silu(gate(x)) * up(x))`.

use anyhow::{anyhow, Result};
use ndarray::Array3;

use crate::activations::silu_inplace;
use crate::linear_layer::LinearLayer;
use crate::weights::ModelWeights;

#[derive(Debug, Clone)]
pub struct SwiGluFeedForward {
    pub gate: LinearLayer,
    pub up: LinearLayer,
    pub down: LinearLayer,
}

impl SwiGluFeedForward {
    pub fn new(
        gate: impl Into<LinearLayer>,
        up: impl Into<LinearLayer>,
        down: impl Into<LinearLayer>,
    ) -> Result<Self> {
        let (gate, up, down) = (gate.into(), up.into(), down.into());
        if gate.out_features() != up.out_features() || down.in_features() != gate.out_features() {
            return Err(anyhow!(
                "inconsistent SwiGLU shapes: gate {}, up {}, down input {}",
                gate.out_features(),
                up.out_features(),
                down.in_features()
            ));
        }
        Ok(Self { gate, up, down })
    }

    /// Loads `gate_proj`, `up_proj` and `down_proj` under `prefix`.
    pub fn from_weights(weights: &ModelWeights, prefix: &str, with_bias: bool) -> Result<Self> {
        Self::new(
            LinearLayer::from_weights(weights, &format!("{prefix}.gate_proj"), with_bias)?,
            LinearLayer::from_weights(weights, &format!("{prefix}.up_proj"), with_bias)?,
            LinearLayer::from_weights(weights, &format!("{prefix}.down_proj"), with_bias)?,
        )
    }

    pub fn forward(&self, hidden: &Array3<f32>) -> Result<Array3<f32>> {
        // Gate and up are independent.
        let (gate_out, up_out) = rayon::join(
            || self.gate.forward_3d(hidden),
            || self.up.forward_3d(hidden),
        );
        let mut activated = gate_out?;
        silu_inplace(&mut activated);
        activated *= &up_out?;
        self.down.forward_3d(&activated)
    }
}
