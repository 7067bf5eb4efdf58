//! Token selection from next-token logits.

use anyhow::{anyhow, Result};
use ndarray::{Array1, ArrayBase, Data, Ix1};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::GenerateParameters;
use crate::activations::softmax_inplace;

/// Chooses the next token from a logits vector.
///
/// The mode is fixed at construction: argmax when the temperature is zero,
/// nucleus sampling when `0 < top_p < 1`, plain temperature sampling
/// otherwise.
#[derive(Debug, Clone)]
pub struct SampleStrategy {
    temperature: f32,
    top_p: f32,
    use_argmax: bool,
    use_top_p: bool,
    rng: StdRng,
}

impl SampleStrategy {
    pub fn new(params: &GenerateParameters) -> Self {
        let rng = match params.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self::with_rng(params, rng)
    }

    pub fn with_rng(params: &GenerateParameters, rng: StdRng) -> Self {
        Self {
            temperature: params.temperature,
            top_p: params.top_p,
            use_argmax: params.temperature == 0.0,
            use_top_p: params.top_p > 0.0 && params.top_p < 1.0,
            rng,
        }
    }

    pub fn is_greedy(&self) -> bool {
        self.use_argmax
    }

    /// Samples a token id. Reduced-precision logits (`half::bf16`,
    /// `half::f16`) are widened to `f32` first.
    pub fn sample<S, A>(&mut self, logits: &ArrayBase<S, Ix1>) -> Result<u32>
    where
        S: Data<Elem = A>,
        A: Copy + Into<f32>,
    {
        if logits.is_empty() {
            return Err(anyhow!("cannot sample from empty logits"));
        }
        let logits: Vec<f32> = logits.iter().map(|&v| v.into()).collect();

        if self.use_argmax {
            return argmax(&logits)
                .map(|idx| idx as u32)
                .ok_or_else(|| anyhow!("cannot sample from empty logits"));
        }

        // Shifted by the max so an infinite `inv_temp` never meets a zero.
        let inv_temp = 1.0 / self.temperature;
        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut probs: Vec<f32> = logits
            .iter()
            .map(|&v| if v == max { 0.0 } else { (v - max) * inv_temp })
            .collect();
        softmax_inplace(&mut probs);

        if self.use_top_p {
            let (order, kept) = nucleus(&probs, self.top_p);
            let rank = self.categorical(&kept)?;
            return Ok(order[rank] as u32);
        }

        self.categorical(&probs).map(|idx| idx as u32)
    }

    fn categorical(&mut self, weights: &[f32]) -> Result<usize> {
        let dist = WeightedIndex::new(weights)
            .map_err(|e| anyhow!("invalid sampling distribution: {}", e))?;
        Ok(dist.sample(&mut self.rng))
    }
}

/// Index of the first maximum, or `None` for empty input.
pub fn argmax(values: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (idx, &v) in values.iter().enumerate() {
        if best.map_or(true, |(_, current)| v > current) {
            best = Some((idx, v));
        }
    }
    best.map(|(idx, _)| idx)
}

/// Sorts probabilities ascending and zeroes every entry whose cumulative
/// mass (counting itself) is at most `1 - top_p`. The most probable token is
/// always kept. Returns the token order and the filtered probabilities in
/// that order.
fn nucleus(probs: &[f32], top_p: f32) -> (Vec<usize>, Vec<f32>) {
    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_by(|&a, &b| probs[a].total_cmp(&probs[b]));

    let threshold = 1.0 - top_p;
    let mut cumulative = 0.0f32;
    let mut kept: Vec<f32> = order
        .iter()
        .map(|&idx| {
            cumulative += probs[idx];
            if cumulative > threshold {
                probs[idx]
            } else {
                0.0
            }
        })
        .collect();

    if let Some(last) = kept.last_mut() {
        if *last <= 0.0 {
            *last = probs[order[order.len() - 1]].max(f32::MIN_POSITIVE);
        }
    }
    (order, kept)
}

/// Nucleus-filtered distribution in vocabulary order.
pub fn top_p_filter(probs: &Array1<f32>, top_p: f32) -> Array1<f32> {
    let values = probs.to_vec();
    let (order, kept) = nucleus(&values, top_p);
    let mut out = Array1::<f32>::zeros(values.len());
    for (idx, p) in order.into_iter().zip(kept) {
        out[idx] = p;
    }
    out
}
