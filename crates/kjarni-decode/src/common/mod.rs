//! Generation parameters, repetition penalty and token sampling.

pub mod repetition;
pub mod sampling;

pub use repetition::RepetitionContext;
pub use sampling::{argmax, top_p_filter, SampleStrategy};

use serde::{Deserialize, Serialize};

use crate::error::GeneratorError;

/// Knobs controlling a single generation session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerateParameters {
    /// Maximum number of prompt tokens pushed through the model per prefill chunk.
    pub prefill_step_size: usize,
    /// Sampling temperature; `0` selects greedy decoding.
    pub temperature: f32,
    /// Nucleus threshold; values in `(0, 1)` enable top-p filtering.
    pub top_p: f32,
    /// Penalty applied to recently seen tokens; `None` disables it.
    pub repetition_penalty: Option<f32>,
    /// Number of recent tokens the penalty considers.
    pub repetition_context_size: usize,
    /// Seed for the sampling RNG; `None` seeds from system entropy.
    pub seed: Option<u64>,
}

impl Default for GenerateParameters {
    fn default() -> Self {
        Self {
            prefill_step_size: 512,
            temperature: 0.6,
            top_p: 1.0,
            repetition_penalty: None,
            repetition_context_size: 20,
            seed: None,
        }
    }
}

impl GenerateParameters {
    /// Deterministic argmax decoding.
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), GeneratorError> {
        let invalid = |msg: String| Err(GeneratorError::InvalidParameters(msg));
        if self.prefill_step_size == 0 {
            return invalid("prefill_step_size must be at least 1".into());
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return invalid(format!(
                "temperature must be finite and >= 0, got {}",
                self.temperature
            ));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return invalid(format!("top_p must be in (0, 1], got {}", self.top_p));
        }
        if let Some(penalty) = self.repetition_penalty {
            if !penalty.is_finite() || penalty <= 0.0 {
                return invalid(format!(
                    "repetition_penalty must be finite and > 0, got {}",
                    penalty
                ));
            }
        }
        if self.repetition_context_size == 0 {
            return invalid("repetition_context_size must be at least 1".into());
        }
        Ok(())
    }
}
