//! Sliding window of recent tokens used for the repetition penalty.

use ndarray::{ArrayBase, DataMut, Ix1};

use super::GenerateParameters;

/// Fixed-capacity circular window of recently seen tokens.
///
/// The window fills up in order; once full, each new token overwrites the
/// oldest slot. The penalty pushes every seen token's logit down: negative
/// logits are multiplied by it, non-negative logits divided.
#[derive(Debug, Clone)]
pub struct RepetitionContext {
    tokens: Vec<u32>,
    index: usize,
    capacity: usize,
    penalty: Option<f32>,
}

impl RepetitionContext {
    /// Seeds the window with the prompt tail when a penalty is configured.
    pub fn new(prompt: &[u32], params: &GenerateParameters) -> Self {
        let capacity = params.repetition_context_size;
        let tokens = match params.repetition_penalty {
            Some(_) => {
                let start = prompt.len().saturating_sub(capacity);
                prompt[start..].to_vec()
            }
            None => Vec::new(),
        };
        Self {
            tokens,
            index: 0,
            capacity,
            penalty: params.repetition_penalty,
        }
    }

    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    pub fn penalty(&self) -> Option<f32> {
        self.penalty
    }

    pub fn is_full(&self) -> bool {
        self.tokens.len() >= self.capacity
    }

    /// Penalizes every distinct token currently in the window.
    ///
    /// Ids outside the logits range are skipped.
    pub fn apply_penalty<S>(&self, logits: &mut ArrayBase<S, Ix1>)
    where
        S: DataMut<Elem = f32>,
    {
        let Some(penalty) = self.penalty else {
            return;
        };
        if self.tokens.is_empty() {
            return;
        }

        let mut distinct = self.tokens.clone();
        distinct.sort_unstable();
        distinct.dedup();

        for token in distinct {
            let idx = token as usize;
            if idx >= logits.len() {
                continue;
            }
            let score = logits[idx];
            logits[idx] = if score < 0.0 {
                score * penalty
            } else {
                score / penalty
            };
        }
    }

    /// Records a token; a no-op when no penalty is configured.
    pub fn append(&mut self, token: u32) {
        if self.penalty.is_none() {
            return;
        }
        if self.tokens.len() < self.capacity {
            self.tokens.push(token);
        } else {
            self.tokens[self.index] = token;
            self.index = (self.index + 1) % self.capacity;
        }
    }
}
