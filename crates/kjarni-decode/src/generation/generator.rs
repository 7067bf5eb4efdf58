//! Prefill-then-decode state machine over a [`CausalLanguageModel`].

use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use log::{debug, info};
use ndarray::{Array1, Array2, Axis};

use crate::cache::KVCache;
use crate::common::{GenerateParameters, RepetitionContext, SampleStrategy};
use crate::error::{GeneratorError, GeneratorResult};
use crate::traits::CausalLanguageModel;

/// Position of a generator in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorState {
    /// Prompt chunks of `prefill_step_size` tokens remain to be absorbed.
    Prefilling,
    /// The final prompt remainder has not yet produced a token.
    Priming,
    /// Each request feeds back the previous token.
    Decoding,
    /// No further tokens will be produced.
    Exhausted,
}

/// Produces tokens one at a time from a prompt.
///
/// Nothing runs until the first [`advance`](Self::advance). That call
/// pushes the prompt through the model in chunks, then feeds the remainder
/// and returns the first sampled token. Every later call feeds back the
/// previous token and returns the next one. The sequence never ends on its
/// own; callers decide when to [`stop`](Self::stop).
pub struct TokenGenerator<M: CausalLanguageModel + ?Sized> {
    model: Arc<M>,
    params: GenerateParameters,
    prompt: Vec<u32>,
    consumed: usize,
    cache: Vec<KVCache>,
    repetition: RepetitionContext,
    sampler: SampleStrategy,
    state: GeneratorState,
    current: Option<u32>,
    produced: usize,
    started: Option<Instant>,
}

impl<M: CausalLanguageModel + ?Sized> TokenGenerator<M> {
    pub fn new(prompt: &[u32], model: Arc<M>, params: GenerateParameters) -> GeneratorResult<Self> {
        let cache = model.new_cache();
        Self::with_cache(prompt, model, params, cache)
    }

    /// Uses a caller-supplied cache, which must hold one entry per layer
    /// with matching head layout.
    pub fn with_cache(
        prompt: &[u32],
        model: Arc<M>,
        params: GenerateParameters,
        cache: Vec<KVCache>,
    ) -> GeneratorResult<Self> {
        params.validate()?;
        if prompt.is_empty() {
            return Err(GeneratorError::EmptyPrompt);
        }
        let vocab_size = model.vocab_size();
        if vocab_size == 0 {
            return Err(GeneratorError::EmptyVocabulary);
        }
        if let Some(&token) = prompt.iter().find(|&&t| t as usize >= vocab_size) {
            return Err(GeneratorError::TokenOutOfRange { token, vocab_size });
        }
        validate_cache(model.as_ref(), &cache)?;

        let repetition = RepetitionContext::new(prompt, &params);
        let sampler = SampleStrategy::new(&params);
        debug!(
            "TokenGenerator: {} prompt tokens, prefill step {}, temperature {}, top_p {}",
            prompt.len(),
            params.prefill_step_size,
            params.temperature,
            params.top_p
        );

        Ok(Self {
            model,
            params,
            prompt: prompt.to_vec(),
            consumed: 0,
            cache,
            repetition,
            sampler,
            state: GeneratorState::Prefilling,
            current: None,
            produced: 0,
            started: None,
        })
    }

    pub fn state(&self) -> GeneratorState {
        self.state
    }

    pub fn params(&self) -> &GenerateParameters {
        &self.params
    }

    pub fn cache(&self) -> &[KVCache] {
        &self.cache
    }

    pub fn repetition_context(&self) -> &RepetitionContext {
        &self.repetition
    }

    /// Tokens returned so far.
    pub fn tokens_generated(&self) -> usize {
        self.produced
    }

    /// Ends the session; later calls to [`advance`](Self::advance) return `None`.
    pub fn stop(&mut self) {
        if self.state != GeneratorState::Exhausted {
            self.log_throughput();
        }
        self.state = GeneratorState::Exhausted;
    }

    /// Absorbs all full prompt chunks without sampling.
    pub fn prefill(&mut self) -> GeneratorResult<()> {
        while self.state == GeneratorState::Prefilling {
            self.guarded(|g| g.prefill_chunk())?;
        }
        Ok(())
    }

    /// Produces the next token, or `None` once stopped.
    ///
    /// Any failure leaves the generator exhausted.
    pub fn advance(&mut self) -> GeneratorResult<Option<u32>> {
        loop {
            match self.state {
                GeneratorState::Prefilling => self.guarded(|g| g.prefill_chunk())?,
                GeneratorState::Priming => {
                    let token = self.guarded(|g| {
                        let remainder = g.prompt[g.consumed..].to_vec();
                        let token = g.step(&remainder)?;
                        g.consumed = g.prompt.len();
                        g.state = GeneratorState::Decoding;
                        Ok(token)
                    })?;
                    return Ok(Some(token));
                }
                GeneratorState::Decoding => {
                    let token = self.guarded(|g| {
                        let previous = g
                            .current
                            .ok_or_else(|| anyhow!("decoding without a previous token"))?;
                        g.step(&[previous])
                    })?;
                    return Ok(Some(token));
                }
                GeneratorState::Exhausted => return Ok(None),
            }
        }
    }

    fn guarded<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> GeneratorResult<T>,
    ) -> GeneratorResult<T> {
        let result = f(self);
        if result.is_err() {
            self.state = GeneratorState::Exhausted;
        }
        result
    }

    fn prefill_chunk(&mut self) -> GeneratorResult<()> {
        let step = self.params.prefill_step_size;
        let remaining = self.prompt.len() - self.consumed;
        if remaining <= step {
            self.state = GeneratorState::Priming;
            return Ok(());
        }

        self.started.get_or_insert_with(Instant::now);
        let end = self.consumed + step;
        run_model(
            self.model.as_ref(),
            &mut self.cache,
            &self.prompt[self.consumed..end],
        )?;
        self.consumed = end;
        debug!(
            "prefilled {}/{} prompt tokens",
            self.consumed,
            self.prompt.len()
        );
        Ok(())
    }

    /// Runs `tokens`, penalizes and samples the last position, records the result.
    fn step(&mut self, tokens: &[u32]) -> GeneratorResult<u32> {
        self.started.get_or_insert_with(Instant::now);
        let logits = run_model(self.model.as_ref(), &mut self.cache, tokens)?;

        let mut last: Array1<f32> = logits
            .index_axis(Axis(0), 0)
            .index_axis(Axis(0), tokens.len() - 1)
            .to_owned();
        self.repetition.apply_penalty(&mut last);
        let token = self.sampler.sample(&last)?;
        self.repetition.append(token);

        self.current = Some(token);
        self.produced += 1;
        Ok(token)
    }

    fn log_throughput(&self) {
        if let Some(started) = self.started {
            let secs = started.elapsed().as_secs_f64();
            if self.produced > 0 && secs > 0.0 {
                info!(
                    "generated {} tokens in {:.2}s ({:.2} tok/s)",
                    self.produced,
                    secs,
                    self.produced as f64 / secs
                );
            }
        }
    }
}

impl<M: CausalLanguageModel + ?Sized> Iterator for TokenGenerator<M> {
    type Item = GeneratorResult<u32>;

    fn next(&mut self) -> Option<Self::Item> {
        self.advance().transpose()
    }
}

impl<M: CausalLanguageModel + ?Sized> std::fmt::Debug for TokenGenerator<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGenerator")
            .field("state", &self.state)
            .field("consumed", &self.consumed)
            .field("prompt_len", &self.prompt.len())
            .field("produced", &self.produced)
            .finish()
    }
}

fn validate_cache<M: CausalLanguageModel + ?Sized>(
    model: &M,
    cache: &[KVCache],
) -> GeneratorResult<()> {
    if cache.len() != model.num_layers() {
        return Err(GeneratorError::CacheMismatch(format!(
            "{} cache entries for {} layers",
            cache.len(),
            model.num_layers()
        )));
    }
    for (layer, entry) in cache.iter().enumerate() {
        if entry.kv_heads() != model.num_kv_heads() || entry.head_dim() != model.head_dim() {
            return Err(GeneratorError::CacheMismatch(format!(
                "layer {} cache has {} heads of dim {}, model expects {} of dim {}",
                layer,
                entry.kv_heads(),
                entry.head_dim(),
                model.num_kv_heads(),
                model.head_dim()
            )));
        }
    }
    Ok(())
}

/// Forwards a single-sequence chunk and checks the logits shape.
fn run_model<M: CausalLanguageModel + ?Sized>(
    model: &M,
    cache: &mut [KVCache],
    tokens: &[u32],
) -> GeneratorResult<ndarray::Array3<f32>> {
    let input = Array2::from_shape_vec((1, tokens.len()), tokens.to_vec())
        .map_err(anyhow::Error::from)?;
    let logits = model.forward(input.view(), Some(cache))?;
    let (batch, seq, vocab) = logits.dim();
    if batch != 1 || seq != tokens.len() || vocab != model.vocab_size() {
        return Err(GeneratorError::GenerationFailed(anyhow!(
            "model returned logits of shape {:?}, expected [1, {}, {}]",
            logits.shape(),
            tokens.len(),
            model.vocab_size()
        )));
    }
    Ok(logits)
}
