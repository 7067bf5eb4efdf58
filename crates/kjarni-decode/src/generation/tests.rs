use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use ndarray::{Array3, Array4, ArrayView2};

use super::*;
use crate::cache::KVCache;
use crate::common::GenerateParameters;
use crate::error::{GeneratorError, GeneratorResult};
use crate::traits::CausalLanguageModel;

const VOCAB: usize = 16;

enum Logits {
    /// Favors `(input + 1) % VOCAB` at every position.
    Successor,
    /// Returns the same row at every position.
    Fixed(Vec<f32>),
}

struct MockModel {
    logits: Logits,
    calls: Mutex<Vec<Vec<u32>>>,
    fail_on_call: Option<usize>,
}

impl MockModel {
    fn successor() -> Arc<Self> {
        Arc::new(Self {
            logits: Logits::Successor,
            calls: Mutex::new(Vec::new()),
            fail_on_call: None,
        })
    }

    fn fixed(row: Vec<f32>) -> Arc<Self> {
        Arc::new(Self {
            logits: Logits::Fixed(row),
            calls: Mutex::new(Vec::new()),
            fail_on_call: None,
        })
    }

    fn failing_on(call: usize) -> Arc<Self> {
        Arc::new(Self {
            logits: Logits::Successor,
            calls: Mutex::new(Vec::new()),
            fail_on_call: Some(call),
        })
    }

    fn calls(&self) -> Vec<Vec<u32>> {
        self.calls.lock().unwrap().clone()
    }
}

impl CausalLanguageModel for MockModel {
    fn forward(&self, tokens: ArrayView2<'_, u32>, cache: Option<&mut [KVCache]>) -> Result<Array3<f32>> {
        let chunk: Vec<u32> = tokens.iter().copied().collect();
        let call_index = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(chunk.clone());
            calls.len() - 1
        };
        if self.fail_on_call == Some(call_index) {
            bail!("forward failure on call {}", call_index);
        }

        if let Some(cache) = cache {
            let kv = Array4::<f32>::zeros((1, self.num_kv_heads(), chunk.len(), self.head_dim()));
            for layer in cache.iter_mut() {
                layer.update(kv.view(), kv.view())?;
            }
        }

        let mut out = Array3::<f32>::zeros((1, chunk.len(), VOCAB));
        for (pos, &token) in chunk.iter().enumerate() {
            match &self.logits {
                Logits::Successor => out[[0, pos, (token as usize + 1) % VOCAB]] = 10.0,
                Logits::Fixed(row) => {
                    for (v, &value) in row.iter().enumerate() {
                        out[[0, pos, v]] = value;
                    }
                }
            }
        }
        Ok(out)
    }

    fn vocab_size(&self) -> usize {
        VOCAB
    }

    fn num_layers(&self) -> usize {
        2
    }

    fn num_kv_heads(&self) -> usize {
        1
    }

    fn head_dim(&self) -> usize {
        2
    }
}

fn greedy(prefill_step_size: usize) -> GenerateParameters {
    GenerateParameters {
        prefill_step_size,
        ..GenerateParameters::greedy()
    }
}

#[test]
fn test_chunked_prefill_then_decode() {
    let _ = env_logger::builder().is_test(true).try_init();
    let model = MockModel::successor();
    let generator = TokenGenerator::new(&[5, 9, 2], model.clone(), greedy(2)).unwrap();

    let tokens = StopPolicy::new(3, vec![]).collect(generator).unwrap();

    assert_eq!(tokens, vec![3, 4, 5]);
    assert_eq!(model.calls(), vec![vec![5, 9], vec![2], vec![3], vec![4]]);
}

#[test]
fn test_construction_runs_nothing() {
    let model = MockModel::successor();
    let generator = TokenGenerator::new(&[1, 2, 3], model.clone(), greedy(2)).unwrap();
    assert_eq!(generator.state(), GeneratorState::Prefilling);
    assert!(model.calls().is_empty());
}

#[test]
fn test_state_transitions() {
    let model = MockModel::successor();
    let mut generator = TokenGenerator::new(&[5, 9, 2], model.clone(), greedy(2)).unwrap();

    generator.prefill().unwrap();
    assert_eq!(generator.state(), GeneratorState::Priming);
    assert_eq!(model.calls(), vec![vec![5, 9]]);

    assert_eq!(generator.advance().unwrap(), Some(3));
    assert_eq!(generator.state(), GeneratorState::Decoding);
    assert_eq!(generator.advance().unwrap(), Some(4));

    generator.stop();
    assert_eq!(generator.state(), GeneratorState::Exhausted);
    assert_eq!(generator.advance().unwrap(), None);
    assert_eq!(generator.tokens_generated(), 2);
}

#[test]
fn test_short_prompt_skips_prefill() {
    let model = MockModel::successor();
    let mut generator = TokenGenerator::new(&[7, 8], model.clone(), greedy(512)).unwrap();
    assert_eq!(generator.advance().unwrap(), Some(9));
    assert_eq!(model.calls(), vec![vec![7, 8]]);
}

#[test]
fn test_prompt_of_exact_multiple_primes_with_last_chunk() {
    let model = MockModel::successor();
    let mut generator = TokenGenerator::new(&[1, 2, 3, 4], model.clone(), greedy(2)).unwrap();
    assert_eq!(generator.advance().unwrap(), Some(5));
    assert_eq!(model.calls(), vec![vec![1, 2], vec![3, 4]]);
}

#[test]
fn test_cache_offset_tracks_consumed_tokens() {
    let model = MockModel::successor();
    let mut generator = TokenGenerator::new(&[1, 2, 3, 4, 5], model, greedy(2)).unwrap();
    generator.advance().unwrap();
    assert!(generator.cache().iter().all(|c| c.offset() == 5));
    generator.advance().unwrap();
    generator.advance().unwrap();
    assert!(generator.cache().iter().all(|c| c.offset() == 7));
}

#[test]
fn test_iterator_interface() {
    let model = MockModel::successor();
    let generator = TokenGenerator::new(&[14], model, greedy(512)).unwrap();
    let tokens: Vec<u32> = generator
        .take(4)
        .collect::<GeneratorResult<_>>()
        .unwrap();
    assert_eq!(tokens, vec![15, 0, 1, 2]);
}

#[test]
fn test_stop_token_excluded() {
    let model = MockModel::successor();
    let generator = TokenGenerator::new(&[1], model.clone(), greedy(512)).unwrap();
    let tokens = StopPolicy::new(10, vec![4]).collect(generator).unwrap();
    assert_eq!(tokens, vec![2, 3]);
    assert_eq!(model.calls().len(), 3);
}

#[test]
fn test_zero_budget_runs_nothing() {
    let model = MockModel::successor();
    let generator = TokenGenerator::new(&[1], model.clone(), greedy(512)).unwrap();
    assert!(StopPolicy::new(0, vec![]).collect(generator).unwrap().is_empty());
    assert!(model.calls().is_empty());
}

#[test]
fn test_repetition_penalty_changes_choice() {
    let mut row = vec![0.0f32; VOCAB];
    row[1] = 2.0;
    row[2] = 1.9;

    let plain = MockModel::fixed(row.clone());
    let mut generator = TokenGenerator::new(&[1, 0], plain, greedy(512)).unwrap();
    assert_eq!(generator.advance().unwrap(), Some(1));

    let penalized = MockModel::fixed(row);
    let params = GenerateParameters {
        repetition_penalty: Some(2.0),
        repetition_context_size: 4,
        ..greedy(512)
    };
    let mut generator = TokenGenerator::new(&[1, 0], penalized, params).unwrap();
    assert_eq!(generator.advance().unwrap(), Some(2));
    assert_eq!(generator.repetition_context().tokens(), &[1, 0, 2]);
}

#[test]
fn test_seeded_sampling_reproducible() {
    let row: Vec<f32> = (0..VOCAB).map(|i| (i % 4) as f32 * 0.1).collect();
    let params = GenerateParameters {
        temperature: 1.0,
        seed: Some(1234),
        ..Default::default()
    };
    let run = || {
        let generator = TokenGenerator::new(&[0], MockModel::fixed(row.clone()), params.clone()).unwrap();
        StopPolicy::new(12, vec![]).collect(generator).unwrap()
    };
    assert_eq!(run(), run());
}

#[test]
fn test_rejects_invalid_inputs() {
    let model = MockModel::successor();
    assert!(matches!(
        TokenGenerator::new(&[], model.clone(), greedy(2)),
        Err(GeneratorError::EmptyPrompt)
    ));
    assert!(matches!(
        TokenGenerator::new(&[3, VOCAB as u32], model.clone(), greedy(2)),
        Err(GeneratorError::TokenOutOfRange { token, vocab_size: VOCAB }) if token == VOCAB as u32
    ));
    assert!(matches!(
        TokenGenerator::new(&[1], model.clone(), greedy(0)),
        Err(GeneratorError::InvalidParameters(_))
    ));
    assert!(matches!(
        TokenGenerator::with_cache(&[1], model.clone(), greedy(2), vec![KVCache::new(1, 2)]),
        Err(GeneratorError::CacheMismatch(_))
    ));
    assert!(matches!(
        TokenGenerator::with_cache(&[1], model.clone(), greedy(2), vec![KVCache::new(2, 2); 2]),
        Err(GeneratorError::CacheMismatch(_))
    ));
    assert!(model.calls().is_empty());
}

#[test]
fn test_failure_exhausts_generator() {
    let model = MockModel::failing_on(1);
    let mut generator = TokenGenerator::new(&[1, 2, 3], model.clone(), greedy(2)).unwrap();
    assert!(matches!(
        generator.advance(),
        Err(GeneratorError::GenerationFailed(_))
    ));
    assert_eq!(generator.state(), GeneratorState::Exhausted);
    assert_eq!(generator.advance().unwrap(), None);
    assert_eq!(model.calls().len(), 2);
}

#[test]
fn test_failure_during_decode() {
    let model = MockModel::failing_on(2);
    let mut generator = TokenGenerator::new(&[1], model, greedy(512)).unwrap();
    assert_eq!(generator.advance().unwrap(), Some(2));
    assert_eq!(generator.advance().unwrap(), Some(3));
    assert!(generator.advance().is_err());
    assert!(generator.next().is_none());
}
