//! Prompt-to-text generation over a [`MistralModel`].

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use async_stream::try_stream;
use futures_core::Stream;
use kjarni_decode::{
    CausalLanguageModel, GenerateParameters, GeneratorResult, StopPolicy, TokenGenerator,
};
use log::{debug, info};
use tokenizers::Tokenizer;

use crate::model::MistralModel;

/// Vocabulary entry treated as the unknown token.
pub const UNKNOWN_TOKEN: &str = "<unk>";

/// A streamed token and the text it adds to the output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedToken {
    pub id: u32,
    pub text: String,
}

/// Text generation with a shared model and its tokenizer.
///
/// Generation stops after `max_tokens` tokens or when the model emits a
/// stop token: the config's EOS ids and the tokenizer's `<unk>` entry. Stop
/// tokens are never part of the output.
pub struct TextGenerator {
    model: Arc<MistralModel>,
    tokenizer: Tokenizer,
    stop_tokens: Vec<u32>,
}

impl TextGenerator {
    pub fn new(model: Arc<MistralModel>, tokenizer: Tokenizer) -> Self {
        let mut stop_tokens = model.config().eos_token_id.clone();
        if let Some(unk) = tokenizer.token_to_id(UNKNOWN_TOKEN) {
            if !stop_tokens.contains(&unk) {
                stop_tokens.push(unk);
            }
        }
        debug!("stop tokens: {:?}", stop_tokens);
        Self {
            model,
            tokenizer,
            stop_tokens,
        }
    }

    /// Loads the model and `tokenizer.json` from a model directory.
    pub fn from_pretrained(model_dir: &Path) -> Result<Self> {
        let t_load = Instant::now();
        let model = MistralModel::from_pretrained(model_dir)?;
        let tokenizer = Tokenizer::from_file(model_dir.join("tokenizer.json"))
            .map_err(|e| anyhow!("failed to load tokenizer: {}", e))?;
        info!(
            "model loaded from {:?} in {:.2}s",
            model_dir,
            t_load.elapsed().as_secs_f64()
        );
        Ok(Self::new(Arc::new(model), tokenizer))
    }

    pub fn model(&self) -> &Arc<MistralModel> {
        &self.model
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn stop_tokens(&self) -> &[u32] {
        &self.stop_tokens
    }

    pub fn encode(&self, prompt: &str) -> Result<Vec<u32>> {
        Ok(self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| anyhow!(e))?
            .get_ids()
            .to_vec())
    }

    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        decode_ids(&self.tokenizer, ids)
    }

    fn stop_policy(&self, max_tokens: usize) -> StopPolicy {
        StopPolicy::new(max_tokens, self.stop_tokens.clone())
    }

    /// Generates token ids for an already encoded prompt.
    pub fn generate_tokens(
        &self,
        prompt_tokens: &[u32],
        params: &GenerateParameters,
        max_tokens: usize,
    ) -> GeneratorResult<Vec<u32>> {
        let mut generator =
            TokenGenerator::new(prompt_tokens, Arc::clone(&self.model), params.clone())?;
        let tokens = self.stop_policy(max_tokens).collect(
            generator
                .by_ref()
                .enumerate()
                .inspect(|(i, _)| debug!("token {}/{}", i + 1, max_tokens))
                .map(|(_, token)| token),
        )?;
        generator.stop();
        Ok(tokens)
    }

    pub fn generate(
        &self,
        prompt: &str,
        params: &GenerateParameters,
        max_tokens: usize,
    ) -> Result<String> {
        let prompt_tokens = self.encode(prompt)?;
        let tokens = self.generate_tokens(&prompt_tokens, params, max_tokens)?;
        self.decode(&tokens)
    }

    /// Streams tokens as they are produced. Dropping the stream cancels
    /// generation.
    pub fn generate_stream<'a>(
        &'a self,
        prompt: &str,
        params: &GenerateParameters,
        max_tokens: usize,
    ) -> Result<impl Stream<Item = Result<GeneratedToken>> + 'a> {
        let prompt_tokens = self.encode(prompt)?;
        let generator =
            TokenGenerator::new(&prompt_tokens, Arc::clone(&self.model), params.clone())?;
        Ok(token_stream(
            generator,
            self.stop_policy(max_tokens),
            &self.tokenizer,
        ))
    }
}

fn decode_ids(tokenizer: &Tokenizer, ids: &[u32]) -> Result<String> {
    tokenizer.decode(ids, true).map_err(|e| anyhow!(e))
}

/// Drives `generator` one step per poll, decoding the ids seen so far into
/// text deltas.
fn token_stream<'a, M>(
    mut generator: TokenGenerator<M>,
    policy: StopPolicy,
    tokenizer: &'a Tokenizer,
) -> impl Stream<Item = Result<GeneratedToken>> + 'a
where
    M: CausalLanguageModel + ?Sized + 'a,
{
    try_stream! {
        let mut ids: Vec<u32> = Vec::new();
        let mut delta = TextDelta::default();
        while ids.len() < policy.max_tokens {
            let id = match generator.advance().map_err(anyhow::Error::from)? {
                Some(id) => id,
                None => break,
            };
            if policy.is_stop_token(id) {
                break;
            }
            ids.push(id);
            debug!("token {}/{}", ids.len(), policy.max_tokens);

            let text = delta.push(decode_ids(tokenizer, &ids)?);
            yield GeneratedToken { id, text };
        }
        generator.stop();
    }
}

/// Turns successive decodes of a growing id sequence into appended text.
///
/// Byte-fallback tokenizers split one character over several ids, and a
/// partial sequence decodes to U+FFFD. Such a decode is held back until the
/// character completes. Only text past the common prefix with what was
/// already emitted is returned.
#[derive(Debug, Default)]
struct TextDelta {
    emitted: String,
}

impl TextDelta {
    fn push(&mut self, full: String) -> String {
        if full.ends_with(char::REPLACEMENT_CHARACTER) {
            return String::new();
        }
        let common = common_prefix_len(&self.emitted, &full);
        let delta = full[common..].to_string();
        self.emitted = full;
        delta
    }
}

/// Byte length of the longest common prefix, on a char boundary of both.
fn common_prefix_len(a: &str, b: &str) -> usize {
    a.chars()
        .zip(b.chars())
        .take_while(|(x, y)| x == y)
        .map(|(x, _)| x.len_utf8())
        .sum()
}

impl std::fmt::Debug for TextGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextGenerator")
            .field("vocab_size", &self.model.config().vocab_size)
            .field("stop_tokens", &self.stop_tokens)
            .finish()
    }
}
