//! Caller-side stopping rules.

use crate::error::GeneratorResult;

/// Ends generation at a token budget or on any stop token.
///
/// Stop tokens are not included in the output.
#[derive(Debug, Clone, Default)]
pub struct StopPolicy {
    pub max_tokens: usize,
    pub stop_tokens: Vec<u32>,
}

impl StopPolicy {
    pub fn new(max_tokens: usize, stop_tokens: Vec<u32>) -> Self {
        Self {
            max_tokens,
            stop_tokens,
        }
    }

    pub fn is_stop_token(&self, token: u32) -> bool {
        self.stop_tokens.contains(&token)
    }

    /// Drains `tokens` until a stop token or the budget is reached.
    pub fn collect<I>(&self, tokens: I) -> GeneratorResult<Vec<u32>>
    where
        I: IntoIterator<Item = GeneratorResult<u32>>,
    {
        let mut out = Vec::with_capacity(self.max_tokens.min(4096));
        if self.max_tokens == 0 {
            return Ok(out);
        }
        for token in tokens {
            let token = token?;
            if self.is_stop_token(token) {
                break;
            }
            out.push(token);
            if out.len() >= self.max_tokens {
                break;
            }
        }
        Ok(out)
    }
}
