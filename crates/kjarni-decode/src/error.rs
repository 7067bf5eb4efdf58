//! Generator error definitions.

use thiserror::Error;

/// Errors surfaced by token generation.
#[derive(Debug, Error)]
pub enum GeneratorError {
    /// A generation parameter is outside its valid range.
    #[error("Invalid generation parameters: {0}")]
    InvalidParameters(String),

    /// The prompt contained no tokens.
    #[error("Prompt must contain at least one token")]
    EmptyPrompt,

    /// The model reports a vocabulary of size zero.
    #[error("Model vocabulary is empty")]
    EmptyVocabulary,

    /// A prompt token does not index into the model vocabulary.
    #[error("Token {token} is out of range for vocabulary of size {vocab_size}")]
    TokenOutOfRange { token: u32, vocab_size: usize },

    /// A supplied cache does not match the model layout.
    #[error("Cache does not match model: {0}")]
    CacheMismatch(String),

    /// The model forward pass or sampling failed.
    #[error("Generation failed: {0}")]
    GenerationFailed(#[from] anyhow::Error),
}

/// Result type for generator operations.
pub type GeneratorResult<T> = Result<T, GeneratorError>;
