//! Mistral-family decoder models and a tokenizer-driven text pipeline.
//!
//! ```no_run
//! use kjarni_decode::GenerateParameters;
//! use kjarni_mistral::TextGenerator;
//!
//! # fn main() -> anyhow::Result<()> {
//! let generator = TextGenerator::from_pretrained("models/mistral-7b".as_ref())?;
//! let text = generator.generate("The capital of France is", &GenerateParameters::default(), 32)?;
//! println!("{text}");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod model;
pub mod pipeline;

#[cfg(test)]
pub(crate) mod testing;

pub use config::MistralConfig;
pub use model::{MistralModel, TransformerBlock};
pub use pipeline::{GeneratedToken, TextGenerator};
