//! Lazy token generation.

mod generator;
mod stop;

pub use generator::{GeneratorState, TokenGenerator};
pub use stop::StopPolicy;

#[cfg(test)]
mod tests;
