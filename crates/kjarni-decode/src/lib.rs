//! Autoregressive decoding core for decoder-only transformers.
//!
//! This crate provides the building blocks needed to turn a causal language
//! model into a token stream:
//!
//! - dynamic NTK rotary position encoding ([`rope`])
//! - a growing per-layer key/value cache ([`cache`])
//! - grouped-query self-attention ([`attention`])
//! - repetition penalty and token sampling ([`common`])
//! - the lazy token generation state machine ([`generation`])
//!
//! Model architectures live in downstream crates and plug in through the
//! [`CausalLanguageModel`] trait.

pub mod activations;
pub mod attention;
pub mod cache;
pub mod common;
pub mod embeddings;
pub mod error;
pub mod feedforward;
pub mod generation;
pub mod linear_layer;
pub mod masks;
pub mod normalization;
pub mod rope;
pub mod traits;
pub mod weights;

pub use crate::{
    attention::Attention,
    cache::KVCache,
    common::{GenerateParameters, RepetitionContext, SampleStrategy},
    embeddings::Embedding,
    error::{GeneratorError, GeneratorResult},
    feedforward::SwiGluFeedForward,
    generation::{GeneratorState, StopPolicy, TokenGenerator},
    linear_layer::LinearLayer,
    normalization::RMSNorm,
    rope::{DynamicNtkRoPE, RopeScaling, ScalingValue},
    traits::CausalLanguageModel,
    weights::ModelWeights,
};
