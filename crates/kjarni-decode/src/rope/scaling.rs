//! `rope_scaling` configuration handling.

use std::collections::HashMap;
use std::f32::consts::PI;

use serde::{Deserialize, Serialize};

/// A single `rope_scaling` entry as found in model configs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalingValue {
    Number(f32),
    Text(String),
    Other(serde_json::Value),
}

impl ScalingValue {
    pub fn as_number(&self) -> Option<f32> {
        match self {
            ScalingValue::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ScalingValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

pub type RopeScaling = HashMap<String, ScalingValue>;

/// Reads the rope variant from `type` (or `rope_type`), defaulting to `"default"`.
pub fn rope_type(rope_scaling: Option<&RopeScaling>) -> &str {
    rope_scaling
        .and_then(|s| {
            s.get("type")
                .and_then(ScalingValue::as_text)
                .or_else(|| s.get("rope_type").and_then(ScalingValue::as_text))
        })
        .unwrap_or("default")
}

/// Remaps the rotation base for the `llama3` frequency scheme.
///
/// Each even feature index gets a frequency `base^(i / dims)`, smoothly
/// blended between `factor` times itself (long wavelengths) and itself
/// (short wavelengths). The mean of the blended frequencies becomes the new
/// base. Any other variant, or a missing or non-numeric parameter, yields
/// `base` unchanged.
pub fn compute_base_frequency(
    base: f32,
    dims: usize,
    rope_type: &str,
    rope_scaling: Option<&RopeScaling>,
) -> f32 {
    if rope_type != "llama3" {
        return base;
    }
    let Some(scaling) = rope_scaling else {
        return base;
    };

    let number = |key: &str, default: Option<f32>| match scaling.get(key) {
        Some(value) => value.as_number(),
        None => default,
    };
    let (Some(factor), Some(low_freq_factor), Some(high_freq_factor), Some(old_context_len)) = (
        number("factor", None),
        number("low_freq_factor", Some(1.0)),
        number("high_freq_factor", Some(4.0)),
        number("original_max_position_embeddings", Some(8192.0)),
    ) else {
        log::warn!("incomplete llama3 rope_scaling, keeping base frequency {}", base);
        return base;
    };

    let low_freq_wavelen = old_context_len / low_freq_factor;
    let high_freq_wavelen = old_context_len / high_freq_factor;

    let frequencies: Vec<f32> = (0..dims)
        .step_by(2)
        .map(|i| {
            let freq = base.powf(i as f32 / dims as f32);
            let wavelen = 2.0 * PI / freq;
            let smooth = ((wavelen - high_freq_wavelen) / (low_freq_wavelen - high_freq_wavelen))
                .min(1.0)
                .max(0.0);
            freq * ((1.0 - smooth) * factor + smooth)
        })
        .collect();

    if frequencies.is_empty() {
        return base;
    }
    let mean = frequencies.iter().sum::<f32>() / frequencies.len() as f32;
    if !mean.is_finite() {
        log::warn!("llama3 rope_scaling produced a non-finite base, keeping {}", base);
        return base;
    }
    mean
}
