//! Additive attention masks.

use ndarray::Array2;

/// Value added to attention scores at masked positions.
pub const MASK_VALUE: f32 = -1e9;

/// Causal mask of shape `[q_len, offset + q_len]`.
///
/// Query `i` sits at absolute position `offset + i` and may attend to every
/// key at `j <= offset + i`; later keys receive [`MASK_VALUE`].
pub fn create_causal_mask(q_len: usize, offset: usize) -> Array2<f32> {
    Array2::from_shape_fn((q_len, offset + q_len), |(i, j)| {
        if j <= offset + i {
            0.0
        } else {
            MASK_VALUE
        }
    })
}

/// Returns a causal mask for multi-token chunks and `None` for single steps.
pub fn create_attention_mask(q_len: usize, offset: usize) -> Option<Array2<f32>> {
    (q_len > 1).then(|| create_causal_mask(q_len, offset))
}
