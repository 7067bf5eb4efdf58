//! Activation functions and softmax operations.

use libm::expf;
use ndarray::{Array2, ArrayBase, DataMut, Dimension, Ix1, Axis};

/// Minimum array size for parallel execution.
pub const PARALLEL_THRESHOLD: usize = 16_384;

#[inline(always)]
pub fn silu_scalar(x: f32) -> f32 {
    if x <= -20.0 {
        0.0
    } else if x >= 20.0 {
        x
    } else {
        x / (1.0 + expf(-x))
    }
}

/// Applies SiLU in place, in parallel for large arrays.
pub fn silu_inplace<S, D>(x: &mut ArrayBase<S, D>)
where
    S: DataMut<Elem = f32>,
    D: Dimension,
{
    if x.len() >= PARALLEL_THRESHOLD {
        x.par_mapv_inplace(silu_scalar);
    } else {
        x.mapv_inplace(silu_scalar);
    }
}

/// Numerically stable softmax over a contiguous slice.
pub fn softmax_inplace(slice: &mut [f32]) {
    let max = slice.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        return;
    }
    let mut sum = 0.0f32;
    for v in slice.iter_mut() {
        *v = expf(*v - max);
        sum += *v;
    }
    if sum > 0.0 {
        let inv = 1.0 / sum;
        slice.iter_mut().for_each(|v| *v *= inv);
    }
}

/// Softmax over a 1D array or view.
pub fn softmax_1d_inplace<S>(logits: &mut ArrayBase<S, Ix1>)
where
    S: DataMut<Elem = f32>,
{
    if let Some(slice) = logits.as_slice_mut() {
        softmax_inplace(slice);
        return;
    }
    let mut owned = logits.to_vec();
    softmax_inplace(&mut owned);
    logits
        .iter_mut()
        .zip(owned)
        .for_each(|(dst, src)| *dst = src);
}

/// Row-wise softmax of a score matrix.
pub fn softmax_rows_inplace(scores: &mut Array2<f32>) {
    for mut row in scores.axis_iter_mut(Axis(0)) {
        softmax_1d_inplace(&mut row);
    }
}
