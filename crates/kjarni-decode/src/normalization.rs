//! Root mean square layer normalization.

use ndarray::{Array1, Array3, Axis};

#[derive(Debug, Clone)]
pub struct RMSNorm {
    pub weight: Array1<f32>,
    pub eps: f32,
}

impl RMSNorm {
    pub fn new(weight: Array1<f32>, eps: f32) -> Self {
        Self { weight, eps }
    }

    /// Normalizes over the last axis of `[batch, seq, hidden]`.
    pub fn forward_3d(&self, hidden: &Array3<f32>) -> Array3<f32> {
        let mean_sq = hidden.map_axis(Axis(2), |row| {
            row.iter().map(|v| v * v).sum::<f32>() / row.len().max(1) as f32
        });
        let rms = mean_sq.mapv(|m| (m + self.eps).sqrt()).insert_axis(Axis(2));
        (hidden / &rms) * &self.weight
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_rms_norm_unit_weight() {
        let norm = RMSNorm::new(array![1.0, 1.0], 0.0);
        let x = array![[[3.0f32, 4.0]]];
        let y = norm.forward_3d(&x);
        let rms = (12.5f32).sqrt();
        assert_abs_diff_eq!(y[[0, 0, 0]], 3.0 / rms, epsilon = 1e-6);
        assert_abs_diff_eq!(y[[0, 0, 1]], 4.0 / rms, epsilon = 1e-6);
    }

    #[test]
    fn test_rms_norm_applies_weight_per_feature() {
        let norm = RMSNorm::new(array![2.0, 0.5], 1e-5);
        let x = array![[[1.0f32, 1.0], [2.0, 2.0]]];
        let y = norm.forward_3d(&x);
        assert_abs_diff_eq!(y[[0, 1, 0]], 2.0, epsilon = 1e-4);
        assert_abs_diff_eq!(y[[0, 1, 1]], 0.5, epsilon = 1e-4);
    }
}
