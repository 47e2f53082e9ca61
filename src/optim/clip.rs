use ndarray::{Array1, ArrayView1};

/// Sum of squares, accumulated in f64. NaN and infinities propagate.
pub fn squared_norm(values: ArrayView1<'_, f32>) -> f32 {
    values
        .iter()
        .map(|&g| f64::from(g) * f64::from(g))
        .sum::<f64>() as f32
}

/// Factor applied to gradients whose global norm is `total_norm`.
pub fn clip_coefficient(total_norm: f32, max_norm: f32) -> f32 {
    (max_norm / (total_norm + 1e-6)).min(1.0)
}

/// Rescale `grads` in place given an already computed global norm. Non-finite
/// norms leave the gradients untouched.
pub fn scale_to_max_norm(grads: &mut Array1<f32>, total_norm: f32, max_norm: f32) {
    if total_norm.is_finite() {
        let coef = clip_coefficient(total_norm, max_norm);
        if coef < 1.0 {
            grads.mapv_inplace(|g| g * coef);
        }
    }
}

/// Clip a single, unsharded gradient vector by its norm and return the norm
/// measured before clipping.
pub fn clip_grad_norm(grads: &mut Array1<f32>, max_norm: f32) -> f32 {
    let total_norm = squared_norm(grads.view()).sqrt();
    scale_to_max_norm(grads, total_norm, max_norm);
    total_norm
}
