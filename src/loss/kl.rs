//! KL estimators between the current and the reference policy.

use ndarray::{Array2, ArrayView2, Zip};

use crate::config::KlPenalty;

/// Per-token KL estimate and its derivative with respect to `log_probs`.
///
/// `low_var_kl` is the k3 estimator `exp(k) - k - 1` with `k = ref - new`,
/// with `k` clamped to `[-20, 20]` and the estimate to `[-10, 10]`.
pub fn kl_penalty(
    log_probs: ArrayView2<'_, f32>,
    ref_log_probs: ArrayView2<'_, f32>,
    penalty: KlPenalty,
) -> (Array2<f32>, Array2<f32>) {
    let mut values = Array2::zeros(log_probs.raw_dim());
    let mut grads = Array2::zeros(log_probs.raw_dim());
    Zip::from(&mut values)
        .and(&mut grads)
        .and(log_probs)
        .and(ref_log_probs)
        .for_each(|value, grad, &new, &reference| {
            let (v, g) = kl_token(new, reference, penalty);
            *value = v;
            *grad = g;
        });
    (values, grads)
}

fn kl_token(new: f32, reference: f32, penalty: KlPenalty) -> (f32, f32) {
    let diff = new - reference;
    match penalty {
        KlPenalty::Kl => (diff, 1.0),
        KlPenalty::Abs => {
            let sign = if diff > 0.0 {
                1.0
            } else if diff < 0.0 {
                -1.0
            } else {
                0.0
            };
            (diff.abs(), sign)
        }
        KlPenalty::Mse => (0.5 * diff * diff, diff),
        KlPenalty::LowVarKl => {
            let raw = reference - new;
            let k = raw.clamp(-20.0, 20.0);
            let dk_dnew = if (-20.0..=20.0).contains(&raw) { -1.0 } else { 0.0 };
            let estimate = k.exp() - k - 1.0;
            let value = estimate.clamp(-10.0, 10.0);
            let dv_dk = if (-10.0..=10.0).contains(&estimate) {
                k.exp() - 1.0
            } else {
                0.0
            };
            (value, dv_dk * dk_dnew)
        }
    }
}
