//! AdamW (Adam with decoupled weight decay) over a flat parameter shard.

use std::collections::BTreeMap;

use ndarray::Array1;

use super::{Optimizer, OptimizerState};
use crate::config::OptimConfig;
use crate::error::LayoutError;

const EXP_AVG: &str = "exp_avg";
const EXP_AVG_SQ: &str = "exp_avg_sq";

/// ```text
/// θ ← θ (1 - lr λ)
/// m ← β1 m + (1 - β1) g
/// v ← β2 v + (1 - β2) g²
/// θ ← θ - lr / (1 - β1^t) · m / (√v / √(1 - β2^t) + ε)
/// ```
#[derive(Debug, Clone)]
pub struct AdamW {
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    weight_decay: f32,
    step: u64,
    exp_avg: Array1<f32>,
    exp_avg_sq: Array1<f32>,
}

impl AdamW {
    pub fn new(numel: usize, config: &OptimConfig) -> Self {
        Self {
            lr: config.lr,
            beta1: config.betas[0],
            beta2: config.betas[1],
            eps: config.eps,
            weight_decay: config.weight_decay,
            step: 0,
            exp_avg: Array1::zeros(numel),
            exp_avg_sq: Array1::zeros(numel),
        }
    }

    pub fn step_count(&self) -> u64 {
        self.step
    }

    fn expect_len(&self, what: &str, len: usize) -> Result<(), LayoutError> {
        if len != self.exp_avg.len() {
            return Err(LayoutError::Shape {
                what: what.into(),
                expected: vec![self.exp_avg.len()],
                got: vec![len],
            });
        }
        Ok(())
    }
}

impl Optimizer for AdamW {
    fn step(&mut self, params: &mut Array1<f32>, grads: &Array1<f32>) -> Result<(), LayoutError> {
        self.expect_len("params", params.len())?;
        self.expect_len("grads", grads.len())?;

        self.step += 1;
        let t = self.step as f32;
        let bias1 = 1.0 - self.beta1.powf(t);
        let bias2_sqrt = (1.0 - self.beta2.powf(t)).sqrt();
        let step_size = self.lr / bias1;
        let decay = 1.0 - self.lr * self.weight_decay;
        let (beta1, beta2, eps) = (self.beta1, self.beta2, self.eps);

        ndarray::Zip::from(params)
            .and(grads)
            .and(&mut self.exp_avg)
            .and(&mut self.exp_avg_sq)
            .for_each(|p, &g, m, v| {
                *p *= decay;
                *m = beta1 * *m + (1.0 - beta1) * g;
                *v = beta2 * *v + (1.0 - beta2) * g * g;
                let denom = v.sqrt() / bias2_sqrt + eps;
                *p -= step_size * *m / denom;
            });
        Ok(())
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    fn state_dict(&self) -> OptimizerState {
        let mut buffers = BTreeMap::new();
        buffers.insert(EXP_AVG.to_string(), self.exp_avg.clone());
        buffers.insert(EXP_AVG_SQ.to_string(), self.exp_avg_sq.clone());
        OptimizerState {
            step: self.step,
            lr: self.lr,
            buffers,
        }
    }

    fn load_state_dict(&mut self, mut state: OptimizerState) -> Result<(), LayoutError> {
        let mut take = |name: &str| {
            state
                .buffers
                .remove(name)
                .ok_or_else(|| LayoutError::MissingField(format!("optimizer buffer `{}`", name)))
        };
        let exp_avg = take(EXP_AVG)?;
        let exp_avg_sq = take(EXP_AVG_SQ)?;
        self.expect_len(EXP_AVG, exp_avg.len())?;
        self.expect_len(EXP_AVG_SQ, exp_avg_sq.len())?;
        self.exp_avg = exp_avg;
        self.exp_avg_sq = exp_avg_sq;
        self.step = state.step;
        self.lr = state.lr;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn config(lr: f32, weight_decay: f32) -> OptimConfig {
        OptimConfig {
            lr,
            weight_decay,
            ..OptimConfig::default()
        }
    }

    #[test]
    fn test_first_step_moves_by_lr() {
        // With bias correction the first step is lr * sign(g) (up to eps).
        let mut opt = AdamW::new(2, &config(0.1, 0.0));
        let mut params = array![1.0f32, -1.0];
        opt.step(&mut params, &array![0.5f32, -2.0]).unwrap();
        assert_abs_diff_eq!(params[0], 0.9, epsilon = 1e-5);
        assert_abs_diff_eq!(params[1], -0.9, epsilon = 1e-5);
        assert_eq!(opt.step_count(), 1);
    }

    #[test]
    fn test_decoupled_weight_decay() {
        let mut opt = AdamW::new(1, &config(0.1, 0.5));
        let mut params = array![2.0f32];
        opt.step(&mut params, &array![0.0f32]).unwrap();
        // Zero gradient: only the decay applies.
        assert_abs_diff_eq!(params[0], 2.0 * (1.0 - 0.05), epsilon = 1e-6);
    }

    #[test]
    fn test_converges_on_quadratic() {
        let mut opt = AdamW::new(1, &config(0.05, 0.0));
        let mut params = array![3.0f32];
        for _ in 0..500 {
            let grads = params.mapv(|p| 2.0 * (p - 1.0));
            opt.step(&mut params, &grads).unwrap();
        }
        assert_abs_diff_eq!(params[0], 1.0, epsilon = 5e-2);
    }

    #[test]
    fn test_state_dict_round_trip() {
        let mut opt = AdamW::new(3, &config(0.01, 0.01));
        let mut params = array![1.0f32, 2.0, 3.0];
        opt.step(&mut params, &array![0.1f32, -0.2, 0.3]).unwrap();
        let state = opt.state_dict();

        let mut restored = AdamW::new(3, &config(0.5, 0.01));
        restored.load_state_dict(state).unwrap();
        assert_eq!(restored.step_count(), 1);
        assert_eq!(restored.lr(), 0.01);

        let mut a = params.clone();
        let mut b = params.clone();
        let g = array![0.3f32, 0.3, -0.1];
        opt.step(&mut a, &g).unwrap();
        restored.step(&mut b, &g).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_load_rejects_wrong_size() {
        let state = AdamW::new(4, &OptimConfig::default()).state_dict();
        let mut opt = AdamW::new(3, &OptimConfig::default());
        assert!(opt.load_state_dict(state).is_err());

        let mut state = AdamW::new(3, &OptimConfig::default()).state_dict();
        state.buffers.remove(EXP_AVG_SQ);
        assert!(opt.load_state_dict(state).is_err());
    }
}
