//! Dual-clip policy-gradient loss with an optional reference-policy KL term.
//!
//! All inputs live in the compact response layout `[b, Lc]` and are masked by
//! `compact_response_mask`. Besides the scalar loss the engine returns its
//! analytic gradient with respect to the current log-probs, which the actor
//! back-propagates through the model.

pub mod average;
pub mod kl;

use ndarray::{Array2, ArrayView2};

use crate::config::{ActorConfig, KlPenalty, LossAvgMode};
use crate::error::LayoutError;

pub use average::{average_loss, average_weights, masked_mean};
pub use kl::kl_penalty;

// ---------------------------------------------------------------------------
// Inputs and outputs
// ---------------------------------------------------------------------------

/// Bound on `|new - old|` before exponentiation.
const MAX_LOG_RATIO: f32 = 20.0;

/// One micro-batch in the compact `[b, Lc]` layout.
pub struct PolicyLossInput<'a> {
    /// Log-probs under the policy that generated the rollouts.
    pub old_log_probs: ArrayView2<'a, f32>,
    /// Log-probs under the current parameters.
    pub log_probs: ArrayView2<'a, f32>,
    pub advantages: ArrayView2<'a, f32>,
    /// The compact response mask.
    pub response_mask: ArrayView2<'a, bool>,
    /// Adds the KL penalty when it is enabled; ignored otherwise.
    pub ref_log_probs: Option<ArrayView2<'a, f32>>,
}

#[derive(Debug, Clone)]
pub struct PolicyLossOutput {
    /// Surrogate plus the scaled KL penalty; the value being minimised.
    pub loss: f32,
    /// Surrogate alone.
    pub pg_loss: f32,
    /// Averaged KL penalty before scaling, when enabled and a reference was
    /// supplied.
    pub kl_loss: Option<f32>,
    /// Fraction of tokens where the upper ratio clip was active.
    pub pg_clipfrac_higher: f32,
    /// Fraction of negative-advantage tokens capped by the dual clip.
    pub pg_clipfrac_lower: f32,
    /// Masked mean of `old - new`.
    pub ppo_kl: f32,
    /// Average of `-new`, a cheap entropy proxy.
    pub entropy_loss: f32,
    pub clipped_higher_tokens: usize,
    pub clipped_lower_tokens: usize,
    /// `d loss / d log_probs`, zero outside the mask.
    pub grad_log_probs: Array2<f32>,
}

struct TokenTerm {
    loss: f32,
    grad: f32,
    clipped_higher: bool,
    clipped_lower: bool,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Computes the dual-clip surrogate.
#[derive(Debug, Clone)]
pub struct PolicyLossEngine {
    clip_ratio_low: f32,
    clip_ratio_high: f32,
    clip_ratio_dual: f32,
    loss_avg_mode: LossAvgMode,
    kl: Option<(KlPenalty, f32)>,
}

impl PolicyLossEngine {
    pub fn from_config(config: &ActorConfig) -> Self {
        Self {
            clip_ratio_low: config.clip_ratio_low,
            clip_ratio_high: config.clip_ratio_high,
            clip_ratio_dual: config.clip_ratio_dual,
            loss_avg_mode: config.loss_avg_mode,
            kl: config
                .use_kl_loss
                .then_some((config.kl_penalty, config.kl_coef)),
        }
    }

    pub fn uses_reference(&self) -> bool {
        self.kl.is_some()
    }

    pub fn kl_coef(&self) -> Option<f32> {
        self.kl.map(|(_, coef)| coef)
    }

    fn token(&self, old: f32, new: f32, advantage: f32) -> TokenTerm {
        let raw = new - old;
        let log_ratio = raw.clamp(-MAX_LOG_RATIO, MAX_LOG_RATIO);
        let d_log_ratio = if (-MAX_LOG_RATIO..=MAX_LOG_RATIO).contains(&raw) { 1.0 } else { 0.0 };

        let lo = (1.0 - self.clip_ratio_low).ln();
        let hi = (1.0 + self.clip_ratio_high).ln();
        let ratio = log_ratio.exp();
        let clipped_ratio = log_ratio.clamp(lo, hi).exp();
        let d_clipped = if (lo..=hi).contains(&log_ratio) { clipped_ratio } else { 0.0 };

        let pg1 = -advantage * ratio;
        let pg2 = -advantage * clipped_ratio;
        let pg3 = -advantage * self.clip_ratio_dual;
        let d1 = -advantage * ratio * d_log_ratio;
        let d2 = -advantage * d_clipped * d_log_ratio;

        let (higher, d_higher) = if pg1 >= pg2 { (pg1, d1) } else { (pg2, d2) };
        let (lower, d_lower) = if higher <= pg3 { (higher, d_higher) } else { (pg3, 0.0) };
        let (loss, grad) = if advantage < 0.0 { (lower, d_lower) } else { (higher, d_higher) };

        TokenTerm {
            loss,
            grad,
            clipped_higher: pg1 < pg2,
            clipped_lower: higher > pg3 && advantage < 0.0,
        }
    }

    pub fn compute(&self, input: &PolicyLossInput<'_>) -> Result<PolicyLossOutput, LayoutError> {
        let mask = input.response_mask;
        let dim = mask.dim();
        let check = |what: &str, view: ArrayView2<'_, f32>| {
            if view.dim() != dim {
                return Err(LayoutError::Shape {
                    what: what.into(),
                    expected: vec![dim.0, dim.1],
                    got: view.shape().to_vec(),
                });
            }
            Ok(())
        };
        check("old_log_probs", input.old_log_probs)?;
        check("log_probs", input.log_probs)?;
        check("advantages", input.advantages)?;

        let mut losses = Array2::<f32>::zeros(dim);
        let mut d_losses = Array2::<f32>::zeros(dim);
        let mut clip_higher = Array2::<f32>::zeros(dim);
        let mut clip_lower = Array2::<f32>::zeros(dim);
        let mut clipped_higher_tokens = 0;
        let mut clipped_lower_tokens = 0;
        for ((idx, &valid), &new) in mask.indexed_iter().zip(input.log_probs.iter()) {
            if !valid {
                continue;
            }
            let term = self.token(input.old_log_probs[idx], new, input.advantages[idx]);
            losses[idx] = term.loss;
            d_losses[idx] = term.grad;
            if term.clipped_higher {
                clip_higher[idx] = 1.0;
                clipped_higher_tokens += 1;
            }
            if term.clipped_lower {
                clip_lower[idx] = 1.0;
                clipped_lower_tokens += 1;
            }
        }

        let weights = average_weights(mask, self.loss_avg_mode);
        let pg_loss = average_loss(losses.view(), mask, self.loss_avg_mode);
        let mut loss = pg_loss;
        let mut grad_log_probs = &weights * &d_losses;

        // The penalty applies only when it is enabled and reference
        // log-probs came with the batch.
        let kl_loss = match (self.kl, input.ref_log_probs) {
            (Some((penalty, coef)), Some(reference)) => {
                check("ref_log_probs", reference)?;
                let (values, d_values) = kl_penalty(input.log_probs, reference, penalty);
                let kl_loss = average_loss(values.view(), mask, self.loss_avg_mode);
                loss += coef * kl_loss;
                grad_log_probs.zip_mut_with(&(&weights * &d_values), |g, &d| *g += coef * d);
                Some(kl_loss)
            }
            _ => None,
        };

        let approx_kl = (&input.old_log_probs - &input.log_probs)
            .mapv(|v| v.clamp(-MAX_LOG_RATIO, MAX_LOG_RATIO));
        let neg_log_probs = input.log_probs.mapv(|v| -v);

        Ok(PolicyLossOutput {
            loss,
            pg_loss,
            kl_loss,
            pg_clipfrac_higher: masked_mean(clip_higher.view(), mask),
            pg_clipfrac_lower: masked_mean(clip_lower.view(), mask),
            ppo_kl: masked_mean(approx_kl.view(), mask),
            entropy_loss: average_loss(neg_log_probs.view(), mask, self.loss_avg_mode),
            clipped_higher_tokens,
            clipped_lower_tokens,
            grad_log_probs,
        })
    }
}
