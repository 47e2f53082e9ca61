//! Optimizer, gradient clipping and learning-rate schedules.
//!
//! Optimizers operate on one worker's flat parameter shard; the sharded model
//! owns the collectives that make the gradient norm global.

pub mod adamw;
pub mod clip;
pub mod scheduler;

use std::collections::BTreeMap;

use ndarray::Array1;

use crate::error::LayoutError;

pub use adamw::AdamW;
pub use clip::{clip_coefficient, clip_grad_norm, scale_to_max_norm, squared_norm};
pub use scheduler::{build_scheduler, ConstantWarmupLR, LrScheduler, SchedulerState, WarmupCosineLR};

/// Optimizer internals for one shard: step counter, current LR and named
/// per-element buffers aligned with the shard.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerState {
    pub step: u64,
    pub lr: f32,
    pub buffers: BTreeMap<String, Array1<f32>>,
}

pub trait Optimizer: Send {
    /// Apply one update to `params` using `grads`.
    fn step(&mut self, params: &mut Array1<f32>, grads: &Array1<f32>) -> Result<(), LayoutError>;

    fn lr(&self) -> f32;

    fn set_lr(&mut self, lr: f32);

    fn state_dict(&self) -> OptimizerState;

    fn load_state_dict(&mut self, state: OptimizerState) -> Result<(), LayoutError>;
}
