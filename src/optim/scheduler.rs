//! Learning-rate schedules stepped once per `update_policy` call.

use std::f32::consts::PI;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::config::{LrSchedule, OptimConfig};

/// Serializable scheduler position, stored under `lr_scheduler` in the extra
/// state file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub schedule: LrSchedule,
    pub base_lr: f32,
    pub current_step: usize,
    pub last_lr: f32,
}

pub trait LrScheduler: Send {
    fn get_lr(&self) -> f32;

    fn step(&mut self);

    fn state_dict(&self) -> SchedulerState;

    fn load_state_dict(&mut self, state: &SchedulerState) -> Result<()>;
}

fn check_state(expected: LrSchedule, state: &SchedulerState) -> Result<()> {
    if state.schedule != expected {
        bail!(
            "scheduler state is for a {:?} schedule, current schedule is {:?}",
            state.schedule,
            expected
        );
    }
    Ok(())
}

/// Linear warmup to `base_lr`, then constant.
#[derive(Debug, Clone)]
pub struct ConstantWarmupLR {
    base_lr: f32,
    warmup_steps: usize,
    current_step: usize,
}

impl ConstantWarmupLR {
    pub fn new(base_lr: f32, warmup_steps: usize) -> Self {
        Self {
            base_lr,
            warmup_steps,
            current_step: 0,
        }
    }
}

impl LrScheduler for ConstantWarmupLR {
    fn get_lr(&self) -> f32 {
        if self.current_step < self.warmup_steps {
            return self.base_lr * self.current_step as f32 / self.warmup_steps as f32;
        }
        self.base_lr
    }

    fn step(&mut self) {
        self.current_step += 1;
    }

    fn state_dict(&self) -> SchedulerState {
        SchedulerState {
            schedule: LrSchedule::Constant,
            base_lr: self.base_lr,
            current_step: self.current_step,
            last_lr: self.get_lr(),
        }
    }

    fn load_state_dict(&mut self, state: &SchedulerState) -> Result<()> {
        check_state(LrSchedule::Constant, state)?;
        self.base_lr = state.base_lr;
        self.current_step = state.current_step;
        Ok(())
    }
}

/// Linear warmup, then cosine decay to `min_lr_ratio * base_lr` at
/// `training_steps`.
#[derive(Debug, Clone)]
pub struct WarmupCosineLR {
    base_lr: f32,
    warmup_steps: usize,
    training_steps: usize,
    min_lr_ratio: f32,
    current_step: usize,
}

impl WarmupCosineLR {
    pub fn new(base_lr: f32, warmup_steps: usize, training_steps: usize, min_lr_ratio: f32) -> Self {
        Self {
            base_lr,
            warmup_steps,
            training_steps,
            min_lr_ratio,
            current_step: 0,
        }
    }
}

impl LrScheduler for WarmupCosineLR {
    fn get_lr(&self) -> f32 {
        if self.current_step < self.warmup_steps {
            return self.base_lr * self.current_step as f32 / self.warmup_steps as f32;
        }
        let decay_steps = self.training_steps.saturating_sub(self.warmup_steps).max(1);
        let progress = ((self.current_step - self.warmup_steps) as f32 / decay_steps as f32).min(1.0);
        let cosine = 0.5 * (1.0 + (PI * progress).cos());
        self.base_lr * ((1.0 - self.min_lr_ratio) * cosine + self.min_lr_ratio)
    }

    fn step(&mut self) {
        self.current_step += 1;
    }

    fn state_dict(&self) -> SchedulerState {
        SchedulerState {
            schedule: LrSchedule::Cosine,
            base_lr: self.base_lr,
            current_step: self.current_step,
            last_lr: self.get_lr(),
        }
    }

    fn load_state_dict(&mut self, state: &SchedulerState) -> Result<()> {
        check_state(LrSchedule::Cosine, state)?;
        self.base_lr = state.base_lr;
        self.current_step = state.current_step;
        Ok(())
    }
}

pub fn build_scheduler(config: &OptimConfig) -> Box<dyn LrScheduler> {
    match config.lr_schedule {
        LrSchedule::Constant => Box::new(ConstantWarmupLR::new(config.lr, config.lr_warmup_steps)),
        LrSchedule::Cosine => Box::new(WarmupCosineLR::new(
            config.lr,
            config.lr_warmup_steps,
            config.training_steps,
            config.min_lr_ratio,
        )),
    }
}
