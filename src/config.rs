use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Complete configuration for one actor worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub actor: ActorConfig,
    pub optim: OptimConfig,
    pub checkpoint: CheckpointConfig,
    pub logging: LoggingConfig,
}

impl TrainerConfig {
    /// Load a JSON configuration file; missing keys take their defaults.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.actor.validate()?;
        Ok(config)
    }
}

/// How per-token values are reduced to a scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossAvgMode {
    /// Mean over every valid token in the micro-batch.
    Token,
    /// Mean over valid tokens within each sample, then mean over samples.
    Seq,
}

/// KL estimator used for the reference-policy penalty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KlPenalty {
    Kl,
    Abs,
    Mse,
    LowVarKl,
}

/// Policy-gradient actor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActorConfig {
    /// Samples per optimizer step on this device (mini-batch, default: 8).
    pub global_batch_size_per_device: usize,
    /// Samples per forward/backward pass during the update (default: 2).
    pub micro_batch_size_per_device_for_update: usize,
    /// Samples per forward pass when computing log-probs only (default: 4).
    pub micro_batch_size_per_device_for_experience: usize,
    /// Passes over the update batch (default: 1).
    pub ppo_epochs: usize,
    /// Remove padding and run the model on a packed sequence (default: true).
    pub padding_free: bool,
    /// Sequence-parallel group size; 1 disables slicing (default: 1).
    pub ulysses_size: usize,
    /// Lower clip bound: ratios below `1 - clip_ratio_low` are clipped (default: 0.2).
    pub clip_ratio_low: f32,
    /// Upper clip bound: ratios above `1 + clip_ratio_high` are clipped (default: 0.3).
    pub clip_ratio_high: f32,
    /// Dual-clip constant bounding the loss for negative advantages (default: 3.0).
    pub clip_ratio_dual: f32,
    /// Loss averaging mode (default: token).
    pub loss_avg_mode: LossAvgMode,
    /// Add a KL penalty against the reference policy (default: false).
    pub use_kl_loss: bool,
    /// KL estimator (default: low_var_kl).
    pub kl_penalty: KlPenalty,
    /// KL penalty coefficient (default: 1e-2).
    pub kl_coef: f32,
    /// Maximum global gradient norm (default: 1.0).
    pub max_grad_norm: f32,
    /// Shuffle samples before splitting into mini-batches (default: false).
    pub shuffle_mini_batches: bool,
    /// Emit per-batch progress logs on rank 0 (default: true).
    pub log_progress: bool,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            global_batch_size_per_device: 8,
            micro_batch_size_per_device_for_update: 2,
            micro_batch_size_per_device_for_experience: 4,
            ppo_epochs: 1,
            padding_free: true,
            ulysses_size: 1,
            clip_ratio_low: 0.2,
            clip_ratio_high: 0.3,
            clip_ratio_dual: 3.0,
            loss_avg_mode: LossAvgMode::Token,
            use_kl_loss: false,
            kl_penalty: KlPenalty::LowVarKl,
            kl_coef: 1e-2,
            max_grad_norm: 1.0,
            shuffle_mini_batches: false,
            log_progress: true,
        }
    }
}

impl ActorConfig {
    /// Reject configurations the update loop cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.global_batch_size_per_device == 0
            || self.micro_batch_size_per_device_for_update == 0
            || self.micro_batch_size_per_device_for_experience == 0
        {
            bail!("batch sizes must be positive");
        }
        if self.micro_batch_size_per_device_for_update > self.global_batch_size_per_device {
            bail!(
                "micro batch size ({}) exceeds mini batch size ({})",
                self.micro_batch_size_per_device_for_update,
                self.global_batch_size_per_device
            );
        }
        if self.ppo_epochs == 0 {
            bail!("ppo_epochs must be positive");
        }
        if self.ulysses_size == 0 {
            bail!("ulysses_size must be at least 1");
        }
        if !(0.0..1.0).contains(&self.clip_ratio_low) {
            bail!("clip_ratio_low must lie in [0, 1), got {}", self.clip_ratio_low);
        }
        if self.clip_ratio_high < 0.0 {
            bail!("clip_ratio_high must be non-negative, got {}", self.clip_ratio_high);
        }
        if self.clip_ratio_dual <= 1.0 {
            bail!("clip_ratio_dual must be greater than 1, got {}", self.clip_ratio_dual);
        }
        if !(self.max_grad_norm > 0.0) {
            bail!("max_grad_norm must be positive, got {}", self.max_grad_norm);
        }
        Ok(())
    }

    /// Number of micro-batches whose gradients make up one optimizer step.
    pub fn gradient_accumulation(&self) -> usize {
        (self.global_batch_size_per_device / self.micro_batch_size_per_device_for_update).max(1)
    }
}

/// Learning-rate schedule shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LrSchedule {
    Constant,
    Cosine,
}

/// Optimizer and schedule configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimConfig {
    /// Peak learning rate (default: 1e-6).
    pub lr: f32,
    /// Adam betas (default: [0.9, 0.999]).
    pub betas: [f32; 2],
    /// Adam epsilon (default: 1e-8).
    pub eps: f32,
    /// Decoupled weight decay (default: 1e-2).
    pub weight_decay: f32,
    /// Linear warmup steps (default: 0).
    pub lr_warmup_steps: usize,
    /// Schedule after warmup (default: constant).
    pub lr_schedule: LrSchedule,
    /// Total scheduler steps, used by the cosine schedule (default: 1000).
    pub training_steps: usize,
    /// Cosine floor as a fraction of the peak LR (default: 0.0).
    pub min_lr_ratio: f32,
    /// Seed for the worker RNG; the rank is mixed in (default: 1).
    pub seed: u64,
}

impl Default for OptimConfig {
    fn default() -> Self {
        Self {
            lr: 1e-6,
            betas: [0.9, 0.999],
            eps: 1e-8,
            weight_decay: 1e-2,
            lr_warmup_steps: 0,
            lr_schedule: LrSchedule::Constant,
            training_steps: 1000,
            min_lr_ratio: 0.0,
            seed: 1,
        }
    }
}

/// Checkpoint behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Attempt the consolidated `merged_model/` export on save (default: true).
    pub export_merged_model: bool,
    /// Keep at most this many saved checkpoint directories (default: unlimited).
    pub max_ckpt_to_keep: Option<usize>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            export_merged_model: true,
            max_ckpt_to_keep: None,
        }
    }
}

/// Where log lines go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSink {
    Stderr,
    Stdout,
    File(PathBuf),
}

/// Logging configuration, consumed once by [`crate::logging::init_tracing`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, overridden by `RUST_LOG` (default: "info").
    pub level: String,
    /// Output sink (default: stderr).
    pub sink: LogSink,
    /// ANSI colours for terminal sinks (default: true).
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            sink: LogSink::Stderr,
            ansi: true,
        }
    }
}
