//! rlhf-actor: the policy-gradient actor step of an RLHF trainer.
//!
//! One worker of an SPMD group computes next-token log-probabilities over
//! padded or padding-free (packed, optionally sequence-parallel) micro-batches,
//! optimises a dual-clip PPO surrogate with gradient accumulation, and saves or
//! restores its shard of the model, optimizer, scheduler and RNG state.

pub mod actor;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod distributed;
pub mod error;
pub mod logging;
pub mod loss;
pub mod model;
pub mod optim;
pub mod packing;
