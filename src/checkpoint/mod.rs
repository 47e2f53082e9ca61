//! Sharded checkpoints.
//!
//! Directory layout for world size `W` and rank `R`:
//!
//! ```text
//! <path>/model_world_size_{W}_rank_{R}.pt        owned flat parameter range
//! <path>/optim_world_size_{W}_rank_{R}.pt        optimizer buffers for that range
//! <path>/extra_state_world_size_{W}_rank_{R}.pt  {"lr_scheduler", "rng"}
//! <path>/merged_model/                           consolidated snapshot (rank 0, best effort)
//! ```

pub mod export;
pub mod format;
pub mod manager;
pub mod rng;

pub use export::{export_consolidated_model, ConsolidatedModel, MERGED_MODEL_DIR};
pub use format::{ExtraState, ModelShardState, OptimizerShardState, ShardHeader};
pub use manager::{CheckpointManager, Checkpointable, LoadOutcome};
pub use rng::{RngSnapshot, WorkerRng};
