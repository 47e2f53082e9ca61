//! The policy actor: next-token log-probabilities over padded or packed
//! micro-batches, and the PPO-style update loop.
//!
//! [`ReferencePolicy`] only scores sequences. [`TrainablePolicy`] adds
//! `update_policy`, which runs epochs of mini-batches, accumulates gradients
//! over micro-batches and takes one optimizer step per mini-batch. Both wrap
//! the same [`ActorCore`].

pub mod forward;
pub mod log_probs;
pub mod reference;
pub mod trainable;

pub use forward::{collect_aux_inputs, ActorCore, ForwardTape, FORWARD_KEYS, MULTI_MODAL_KEY};
pub use log_probs::{log_probs_from_logits, logits_grad, TokenLogProbs};
pub use reference::ReferencePolicy;
pub use trainable::TrainablePolicy;

use crate::checkpoint::{ConsolidatedModel, ModelShardState};
use crate::distributed::ShardedModel;
use crate::error::ExportError;
use crate::model::CausalLm;

fn model_shard_of<M: CausalLm>(model: &ShardedModel<M>) -> ModelShardState {
    ModelShardState {
        shard: model.shard(),
        offset: model.flat_range().start,
        total_numel: model.total_numel(),
        values: model.local_params().clone(),
    }
}

/// Gather the full model. Collective, so every worker must call it even when
/// the model cannot be exported.
fn consolidate<M: CausalLm>(model: &ShardedModel<M>) -> Result<ConsolidatedModel, ExportError> {
    let tensors = model.named_full_params()?;
    Ok(ConsolidatedModel {
        model_type: model.module().model_type().to_string(),
        tensors,
        pretrained: model.module().pretrained_config(),
    })
}
