use anyhow::Result;
use ndarray::Array2;

use super::forward::ActorCore;
use super::{consolidate, model_shard_of};
use crate::checkpoint::{Checkpointable, ConsolidatedModel, ModelShardState};
use crate::data::Batch;
use crate::error::ExportError;
use crate::model::CausalLm;

/// A frozen policy that only scores sequences, e.g. the KL reference.
pub struct ReferencePolicy<M: CausalLm> {
    core: ActorCore<M>,
}

impl<M: CausalLm> ReferencePolicy<M> {
    pub fn new(core: ActorCore<M>) -> Self {
        Self { core }
    }

    pub fn core(&self) -> &ActorCore<M> {
        &self.core
    }

    /// Compact log-probabilities of every sample in `data`.
    pub fn compute_log_prob(&mut self, data: &Batch) -> Result<Array2<f32>> {
        self.core.compute_log_prob(data)
    }
}

impl<M: CausalLm> Checkpointable for ReferencePolicy<M> {
    fn model_shard(&self) -> ModelShardState {
        model_shard_of(self.core.model())
    }

    fn load_model_shard(&mut self, state: ModelShardState) -> Result<()> {
        self.core.model_mut().load_local_params(state.values)
    }

    fn consolidated_model(&self) -> Result<ConsolidatedModel, ExportError> {
        consolidate(self.core.model())
    }
}
