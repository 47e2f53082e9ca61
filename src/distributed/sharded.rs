//! Flat-parameter sharding of a model across the world (FSDP style).
//!
//! Every worker keeps a full replica of the module for compute and owns one
//! contiguous range of the flattened parameter vector. The owned range is the
//! authoritative copy: the optimizer updates it, checkpoints persist it, and
//! [`ShardedModel::sync_module_params`] all-gathers the ranges back into every
//! replica.

use std::ops::Range;
use std::sync::Arc;

use anyhow::{ensure, Result};
use ndarray::{s, Array1};
use tracing::debug;

use super::{Communicator, ShardDescriptor};
use crate::error::CollectiveError;
use crate::model::{CausalLm, NamedTensor};
use crate::optim::{scale_to_max_norm, squared_norm};

// ---------------------------------------------------------------------------
// Sharded model
// ---------------------------------------------------------------------------

/// A module replicated for compute whose parameter and gradient state is
/// partitioned across the world.
pub struct ShardedModel<M: CausalLm> {
    /// Full replica used for forward and backward passes.
    module: M,
    /// The data-parallel world the flat vector is partitioned over.
    comm: Arc<dyn Communicator>,
    shard: ShardDescriptor,
    /// Length of the flattened parameter vector across all shards.
    total_numel: usize,
    /// The owned slice of the flattened vector.
    range: Range<usize>,
    /// Authoritative values of the owned range.
    local_params: Array1<f32>,
    /// World-averaged gradients of the owned range, set by
    /// [`ShardedModel::reduce_gradients`].
    local_grads: Array1<f32>,
}

impl<M: CausalLm> ShardedModel<M> {
    /// Shard `module` over `comm`. Collective: every worker must call this
    /// with a module of identical layout.
    pub fn new(module: M, comm: Arc<dyn Communicator>) -> Result<Self, CollectiveError> {
        let total_numel = module.num_parameters();
        let sizes = comm.all_gather(&[total_numel as f32])?;
        for (rank, size) in sizes.iter().enumerate() {
            if size.first().copied() != Some(total_numel as f32) {
                return Err(CollectiveError::SizeMismatch {
                    rank,
                    expected: total_numel,
                    got: size.first().map(|&n| n as usize).unwrap_or(0),
                });
            }
        }

        let shard = ShardDescriptor::of(comm.as_ref());
        let range = shard.flat_range(total_numel);
        let flat = flatten(module.parameters().iter().map(|p| &p.data), total_numel);
        let local_params = flat.slice(s![range.clone()]).to_owned();
        let local_grads = Array1::zeros(range.len());
        let mut sharded = Self {
            module,
            comm,
            shard,
            total_numel,
            range,
            local_params,
            local_grads,
        };
        // Replicas start from the owned ranges, not from each rank's own init.
        sharded.sync_module_params()?;
        debug!(
            rank = shard.rank,
            world_size = shard.world_size,
            total_numel,
            local_numel = sharded.range.len(),
            "Sharded model parameters"
        );
        Ok(sharded)
    }

    /// The local replica.
    pub fn module(&self) -> &M {
        &self.module
    }

    /// Mutable replica, for forward and backward passes. Parameter edits made
    /// through it are overwritten by the next [`ShardedModel::sync_module_params`].
    pub fn module_mut(&mut self) -> &mut M {
        &mut self.module
    }

    pub fn communicator(&self) -> &Arc<dyn Communicator> {
        &self.comm
    }

    /// This worker's rank and world size.
    pub fn shard(&self) -> ShardDescriptor {
        self.shard
    }

    /// Number of elements in the full flattened parameter vector.
    pub fn total_numel(&self) -> usize {
        self.total_numel
    }

    /// The owned range of the flattened parameter vector.
    pub fn flat_range(&self) -> Range<usize> {
        self.range.clone()
    }

    /// Owned parameter values.
    pub fn local_params(&self) -> &Array1<f32> {
        &self.local_params
    }

    /// Owned gradients; zero until the next [`ShardedModel::reduce_gradients`].
    pub fn local_grads(&self) -> &Array1<f32> {
        &self.local_grads
    }

    /// Owned parameters and their reduced gradients, for the optimizer.
    pub fn shard_mut(&mut self) -> (&mut Array1<f32>, &Array1<f32>) {
        (&mut self.local_params, &self.local_grads)
    }

    /// Drop the owned gradients and the replica's accumulated gradients.
    pub fn zero_grad(&mut self) {
        self.local_grads.fill(0.0);
        self.module.zero_grad();
    }
}

// ---------------------------------------------------------------------------
// Collectives
// ---------------------------------------------------------------------------

impl<M: CausalLm> ShardedModel<M> {
    /// Replace the owned parameter range and refresh every replica. Collective.
    pub fn load_local_params(&mut self, values: Array1<f32>) -> Result<()> {
        ensure!(
            values.len() == self.range.len(),
            "model shard holds {} elements, this worker owns {}",
            values.len(),
            self.range.len()
        );
        self.local_params = values;
        self.sync_module_params()?;
        Ok(())
    }

    /// Full flat parameter vector assembled from every worker's range. Collective.
    pub fn gather_full_params(&self) -> Result<Array1<f32>, CollectiveError> {
        let parts = self.comm.all_gather(&self.local_params.to_vec())?;
        let full: Vec<f32> = parts.concat();
        if full.len() != self.total_numel {
            return Err(CollectiveError::SizeMismatch {
                rank: self.shard.rank,
                expected: self.total_numel,
                got: full.len(),
            });
        }
        Ok(Array1::from(full))
    }

    /// Write the gathered flat parameters into the local replica. Collective.
    pub fn sync_module_params(&mut self) -> Result<(), CollectiveError> {
        let full = self.gather_full_params()?;
        let mut offset = 0;
        for param in self.module.parameters_mut() {
            let n = param.numel();
            param.data.assign(&full.slice(s![offset..offset + n]));
            offset += n;
        }
        Ok(())
    }

    /// Named, shaped tensors of the full model. Collective.
    pub fn named_full_params(&self) -> Result<Vec<NamedTensor>, CollectiveError> {
        let full = self.gather_full_params()?;
        let mut offset = 0;
        Ok(self
            .module
            .parameters()
            .iter()
            .map(|param| {
                let n = param.numel();
                let data = full.slice(s![offset..offset + n]).to_vec();
                offset += n;
                NamedTensor {
                    name: param.name.clone(),
                    shape: param.shape.clone(),
                    data,
                }
            })
            .collect())
    }

    /// Average the replica gradients over the world and keep the owned range.
    /// Clears the replica gradients. Collective.
    pub fn reduce_gradients(&mut self) -> Result<(), CollectiveError> {
        let mut full = flatten(
            self.module.parameters().iter().map(|p| &p.grad),
            self.total_numel,
        )
        .to_vec();
        self.comm.all_reduce_sum(&mut full)?;
        let world = self.shard.world_size as f32;
        let owned = &full[self.range.clone()];
        self.local_grads = owned.iter().map(|&g| g / world).collect();
        self.module.zero_grad();
        Ok(())
    }

    /// Clip the owned gradients by the global norm over every shard and return
    /// the norm measured before clipping. Every worker observes the same value.
    /// Collective.
    pub fn clip_grad_norm(&mut self, max_norm: f32) -> Result<f32, CollectiveError> {
        let mut total = [squared_norm(self.local_grads.view())];
        self.comm.all_reduce_sum(&mut total)?;
        let norm = total[0].sqrt();
        scale_to_max_norm(&mut self.local_grads, norm, max_norm);
        Ok(norm)
    }
}

fn flatten<'a>(parts: impl Iterator<Item = &'a Array1<f32>>, total: usize) -> Array1<f32> {
    let mut flat = Vec::with_capacity(total);
    for part in parts {
        flat.extend(part.iter().copied());
    }
    Array1::from(flat)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::{LocalCommunicator, NoOpCommunicator};
    use crate::model::{BigramConfig, BigramLm};
    use approx::assert_abs_diff_eq;

    fn model(seed: u64) -> BigramLm {
        BigramLm::new(
            BigramConfig {
                vocab_size: 3,
                max_position_embeddings: 2,
                position_axes: 1,
            },
            seed,
        )
    }

    #[test]
    fn test_single_worker_owns_everything() {
        let sharded = ShardedModel::new(model(1), Arc::new(NoOpCommunicator)).unwrap();
        assert_eq!(sharded.total_numel(), 9 + 6);
        assert_eq!(sharded.flat_range(), 0..15);
        let full = sharded.gather_full_params().unwrap();
        let names: Vec<_> = sharded
            .named_full_params()
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(full.len(), 15);
        assert_eq!(names, vec!["embed_tokens.weight", "position_bias.weight"]);
    }

    #[test]
    fn test_replicas_agree_after_construction() {
        let group = LocalCommunicator::group(2);
        let replicas: Vec<Vec<f32>> = std::thread::scope(|s| {
            let handles: Vec<_> = group
                .iter()
                .map(|comm| {
                    s.spawn(move || {
                        // Different seeds per rank: the owned ranges win.
                        let sharded = ShardedModel::new(model(10 + comm.rank() as u64), Arc::clone(comm)).unwrap();
                        sharded
                            .module()
                            .parameters()
                            .iter()
                            .flat_map(|p| p.data.to_vec())
                            .collect()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(replicas[0], replicas[1]);
        let rank0 = model(10).parameters()[0].data.to_vec();
        assert_eq!(replicas[0][..8], rank0[..8]);
    }

    #[test]
    fn test_gradients_averaged_and_norm_global() {
        let group = LocalCommunicator::group(2);
        let results: Vec<(Vec<f32>, f32)> = std::thread::scope(|s| {
            let handles: Vec<_> = group
                .iter()
                .map(|comm| {
                    s.spawn(move || {
                        let mut sharded = ShardedModel::new(model(3), Arc::clone(comm)).unwrap();
                        let value = if comm.rank() == 0 { 1.0 } else { 3.0 };
                        for p in sharded.module_mut().parameters_mut() {
                            p.grad.fill(value);
                        }
                        sharded.reduce_gradients().unwrap();
                        assert!(sharded
                            .module()
                            .parameters()
                            .iter()
                            .all(|p| p.grad.iter().all(|&g| g == 0.0)));
                        let norm = sharded.clip_grad_norm(1e6).unwrap();
                        (sharded.local_grads().to_vec(), norm)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        // Mean gradient is 2.0 everywhere; 15 elements in total.
        assert_eq!(results[0].0.len(), 8);
        assert_eq!(results[1].0.len(), 7);
        assert!(results.iter().all(|(g, _)| g.iter().all(|&x| x == 2.0)));
        for (_, norm) in &results {
            assert_abs_diff_eq!(*norm, (15.0f32 * 4.0).sqrt(), epsilon = 1e-5);
        }
    }

    #[test]
    fn test_load_local_params_checks_size() {
        let mut sharded = ShardedModel::new(model(1), Arc::new(NoOpCommunicator)).unwrap();
        assert!(sharded.load_local_params(Array1::zeros(3)).is_err());
        sharded.load_local_params(Array1::ones(15)).unwrap();
        assert!(sharded
            .module()
            .parameters()
            .iter()
            .all(|p| p.data.iter().all(|&x| x == 1.0)));
    }
}
