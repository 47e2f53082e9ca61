use std::ops::Range;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use super::Communicator;

/// Identity of one worker within a fixed-size group.
///
/// Names the worker's checkpoint files and fixes which contiguous range of
/// the flat model/optimizer state it owns. For a given world size the ranges
/// of all ranks tile `0..total_numel` with no overlap and no gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardDescriptor {
    pub rank: usize,
    pub world_size: usize,
}

impl ShardDescriptor {
    pub fn new(rank: usize, world_size: usize) -> Result<Self> {
        if world_size == 0 {
            bail!("world size must be positive");
        }
        if rank >= world_size {
            bail!("rank {} out of range for world size {}", rank, world_size);
        }
        Ok(Self { rank, world_size })
    }

    pub fn of(comm: &dyn Communicator) -> Self {
        Self {
            rank: comm.rank(),
            world_size: comm.world_size().max(1),
        }
    }

    pub fn model_file(&self) -> String {
        format!("model_world_size_{}_rank_{}.pt", self.world_size, self.rank)
    }

    pub fn optim_file(&self) -> String {
        format!("optim_world_size_{}_rank_{}.pt", self.world_size, self.rank)
    }

    pub fn extra_state_file(&self) -> String {
        format!(
            "extra_state_world_size_{}_rank_{}.pt",
            self.world_size, self.rank
        )
    }

    /// Elements per rank; the last ranks may hold fewer (or none).
    pub fn chunk_size(&self, total_numel: usize) -> usize {
        total_numel.div_ceil(self.world_size)
    }

    /// The flat range owned by this rank.
    pub fn flat_range(&self, total_numel: usize) -> Range<usize> {
        let chunk = self.chunk_size(total_numel);
        let start = (self.rank * chunk).min(total_numel);
        let end = (start + chunk).min(total_numel);
        start..end
    }
}
