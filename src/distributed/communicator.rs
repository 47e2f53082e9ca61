//! Blocking collectives shared by every worker in an SPMD group.
//!
//! There is no timeout and no retry: a collective either completes on every
//! rank or the group is lost. A worker that fails outside a collective calls
//! [`Communicator::abort`] so its peers return [`CollectiveError::Aborted`]
//! instead of waiting for it.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::error::CollectiveError;

/// The collective operations the actor core needs.
pub trait Communicator: Send + Sync {
    /// This worker's ordinal within the group.
    fn rank(&self) -> usize;

    /// Number of workers in the group.
    fn world_size(&self) -> usize;

    /// Block until every worker in the group has arrived.
    fn barrier(&self) -> Result<(), CollectiveError>;

    /// Collect every worker's contribution, returned in rank order.
    fn all_gather(&self, local: &[f32]) -> Result<Vec<Vec<f32>>, CollectiveError>;

    /// Mark the group as lost. Pending and future collectives on every rank
    /// fail with [`CollectiveError::Aborted`].
    fn abort(&self) {}

    /// Element-wise sum across the group, written back into `values`.
    ///
    /// Contributions are added in rank order so every worker computes a
    /// bit-identical result.
    fn all_reduce_sum(&self, values: &mut [f32]) -> Result<(), CollectiveError> {
        let parts = self.all_gather(values)?;
        for (rank, part) in parts.iter().enumerate() {
            if part.len() != values.len() {
                return Err(CollectiveError::SizeMismatch {
                    rank,
                    expected: values.len(),
                    got: part.len(),
                });
            }
        }
        for (i, value) in values.iter_mut().enumerate() {
            *value = parts.iter().fold(0.0, |acc, part| acc + part[i]);
        }
        Ok(())
    }
}

/// A group of one: every collective is local.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpCommunicator;

impl Communicator for NoOpCommunicator {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn barrier(&self) -> Result<(), CollectiveError> {
        Ok(())
    }

    fn all_gather(&self, local: &[f32]) -> Result<Vec<Vec<f32>>, CollectiveError> {
        Ok(vec![local.to_vec()])
    }
}

// ---------------------------------------------------------------------------
// In-process group
// ---------------------------------------------------------------------------

struct SyncState {
    arrived: usize,
    generation: u64,
    aborted: bool,
    slots: Vec<Vec<f32>>,
}

struct GroupState {
    world_size: usize,
    sync: Mutex<SyncState>,
    released: Condvar,
}

impl GroupState {
    fn lock(&self) -> Result<MutexGuard<'_, SyncState>, CollectiveError> {
        self.sync.lock().map_err(|_| CollectiveError::Poisoned)
    }

    /// Generation barrier. Returns with the lock held once every rank has
    /// arrived, or fails as soon as the group is aborted.
    fn wait<'a>(
        &'a self,
        mut guard: MutexGuard<'a, SyncState>,
    ) -> Result<MutexGuard<'a, SyncState>, CollectiveError> {
        if guard.aborted {
            return Err(CollectiveError::Aborted);
        }
        let generation = guard.generation;
        guard.arrived += 1;
        if guard.arrived == self.world_size {
            guard.arrived = 0;
            guard.generation = guard.generation.wrapping_add(1);
            self.released.notify_all();
            return Ok(guard);
        }
        loop {
            guard = self
                .released
                .wait(guard)
                .map_err(|_| CollectiveError::Poisoned)?;
            // A completed generation wins over a later abort.
            if guard.generation != generation {
                return Ok(guard);
            }
            if guard.aborted {
                return Err(CollectiveError::Aborted);
            }
        }
    }
}

/// In-process group whose workers are threads of the same program.
///
/// Each rank's handle must be driven from its own thread; collectives block
/// until all ranks have entered them or one rank aborts the group.
pub struct LocalCommunicator {
    rank: usize,
    state: Arc<GroupState>,
}

impl LocalCommunicator {
    /// Create the handles of a group of `world_size` workers, indexed by rank.
    pub fn group(world_size: usize) -> Vec<Arc<dyn Communicator>> {
        let world_size = world_size.max(1);
        let state = Arc::new(GroupState {
            world_size,
            sync: Mutex::new(SyncState {
                arrived: 0,
                generation: 0,
                aborted: false,
                slots: vec![Vec::new(); world_size],
            }),
            released: Condvar::new(),
        });
        (0..world_size)
            .map(|rank| {
                Arc::new(LocalCommunicator {
                    rank,
                    state: Arc::clone(&state),
                }) as Arc<dyn Communicator>
            })
            .collect()
    }
}

impl Communicator for LocalCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.state.world_size
    }

    fn barrier(&self) -> Result<(), CollectiveError> {
        let guard = self.state.lock()?;
        self.state.wait(guard)?;
        Ok(())
    }

    fn all_gather(&self, local: &[f32]) -> Result<Vec<Vec<f32>>, CollectiveError> {
        let mut guard = self.state.lock()?;
        if guard.aborted {
            return Err(CollectiveError::Aborted);
        }
        guard.slots[self.rank] = local.to_vec();
        // Everyone has written.
        let guard = self.state.wait(guard)?;
        let gathered = guard.slots.clone();
        // Everyone has read; slots may be reused.
        self.state.wait(guard)?;
        Ok(gathered)
    }

    fn abort(&self) {
        let mut guard = match self.state.sync.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.aborted = true;
        self.state.released.notify_all();
    }
}
