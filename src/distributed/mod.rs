//! SPMD worker plumbing: collectives, shard identity and the sharded model.
//!
//! - [`Communicator`] -- blocking barrier / all-gather / all-reduce, with a
//!   single-worker [`NoOpCommunicator`] and an in-process thread group
//!   ([`LocalCommunicator::group`]).
//! - [`ShardDescriptor`] -- rank + world size; checkpoint file names and the
//!   flat range a worker owns.
//! - [`WorkerEnv`] -- rank information exported by the launcher.
//! - [`ShardedModel`] -- replica for compute, owned flat range for state.

pub mod communicator;
pub mod env;
pub mod shard;
pub mod sharded;

pub use communicator::{Communicator, LocalCommunicator, NoOpCommunicator};
pub use env::WorkerEnv;
pub use shard::ShardDescriptor;
pub use sharded::ShardedModel;
