//! Batch container, mask utilities and metric bookkeeping shared by the actor.
//!
//! - [`batch::Batch`] -- named tensor / non-tensor fields with a shared sample
//!   dimension, supporting `select`, `split`, `concat` and `shuffle`.
//! - [`mask`] -- conversion between the padded `response_mask` layout and the
//!   compact, padding-free response layout.
//! - [`metrics::MetricsLog`] -- per-key ordered metric values.

pub mod batch;
pub mod mask;
pub mod metrics;

pub use batch::{AuxInputs, Batch, TensorField};
pub use mask::{
    compact_mask_from_response, count_true, gather_from_compact, scatter_to_compact,
    validate_mask_pair,
};
pub use metrics::MetricsLog;
