//! Error taxonomy for the actor core.
//!
//! Component boundaries return typed errors so callers can tell a fatal
//! precondition violation apart from a recoverable, best-effort failure.
//! Orchestration code (update loop, checkpoint save/load, CLI) wraps these in
//! `anyhow::Error` with context.

use std::path::PathBuf;

use thiserror::Error;

/// A shape or layout mismatch between tensors that are required to agree.
///
/// Always fatal: these are validated at component boundaries instead of being
/// silently tolerated.
#[derive(Debug, Error, PartialEq)]
pub enum LayoutError {
    #[error("field `{field}` has leading dimension {got}, expected {expected}")]
    LeadingDim {
        field: String,
        expected: usize,
        got: usize,
    },
    #[error("`{what}` has shape {got:?}, expected {expected:?}")]
    Shape {
        what: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("`{what}` must have {expected} dimensions, got {got}")]
    Rank {
        what: String,
        expected: String,
        got: usize,
    },
    #[error(
        "mask cardinality mismatch in sample {sample}: response_mask has {response} true \
         positions, compact_response_mask has {compact}"
    )]
    MaskCardinality {
        sample: usize,
        response: usize,
        compact: usize,
    },
    #[error("missing batch field `{0}`")]
    MissingField(String),
    #[error("batch field `{field}` has type {got}, expected {expected}")]
    FieldType {
        field: String,
        expected: &'static str,
        got: &'static str,
    },
    #[error("{0}")]
    Invalid(String),
}

/// Failure of a blocking collective operation. Fatal to the distributed group.
#[derive(Debug, Error)]
pub enum CollectiveError {
    #[error("collective state poisoned: a peer worker panicked")]
    Poisoned,
    #[error("rank {rank} contributed {got} elements, expected {expected}")]
    SizeMismatch {
        rank: usize,
        expected: usize,
        got: usize,
    },
    #[error("communicator group size {group} does not match configured size {configured}")]
    GroupSize { group: usize, configured: usize },
    #[error("collective aborted: a peer worker failed")]
    Aborted,
}

/// Failure of the best-effort consolidated model export.
///
/// Never propagated out of a checkpoint save; the caller logs it and moves on.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("model type `{0}` does not support consolidated export")]
    UnsupportedModel(String),
    #[error("failed to gather full model state: {0}")]
    Gather(#[from] CollectiveError),
    #[error("failed to serialize consolidated weights: {0}")]
    Serialize(String),
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to export processor artifacts: {0}")]
    Processor(String),
}
