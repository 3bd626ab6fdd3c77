//! Error types for paged-kv.

use thiserror::Error;

/// Result type alias for paged-kv operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for paged-kv.
///
/// `CapacityViolation` and `InvariantViolation` are contract breaches: the
/// caller skipped a `can_*` check or the pool bookkeeping is already broken.
/// A hash hit whose block holds different tokens is a plain cache miss and
/// never surfaces here.
#[derive(Error, Debug)]
pub enum Error {
    /// Not enough free blocks for the requested operation.
    #[error("KV cache capacity violation: need {needed} free blocks, have {free}")]
    CapacityViolation { needed: usize, free: usize },

    /// Pool or block-table bookkeeping is inconsistent.
    #[error("KV cache invariant violated: {0}")]
    InvariantViolation(String),

    /// Logical block index is not present in a block table.
    #[error("block index {logical_idx} out of bounds (num_blocks: {num_blocks})")]
    BlockIndexOutOfBounds { logical_idx: usize, num_blocks: usize },

    /// Invalid sequence state transition.
    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidStateTransition {
        from: &'static str,
        to: &'static str,
    },

    /// A sequence snapshot does not describe a consistent sequence.
    #[error("invalid sequence snapshot: {0}")]
    InvalidSnapshot(String),

    /// The token history was not carried by the snapshot this sequence came from.
    #[error("token ids are not available for a sequence restored from its last token")]
    TokensUnavailable,

    /// A batch must contain at least one sequence.
    #[error("cannot prepare an empty batch")]
    EmptyBatch,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
