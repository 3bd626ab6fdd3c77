//! paged-kv: the paged KV cache allocator of a text-generation engine.
//!
//! A fixed pool of fixed-size cache blocks is shared by many concurrent
//! generation sequences:
//! - PagedAttention block tables map each sequence's tokens to blocks
//! - Reference counting lets sequences share blocks
//! - Prefix caching reuses full blocks through chain hashes
//! - Per-batch execution contexts hand the indices to the attention layer

pub mod config;
pub mod error;

pub mod core;
pub mod engine;

pub use config::{CacheConfig, SamplingConfig, BLOCK_SIZE_ALIGNMENT};
pub use crate::core::block::{compute_hash, compute_num_blocks, Block, BlockTable};
pub use crate::core::block_manager::BlockManager;
pub use crate::core::sequence::{
    Sequence, SequenceId, SequenceSnapshot, SequenceStatus, SnapshotPayload,
};
pub use engine::{Context, PreparedBatch};
pub use error::{Error, Result};
