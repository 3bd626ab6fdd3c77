//! Engine-side plumbing between the allocator and the model.
//!
//! This module contains:
//! - Context and PreparedBatch, the per-batch inputs of a forward pass

pub mod context;

pub use context::{Context, PreparedBatch};
