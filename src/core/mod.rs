//! Core infrastructure for paged-kv.
//!
//! This module contains the fundamental building blocks:
//! - Block and BlockTable for PagedAttention
//! - BlockManager for block allocation and prefix caching
//! - Sequence for request tracking

pub mod block;
pub mod block_manager;
pub mod sequence;
