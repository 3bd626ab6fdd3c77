//! Block manager for PagedAttention.
//!
//! The BlockManager owns the fixed pool of KV cache blocks and fills in each
//! sequence's block table, similar to how an operating system manages
//! physical memory pages.
//!
//! ## Features
//!
//! - **Free list allocation**: FIFO queue of free block ids
//! - **Reference counting**: a block returns to the pool exactly when its
//!   count drops to zero
//! - **Prefix caching**: full blocks are indexed by chain hash and reused by
//!   later sequences with the same leading tokens
//!
//! ## Lifecycle
//!
//! ```text
//!   can_allocate ─► allocate          (prefill, once)
//!   can_append   ─► may_append        (every decode step, after append_token)
//!   deallocate                        (finished or preempted)
//! ```
//!
//! ## Example
//!
//! ```
//! use paged_kv::core::block_manager::BlockManager;
//! use paged_kv::core::sequence::Sequence;
//!
//! let mut manager = BlockManager::new(4, 2);
//! let mut a = Sequence::new(vec![1, 2, 3, 4], 2);
//! let mut b = Sequence::new(vec![1, 2, 9, 9], 2);
//!
//! assert!(manager.can_allocate(&a));
//! manager.allocate(&mut a).unwrap();
//! manager.allocate(&mut b).unwrap();
//!
//! // First block is shared, so only three blocks are in use.
//! assert_eq!(b.block_table().get_block_id(0).unwrap(), a.block_table().get_block_id(0).unwrap());
//! assert_eq!(b.num_cached_tokens(), 2);
//! assert_eq!(manager.num_free_blocks(), 1);
//! ```

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::{debug, trace, warn};

use crate::config::CacheConfig;
use crate::core::block::{compute_hash, Block};
use crate::core::sequence::Sequence;
use crate::error::{Error, Result};

/// Manages allocation and deallocation of KV cache blocks.
///
/// Every method takes `&mut self` for mutation; the manager assumes a single
/// mutator and holds no locks. Wrap it in a mutex or an actor if requests are
/// admitted from several threads.
#[derive(Debug)]
pub struct BlockManager {
    /// All blocks indexed by block_id. Never resized.
    blocks: Vec<Block>,
    /// Free block IDs in FIFO order.
    free_block_ids: VecDeque<usize>,
    /// Block IDs referenced by at least one sequence.
    used_block_ids: HashSet<usize>,
    /// Chain hash -> block_id of the last block finalized with that hash.
    hash_to_block_id: HashMap<u64, usize>,
    /// Number of tokens per block.
    block_size: usize,
}

impl BlockManager {
    /// Create a new block manager with the specified capacity.
    ///
    /// # Panics
    ///
    /// Panics if `num_blocks` is zero or `block_size < 2`. Use
    /// [`try_new`](Self::try_new) when the sizes come from user input.
    ///
    /// # Example
    ///
    /// ```
    /// use paged_kv::core::block_manager::BlockManager;
    ///
    /// let manager = BlockManager::new(1024, 16);
    /// assert_eq!(manager.num_free_blocks(), 1024);
    /// ```
    pub fn new(num_blocks: usize, block_size: usize) -> Self {
        match Self::try_new(num_blocks, block_size) {
            Ok(manager) => manager,
            Err(e) => panic!("{e}"),
        }
    }

    /// Create a new block manager, rejecting unusable sizes.
    ///
    /// A one-token block would start and complete on the same token, which
    /// the append protocol does not model, so `block_size` must be at least 2.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `num_blocks` is zero or `block_size < 2`.
    pub fn try_new(num_blocks: usize, block_size: usize) -> Result<Self> {
        if num_blocks == 0 {
            return Err(Error::Config("num_blocks must be positive".to_string()));
        }
        if block_size < 2 {
            return Err(Error::Config(format!(
                "block_size must be at least 2, got {block_size}"
            )));
        }

        Ok(Self {
            blocks: (0..num_blocks).map(Block::new).collect(),
            free_block_ids: (0..num_blocks).collect(),
            used_block_ids: HashSet::with_capacity(num_blocks),
            hash_to_block_id: HashMap::new(),
            block_size,
        })
    }

    /// Create a block manager from a validated cache configuration.
    pub fn from_config(config: &CacheConfig) -> Result<Self> {
        config.validate()?;
        Self::try_new(config.num_blocks, config.block_size)
    }

    /// Get the block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Get the total number of blocks.
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Get the number of free blocks.
    pub fn num_free_blocks(&self) -> usize {
        self.free_block_ids.len()
    }

    /// Get the number of used blocks.
    pub fn num_used_blocks(&self) -> usize {
        self.used_block_ids.len()
    }

    /// Free block IDs in the order they will be handed out.
    pub fn free_block_ids(&self) -> impl Iterator<Item = usize> + '_ {
        self.free_block_ids.iter().copied()
    }

    /// Check if a block is currently referenced by some sequence.
    pub fn is_block_used(&self, block_id: usize) -> bool {
        self.used_block_ids.contains(&block_id)
    }

    /// Get a reference to a block.
    pub fn get_block(&self, block_id: usize) -> Option<&Block> {
        self.blocks.get(block_id)
    }

    /// Block ID currently indexed under a chain hash.
    ///
    /// This is a reuse hint only; the block may since have been recycled.
    pub fn cached_block_id(&self, hash: u64) -> Option<usize> {
        self.hash_to_block_id.get(&hash).copied()
    }

    /// Get the number of entries in the hash index.
    pub fn num_cached_hashes(&self) -> usize {
        self.hash_to_block_id.len()
    }

    /// Look up a block referenced by a sequence's table.
    fn table_block(&self, block_id: usize) -> Result<&Block> {
        self.blocks.get(block_id).ok_or_else(|| {
            Error::InvariantViolation(format!("block {block_id} is outside the pool"))
        })
    }

    /// Reject sequences laid out with a different block size than the pool.
    fn check_block_size(&self, seq: &Sequence) -> Result<()> {
        if seq.block_size() != self.block_size {
            return Err(Error::InvariantViolation(format!(
                "sequence {} uses block_size {} but the pool uses {}",
                seq.seq_id(),
                seq.block_size(),
                self.block_size
            )));
        }
        Ok(())
    }

    // ========== Pool transitions ==========

    /// Move a free block to the used set with exactly one owner.
    fn activate_block(&mut self, block_id: usize) -> Result<()> {
        let block = &mut self.blocks[block_id];
        if !block.is_free() {
            return Err(Error::InvariantViolation(format!(
                "activating block {block_id} with ref_count {}",
                block.ref_count()
            )));
        }
        let pos = self
            .free_block_ids
            .iter()
            .position(|&id| id == block_id)
            .ok_or_else(|| {
                Error::InvariantViolation(format!("block {block_id} is not in the free list"))
            })?;

        block.reset();
        self.free_block_ids.remove(pos);
        self.used_block_ids.insert(block_id);
        Ok(())
    }

    /// Return an unreferenced block to the back of the free list.
    ///
    /// The block keeps its hash and tokens so a later hash hit can revive it
    /// until it is handed out again.
    fn release_block(&mut self, block_id: usize) -> Result<()> {
        if !self.blocks[block_id].is_free() {
            return Err(Error::InvariantViolation(format!(
                "releasing block {block_id} with ref_count {}",
                self.blocks[block_id].ref_count()
            )));
        }
        if !self.used_block_ids.remove(&block_id) {
            return Err(Error::InvariantViolation(format!(
                "releasing block {block_id} that is not in use"
            )));
        }
        self.free_block_ids.push_back(block_id);
        Ok(())
    }

    /// Activate the block at the front of the free list.
    fn activate_next_free(&mut self) -> Result<usize> {
        let block_id = *self.free_block_ids.front().ok_or(Error::CapacityViolation {
            needed: 1,
            free: 0,
        })?;
        self.activate_block(block_id)?;
        Ok(block_id)
    }

    // ========== Prefill ==========

    /// Check if the pool can hold every block of `seq` without any reuse.
    pub fn can_allocate(&self, seq: &Sequence) -> bool {
        self.free_block_ids.len() >= seq.num_blocks()
    }

    /// Fill in the block table for a sequence's tokens.
    ///
    /// Walks the sequence block by block. A full block whose chain hash is
    /// indexed and whose stored tokens match exactly is shared; everything
    /// from the first miss onwards gets fresh blocks, so sharing is always a
    /// contiguous prefix. Each shared block adds `block_size` to the
    /// sequence's cached token count.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CapacityViolation`] (before touching the pool) if
    /// [`can_allocate`](Self::can_allocate) would have returned `false`, and
    /// [`Error::InvariantViolation`] if the sequence already has blocks or was
    /// built for a different block size.
    pub fn allocate(&mut self, seq: &mut Sequence) -> Result<()> {
        self.check_block_size(seq)?;
        if !seq.block_table().is_empty() {
            return Err(Error::InvariantViolation(format!(
                "sequence {} is already allocated",
                seq.seq_id()
            )));
        }
        let needed = seq.num_blocks();
        if self.free_block_ids.len() < needed {
            warn!(
                seq_id = seq.seq_id(),
                needed,
                free = self.free_block_ids.len(),
                "allocate called without capacity"
            );
            return Err(Error::CapacityViolation {
                needed,
                free: self.free_block_ids.len(),
            });
        }

        let mut block_ids = Vec::with_capacity(needed);
        let mut prefix_hash = None;
        let mut cache_miss = false;
        let mut num_cached_tokens = 0;

        for i in 0..needed {
            let token_ids = seq.block(i)?;
            let hash =
                (token_ids.len() == self.block_size).then(|| compute_hash(token_ids, prefix_hash));

            // An entry is stale once its block was refilled or rehashed.
            let hit = hash
                .and_then(|h| self.hash_to_block_id.get(&h).copied())
                .filter(|&id| {
                    let block = &self.blocks[id];
                    block.hash() == hash && block.token_ids() == token_ids
                });
            if hit.is_none() {
                cache_miss = true;
            }

            let block_id = match hit {
                Some(block_id) if !cache_miss => {
                    num_cached_tokens += self.block_size;
                    if self.used_block_ids.contains(&block_id) {
                        self.blocks[block_id].increment_ref();
                    } else {
                        self.activate_block(block_id)?;
                    }
                    trace!(seq_id = seq.seq_id(), block = i, block_id, "prefix cache hit");
                    block_id
                }
                _ => {
                    let block_id = self.activate_next_free()?;
                    trace!(seq_id = seq.seq_id(), block = i, block_id, "prefix cache miss");
                    block_id
                }
            };

            if let Some(h) = hash {
                self.blocks[block_id].update(h, token_ids);
                self.hash_to_block_id.insert(h, block_id);
            }
            block_ids.push(block_id);
            prefix_hash = hash;
        }

        debug!(
            seq_id = seq.seq_id(),
            num_blocks = needed,
            num_cached_tokens,
            free = self.free_block_ids.len(),
            "allocated sequence"
        );

        let table = seq.block_table_mut();
        for block_id in block_ids {
            table.append_block(block_id);
        }
        seq.set_num_cached_tokens(seq.num_cached_tokens() + num_cached_tokens);
        Ok(())
    }

    /// Release every block of a sequence and clear its block table.
    ///
    /// Blocks still shared with other sequences only lose one reference.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvariantViolation`] if the table references a block
    /// that is already free or does not exist, or if the sequence was built
    /// for a different block size.
    pub fn deallocate(&mut self, seq: &mut Sequence) -> Result<()> {
        self.check_block_size(seq)?;
        for &block_id in seq.block_table().get_physical_block_ids().iter().rev() {
            let block = self.blocks.get_mut(block_id).ok_or_else(|| {
                Error::InvariantViolation(format!("block {block_id} is outside the pool"))
            })?;
            match block.decrement_ref() {
                Some(0) => self.release_block(block_id)?,
                Some(_) => {}
                None => {
                    return Err(Error::InvariantViolation(format!(
                        "sequence {} references free block {block_id}",
                        seq.seq_id()
                    )));
                }
            }
        }

        debug!(
            seq_id = seq.seq_id(),
            num_blocks = seq.block_table().num_blocks(),
            free = self.free_block_ids.len(),
            "deallocated sequence"
        );

        seq.set_num_cached_tokens(0);
        seq.block_table_mut().clear();
        Ok(())
    }

    // ========== Decode ==========

    /// Check if the next [`may_append`](Self::may_append) can succeed.
    ///
    /// Only a token that opens a new block needs a free block.
    pub fn can_append(&self, seq: &Sequence) -> bool {
        !(seq.len() % self.block_size == 1 && self.free_block_ids.is_empty())
    }

    /// Grow or finalize the trailing block after `append_token`.
    ///
    /// - The new token opened a block: a fresh block is appended to the table.
    /// - The new token filled a block: its chain hash is computed and indexed,
    ///   replacing any older block indexed under the same hash.
    /// - Otherwise nothing changes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CapacityViolation`] if a block is needed and none is
    /// free, and [`Error::InvariantViolation`] if the block table or the
    /// trailing block's hash state does not match the sequence length.
    pub fn may_append(&mut self, seq: &mut Sequence) -> Result<()> {
        self.check_block_size(seq)?;
        let table_len = seq.block_table().num_blocks();
        let last_block_id = seq.block_table().last().ok_or_else(|| {
            Error::InvariantViolation(format!("sequence {} has no blocks", seq.seq_id()))
        })?;
        let last_hash = self.table_block(last_block_id)?.hash();

        match seq.len() % self.block_size {
            1 => {
                if last_hash.is_none() {
                    return Err(Error::InvariantViolation(format!(
                        "block {last_block_id} was not finalized before opening a new block"
                    )));
                }
                if table_len + 1 != seq.num_blocks() {
                    return Err(self.table_mismatch(seq, table_len + 1));
                }
                if self.free_block_ids.is_empty() {
                    warn!(seq_id = seq.seq_id(), "may_append called without capacity");
                }
                let block_id = self.activate_next_free()?;
                seq.block_table_mut().append_block(block_id);
                trace!(seq_id = seq.seq_id(), block_id, "opened block");
            }
            0 => {
                if last_hash.is_some() {
                    return Err(Error::InvariantViolation(format!(
                        "block {last_block_id} is already finalized"
                    )));
                }
                if table_len != seq.num_blocks() {
                    return Err(self.table_mismatch(seq, table_len));
                }
                let prefix_hash = match table_len {
                    1 => None,
                    n => {
                        let prev = seq.block_table().get_block_id(n - 2)?;
                        Some(self.table_block(prev)?.hash().ok_or_else(|| {
                            Error::InvariantViolation(format!(
                                "block {prev} precedes a full block but has no hash"
                            ))
                        })?)
                    }
                };
                let token_ids = seq.block(table_len - 1)?;
                let hash = compute_hash(token_ids, prefix_hash);
                self.blocks[last_block_id].update(hash, token_ids);
                self.hash_to_block_id.insert(hash, last_block_id);
                trace!(seq_id = seq.seq_id(), block_id = last_block_id, hash, "finalized block");
            }
            _ => {
                if last_hash.is_some() {
                    return Err(Error::InvariantViolation(format!(
                        "partially filled block {last_block_id} has a hash"
                    )));
                }
            }
        }
        Ok(())
    }

    fn table_mismatch(&self, seq: &Sequence, table_len: usize) -> Error {
        Error::InvariantViolation(format!(
            "sequence {} has {} tokens but {table_len} blocks",
            seq.seq_id(),
            seq.len()
        ))
    }

    // ========== Maintenance ==========

    /// Verify pool bookkeeping.
    ///
    /// Checks that the free and used sets partition the pool, that reference
    /// counts agree with set membership, and that only full blocks carry a
    /// hash.
    pub fn check_invariants(&self) -> Result<()> {
        let num_blocks = self.blocks.len();
        if self.free_block_ids.len() + self.used_block_ids.len() != num_blocks {
            return Err(Error::InvariantViolation(format!(
                "{} free + {} used != {num_blocks} blocks",
                self.free_block_ids.len(),
                self.used_block_ids.len()
            )));
        }

        let mut seen = vec![false; num_blocks];
        for &id in &self.free_block_ids {
            if id >= num_blocks || seen[id] {
                return Err(Error::InvariantViolation(format!(
                    "free list entry {id} is duplicated or out of range"
                )));
            }
            seen[id] = true;
            if !self.blocks[id].is_free() {
                return Err(Error::InvariantViolation(format!(
                    "free block {id} has ref_count {}",
                    self.blocks[id].ref_count()
                )));
            }
        }
        for &id in &self.used_block_ids {
            if id >= num_blocks || seen[id] {
                return Err(Error::InvariantViolation(format!(
                    "used block {id} is also free or out of range"
                )));
            }
            seen[id] = true;
            if self.blocks[id].is_free() {
                return Err(Error::InvariantViolation(format!(
                    "used block {id} has ref_count 0"
                )));
            }
        }

        for block in &self.blocks {
            if block.hash().is_some() && block.token_ids().len() != self.block_size {
                return Err(Error::InvariantViolation(format!(
                    "block {} is hashed with {} tokens",
                    block.block_id(),
                    block.token_ids().len()
                )));
            }
        }
        Ok(())
    }

    /// Reset the block manager to initial state.
    ///
    /// All blocks are freed and the hash index is dropped. Block tables held
    /// by live sequences become dangling; only call this when none remain.
    pub fn reset(&mut self) {
        let num_blocks = self.blocks.len();
        self.blocks = (0..num_blocks).map(Block::new).collect();
        self.free_block_ids = (0..num_blocks).collect();
        self.used_block_ids.clear();
        self.hash_to_block_id.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_manager_creation() {
        let manager = BlockManager::new(100, 16);
        assert_eq!(manager.num_blocks(), 100);
        assert_eq!(manager.block_size(), 16);
        assert_eq!(manager.num_free_blocks(), 100);
        assert_eq!(manager.num_used_blocks(), 0);
        assert!(manager.check_invariants().is_ok());
    }

    #[test]
    fn test_try_new_rejects_unusable_sizes() {
        assert!(matches!(BlockManager::try_new(0, 2), Err(Error::Config(_))));
        assert!(matches!(BlockManager::try_new(4, 1), Err(Error::Config(_))));
        assert!(matches!(BlockManager::try_new(4, 0), Err(Error::Config(_))));
        assert_eq!(BlockManager::try_new(4, 2).unwrap().num_free_blocks(), 4);
    }

    #[test]
    #[should_panic(expected = "block_size must be at least 2")]
    fn test_new_panics_on_single_token_blocks() {
        BlockManager::new(4, 1);
    }

    #[test]
    fn test_from_config_validates() {
        assert!(BlockManager::from_config(&CacheConfig::default()).is_ok());
        let bad = CacheConfig {
            block_size: 100,
            num_blocks: 4,
        };
        assert!(matches!(
            BlockManager::from_config(&bad),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_partial_block_is_not_hashed() {
        let mut manager = BlockManager::new(4, 4);
        let mut seq = Sequence::new(vec![1, 2, 3, 4, 5, 6], 4);
        manager.allocate(&mut seq).unwrap();

        let ids = seq.block_table().get_physical_block_ids();
        assert!(manager.get_block(ids[0]).unwrap().hash().is_some());
        assert!(manager.get_block(ids[1]).unwrap().hash().is_none());
        assert_eq!(manager.num_cached_hashes(), 1);
    }

    #[test]
    fn test_allocate_twice_is_rejected() {
        let mut manager = BlockManager::new(4, 2);
        let mut seq = Sequence::new(vec![1, 2], 2);
        manager.allocate(&mut seq).unwrap();
        assert!(matches!(
            manager.allocate(&mut seq),
            Err(Error::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_allocate_without_capacity_leaves_pool_untouched() {
        let mut manager = BlockManager::new(2, 2);
        let mut seq = Sequence::new(vec![1, 2, 3, 4, 5], 2);

        assert!(!manager.can_allocate(&seq));
        assert!(matches!(
            manager.allocate(&mut seq),
            Err(Error::CapacityViolation { needed: 3, free: 2 })
        ));
        assert_eq!(manager.num_free_blocks(), 2);
        assert!(seq.block_table().is_empty());
    }

    #[test]
    fn test_freed_block_is_revived_by_hash_hit() {
        let mut manager = BlockManager::new(4, 2);
        let mut a = Sequence::new(vec![1, 2, 3], 2);
        manager.allocate(&mut a).unwrap();
        let first = a.block_table().get_block_id(0).unwrap();
        manager.deallocate(&mut a).unwrap();
        assert!(!manager.is_block_used(first));

        let mut b = Sequence::new(vec![1, 2, 7], 2);
        manager.allocate(&mut b).unwrap();
        assert_eq!(b.block_table().get_block_id(0).unwrap(), first);
        assert_eq!(b.num_cached_tokens(), 2);
        assert_eq!(manager.get_block(first).unwrap().ref_count(), 1);
        assert!(manager.check_invariants().is_ok());
    }

    #[test]
    fn test_collision_forces_miss_for_rest_of_sequence() {
        let mut manager = BlockManager::new(8, 2);
        let mut a = Sequence::new(vec![1, 2, 3, 4], 2);
        manager.allocate(&mut a).unwrap();
        let a_ids = a.block_table().get_physical_block_ids().to_vec();

        let mut other = Sequence::new(vec![7, 7], 2);
        manager.allocate(&mut other).unwrap();
        let other_id = other.block_table().get_block_id(0).unwrap();

        // Point the first block's hash at a block with different tokens.
        let h0 = compute_hash(&[1, 2], None);
        manager.hash_to_block_id.insert(h0, other_id);

        let mut b = Sequence::new(vec![1, 2, 3, 4], 2);
        manager.allocate(&mut b).unwrap();

        // The second block would hit on its own, but sharing must be contiguous.
        let b_ids = b.block_table().get_physical_block_ids();
        assert!(!b_ids.contains(&a_ids[1]));
        assert!(!b_ids.contains(&other_id));
        assert_eq!(b.num_cached_tokens(), 0);
        assert_eq!(manager.get_block(a_ids[1]).unwrap().ref_count(), 1);
        assert_eq!(manager.cached_block_id(h0), Some(b_ids[0]));
        assert!(manager.check_invariants().is_ok());
    }

    #[test]
    fn test_rehashed_block_is_not_reused_at_another_position() {
        let mut manager = BlockManager::new(4, 2);
        let mut p = Sequence::new(vec![1, 1, 1, 1], 2);
        manager.allocate(&mut p).unwrap();
        assert_eq!(p.block_table().get_physical_block_ids(), &[0, 1]);

        // Same tokens as block 1, but block 0 carries the first-position hash.
        let h1 = compute_hash(&[1, 1], Some(compute_hash(&[1, 1], None)));
        manager.hash_to_block_id.insert(h1, 0);

        let mut t = Sequence::new(vec![1, 1, 1, 1], 2);
        manager.allocate(&mut t).unwrap();

        assert_eq!(t.block_table().get_physical_block_ids(), &[0, 2]);
        assert_eq!(t.num_cached_tokens(), 2);
        assert_eq!(manager.get_block(0).unwrap().ref_count(), 2);
        assert!(manager.check_invariants().is_ok());
    }

    #[test]
    fn test_may_append_rejects_unfinalized_boundary() {
        let mut manager = BlockManager::new(4, 2);
        let mut seq = Sequence::new(vec![1, 2], 2);
        manager.allocate(&mut seq).unwrap();

        // Clear the hash behind the manager's back.
        let last = seq.block_table().last().unwrap();
        manager.blocks[last].reset();

        seq.append_token(3);
        assert!(matches!(
            manager.may_append(&mut seq),
            Err(Error::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_reset() {
        let mut manager = BlockManager::new(10, 4);
        let mut seq = Sequence::new((0..12).collect(), 4);
        manager.allocate(&mut seq).unwrap();
        assert_eq!(manager.num_used_blocks(), 3);

        manager.reset();

        assert_eq!(manager.num_free_blocks(), 10);
        assert_eq!(manager.num_used_blocks(), 0);
        assert_eq!(manager.num_cached_hashes(), 0);
        assert!(manager.check_invariants().is_ok());
    }
}
