//! Block abstractions for PagedAttention.
//!
//! The KV cache is divided into fixed-size blocks, similar to how operating
//! systems manage virtual memory with pages. A [`Block`] is one physical page;
//! a [`BlockTable`] is one sequence's page table.

use std::ops::Range;

use xxhash_rust::xxh64::Xxh64;

use crate::error::{Error, Result};

/// Compute the chain hash of a full block of tokens.
///
/// The hash covers the previous block's hash (if any) followed by this block's
/// token ids, so two sequences agree on the hash of block `i` only when blocks
/// `0..=i` hold identical tokens. Hashing is xxHash64 over little-endian bytes
/// and is stable across runs and processes.
///
/// # Arguments
///
/// * `token_ids` - Token IDs of this block
/// * `prefix_hash` - Hash of the previous block (`None` for the first block)
///
/// # Example
///
/// ```
/// use paged_kv::core::block::compute_hash;
///
/// let tokens = [1u32, 2, 3, 4];
/// let first = compute_hash(&tokens, None);
/// let chained = compute_hash(&tokens, Some(first));
///
/// // Same tokens but different prefix chain -> different hash
/// assert_ne!(first, chained);
/// assert_eq!(first, compute_hash(&tokens, None));
/// ```
pub fn compute_hash(token_ids: &[u32], prefix_hash: Option<u64>) -> u64 {
    let mut hasher = Xxh64::new(0);

    if let Some(prefix) = prefix_hash {
        hasher.update(&prefix.to_le_bytes());
    }

    for &token in token_ids {
        hasher.update(&token.to_le_bytes());
    }

    hasher.digest()
}

/// A fixed-capacity slot of the KV cache pool.
///
/// The block only tracks bookkeeping: who references it and which tokens it
/// holds. The KV tensors themselves live in the attention layer's storage at
/// slots `block_id * block_size ..`.
///
/// `hash` is `Some` only once the block is full and finalized; a block that is
/// still being filled, or was just handed out, has no hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    block_id: usize,
    ref_count: usize,
    hash: Option<u64>,
    token_ids: Vec<u32>,
}

impl Block {
    /// Create a free block with the given ID.
    pub fn new(block_id: usize) -> Self {
        Self {
            block_id,
            ref_count: 0,
            hash: None,
            token_ids: Vec::new(),
        }
    }

    /// Get the block ID.
    pub fn block_id(&self) -> usize {
        self.block_id
    }

    /// Get the current reference count.
    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    /// Get the finalized chain hash, if any.
    pub fn hash(&self) -> Option<u64> {
        self.hash
    }

    /// Get the token IDs recorded for this block.
    pub fn token_ids(&self) -> &[u32] {
        &self.token_ids
    }

    /// Check if no sequence references this block.
    pub fn is_free(&self) -> bool {
        self.ref_count == 0
    }

    /// Record the finalized hash and the tokens it was computed from.
    ///
    /// Callers only pass full blocks.
    pub fn update(&mut self, hash: u64, token_ids: &[u32]) {
        self.hash = Some(hash);
        self.token_ids = token_ids.to_vec();
    }

    /// Hand the block to exactly one owner with no content.
    pub fn reset(&mut self) {
        self.ref_count = 1;
        self.hash = None;
        self.token_ids.clear();
    }

    /// Increment reference count (another sequence shares this block).
    pub fn increment_ref(&mut self) {
        self.ref_count += 1;
    }

    /// Decrement reference count.
    ///
    /// # Returns
    ///
    /// The new reference count, or `None` if the block was already free.
    pub fn decrement_ref(&mut self) -> Option<usize> {
        self.ref_count = self.ref_count.checked_sub(1)?;
        Some(self.ref_count)
    }
}

/// Maps a sequence's logical blocks to physical block IDs.
///
/// Think of this like a page table in virtual memory:
/// - Logical block index: Position in the sequence (0, 1, 2, ...)
/// - Physical block ID: Actual block in the global cache pool
///
/// Token at position `p` is stored in:
/// - Logical block: `p / block_size`
/// - Slot within block: `p % block_size`
/// - Physical block: `block_ids[p / block_size]`
///
/// # Example
///
/// ```
/// use paged_kv::core::block::BlockTable;
///
/// let mut table = BlockTable::new(16);
/// table.append_block(5);   // Tokens 0-15
/// table.append_block(12);  // Tokens 16-31
/// table.append_block(3);   // Tokens 32-47
///
/// // Token 20 -> logical block 1 -> physical block 12
/// assert_eq!(table.get_block_id(1).unwrap(), 12);
/// assert_eq!(table.slot_for(20).unwrap(), 12 * 16 + 4);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockTable {
    /// Physical block IDs in logical order.
    block_ids: Vec<usize>,
    /// Number of tokens per block.
    block_size: usize,
}

impl BlockTable {
    /// Create a new empty block table.
    pub fn new(block_size: usize) -> Self {
        Self {
            block_ids: Vec::new(),
            block_size,
        }
    }

    /// Create a block table from existing physical block IDs.
    pub fn from_block_ids(block_size: usize, block_ids: Vec<usize>) -> Self {
        Self {
            block_ids,
            block_size,
        }
    }

    /// Get the block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Get physical block ID for a logical block index.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BlockIndexOutOfBounds`] if the logical block index
    /// is not allocated.
    pub fn get_block_id(&self, logical_block_idx: usize) -> Result<usize> {
        self.block_ids
            .get(logical_block_idx)
            .copied()
            .ok_or(Error::BlockIndexOutOfBounds {
                logical_idx: logical_block_idx,
                num_blocks: self.block_ids.len(),
            })
    }

    /// Physical ID of the last block, if any.
    pub fn last(&self) -> Option<usize> {
        self.block_ids.last().copied()
    }

    /// Add a new physical block to the table.
    pub fn append_block(&mut self, block_id: usize) {
        self.block_ids.push(block_id);
    }

    /// Number of blocks allocated to this sequence.
    pub fn num_blocks(&self) -> usize {
        self.block_ids.len()
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.block_ids.is_empty()
    }

    /// Check if the table references a physical block.
    pub fn contains(&self, block_id: usize) -> bool {
        self.block_ids.contains(&block_id)
    }

    /// Get all physical block IDs for this sequence.
    pub fn get_physical_block_ids(&self) -> &[usize] {
        &self.block_ids
    }

    /// Global slot index of the token at `position`.
    ///
    /// Global slot = `block_id * block_size + slot_within_block`
    pub fn slot_for(&self, position: usize) -> Result<usize> {
        let physical_block = self.get_block_id(position / self.block_size)?;
        Ok(physical_block * self.block_size + position % self.block_size)
    }

    /// Global slot indices for a contiguous range of token positions.
    ///
    /// Used to tell the attention layer where to write newly computed KV.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BlockIndexOutOfBounds`] if any position falls past the
    /// last allocated block.
    pub fn get_slot_mapping(&self, positions: Range<usize>) -> Result<Vec<usize>> {
        positions.map(|pos| self.slot_for(pos)).collect()
    }

    /// Clear all blocks from the table.
    pub fn clear(&mut self) {
        self.block_ids.clear();
    }
}

/// Compute number of blocks needed for a sequence of given length.
///
/// # Example
///
/// ```
/// use paged_kv::core::block::compute_num_blocks;
///
/// assert_eq!(compute_num_blocks(35, 16), 3);  // 35 tokens -> 3 blocks
/// assert_eq!(compute_num_blocks(32, 16), 2);  // 32 tokens -> 2 blocks exactly
/// assert_eq!(compute_num_blocks(0, 16), 0);   // 0 tokens -> 0 blocks
/// ```
pub fn compute_num_blocks(seq_len: usize, block_size: usize) -> usize {
    seq_len.div_ceil(block_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_starts_free() {
        let block = Block::new(42);
        assert_eq!(block.block_id(), 42);
        assert_eq!(block.ref_count(), 0);
        assert!(block.is_free());
        assert!(block.hash().is_none());
        assert!(block.token_ids().is_empty());
    }

    #[test]
    fn test_block_reset_clears_content() {
        let mut block = Block::new(0);
        block.reset();
        block.update(7, &[1, 2]);
        block.increment_ref();
        assert_eq!(block.ref_count(), 2);

        block.reset();
        assert_eq!(block.ref_count(), 1);
        assert!(block.hash().is_none());
        assert!(block.token_ids().is_empty());
    }

    #[test]
    fn test_block_ref_counting() {
        let mut block = Block::new(0);
        block.reset();
        block.increment_ref();

        assert_eq!(block.decrement_ref(), Some(1));
        assert_eq!(block.decrement_ref(), Some(0));

        // Already free
        assert_eq!(block.decrement_ref(), None);
        assert_eq!(block.ref_count(), 0);
    }

    #[test]
    fn test_compute_hash_chain() {
        let tokens = [1u32, 2, 3, 4, 5];

        let hash1 = compute_hash(&tokens, None);

        // Same tokens with different parent should produce different hash
        let hash2 = compute_hash(&tokens, Some(999));
        assert_ne!(hash1, hash2);

        // Deterministic
        assert_eq!(hash2, compute_hash(&tokens, Some(999)));

        // Different tokens should produce different hash
        assert_ne!(hash1, compute_hash(&[1u32, 2, 3, 4, 6], None));
    }

    #[test]
    fn test_block_table_slot_mapping() {
        let table = BlockTable::from_block_ids(16, vec![5, 12]);

        let slots = table.get_slot_mapping(0..20).unwrap();
        assert_eq!(slots.len(), 20);

        // First 16 tokens in block 5 (slots 80-95)
        assert_eq!(slots[0], 5 * 16);
        assert_eq!(slots[15], 5 * 16 + 15);

        // Next 4 tokens in block 12 (slots 192-195)
        assert_eq!(slots[16], 12 * 16);
        assert_eq!(slots[19], 12 * 16 + 3);

        assert_eq!(table.get_slot_mapping(17..19).unwrap(), vec![193, 194]);
        assert!(table.get_slot_mapping(30..33).is_err());
    }

    #[test]
    fn test_block_table_get_block_id() {
        let table = BlockTable::from_block_ids(16, vec![5, 12, 3]);

        assert_eq!(table.get_block_id(2).unwrap(), 3);
        assert_eq!(table.last(), Some(3));
        assert!(table.contains(12));
        assert!(matches!(
            table.get_block_id(3),
            Err(Error::BlockIndexOutOfBounds {
                logical_idx: 3,
                num_blocks: 3
            })
        ));
    }

    #[test]
    fn test_compute_num_blocks() {
        assert_eq!(compute_num_blocks(0, 16), 0);
        assert_eq!(compute_num_blocks(1, 16), 1);
        assert_eq!(compute_num_blocks(16, 16), 1);
        assert_eq!(compute_num_blocks(17, 16), 2);
        assert_eq!(compute_num_blocks(100, 16), 7);
    }
}
