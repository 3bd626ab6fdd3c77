//! Integration tests for Block, BlockTable and chain hashing.

use paged_kv::core::block::{compute_hash, compute_num_blocks, Block, BlockTable};

#[test]
fn test_block_lifecycle() {
    let mut block = Block::new(3);
    assert!(block.is_free());

    block.reset();
    assert_eq!(block.ref_count(), 1);
    assert!(!block.is_free());

    let hash = compute_hash(&[1, 2, 3, 4], None);
    block.update(hash, &[1, 2, 3, 4]);
    assert_eq!(block.hash(), Some(hash));
    assert_eq!(block.token_ids(), &[1, 2, 3, 4]);

    block.increment_ref();
    assert_eq!(block.decrement_ref(), Some(1));
    assert_eq!(block.decrement_ref(), Some(0));
    assert!(block.is_free());

    // Content survives release until the block is handed out again.
    assert_eq!(block.hash(), Some(hash));
}

#[test]
fn test_chain_hash_depends_on_every_previous_block() {
    let h_a0 = compute_hash(&[1, 2], None);
    let h_b0 = compute_hash(&[1, 3], None);

    let h_a1 = compute_hash(&[5, 6], Some(h_a0));
    let h_b1 = compute_hash(&[5, 6], Some(h_b0));
    assert_ne!(h_a1, h_b1);

    let h_c1 = compute_hash(&[5, 6], Some(compute_hash(&[1, 2], None)));
    assert_eq!(h_a1, h_c1);
}

#[test]
fn test_hash_is_order_sensitive() {
    assert_ne!(compute_hash(&[1, 2], None), compute_hash(&[2, 1], None));
}

#[test]
fn test_block_table_slots() {
    let mut table = BlockTable::new(4);
    table.append_block(7);
    table.append_block(2);

    assert_eq!(table.slot_for(0).unwrap(), 28);
    assert_eq!(table.slot_for(5).unwrap(), 9);
    assert!(table.slot_for(8).is_err());
    assert_eq!(table.get_slot_mapping(3..6).unwrap(), vec![31, 8, 9]);
    assert!(table.get_slot_mapping(4..4).unwrap().is_empty());

    table.clear();
    assert!(table.is_empty());
    assert_eq!(table.last(), None);
}

#[test]
fn test_compute_num_blocks() {
    assert_eq!(compute_num_blocks(0, 256), 0);
    assert_eq!(compute_num_blocks(256, 256), 1);
    assert_eq!(compute_num_blocks(257, 256), 2);
}
