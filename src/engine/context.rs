//! Per-batch execution context.
//!
//! Before every forward pass the engine turns the batch's sequences into flat
//! index tensors the attention layer uses to find KV storage. The result is a
//! plain value handed to the forward call and dropped afterwards; nothing is
//! kept between batches.
//!
//! ## Layout
//!
//! ```text
//! Batch of 2 prefill sequences, lengths 5 and 4, nothing cached:
//!
//!   input_ids     [a0 a1 a2 a3 a4 | b0 b1 b2 b3]
//!   cu_seqlens_q  [0, 5, 9]
//!   cu_seqlens_k  [0, 5, 9]
//!   slot_mapping  one global slot per input token
//! ```

use candle_core::{Device, Tensor};

use crate::core::sequence::Sequence;
use crate::error::{Error, Result};

/// Index tensors describing one batch to the attention layer.
///
/// `block_tables` rows are padded with `-1` to the longest table in the batch.
#[derive(Debug, Clone, Default)]
pub struct Context {
    /// Whether this batch processes prompts (prefill) or single tokens (decode).
    pub is_prefill: bool,
    /// Prefix sums of query lengths, `[batch + 1]` (prefill only).
    pub cu_seqlens_q: Option<Tensor>,
    /// Prefix sums of key lengths, `[batch + 1]` (prefill only).
    pub cu_seqlens_k: Option<Tensor>,
    /// Longest query length in the batch.
    pub max_seqlen_q: usize,
    /// Longest key length in the batch.
    pub max_seqlen_k: usize,
    /// Global cache slot for every input token, `[num_input_tokens]`.
    pub slot_mapping: Option<Tensor>,
    /// Context length of each sequence, `[batch]` (decode only).
    pub context_lens: Option<Tensor>,
    /// Physical block ids per sequence, `[batch, max_blocks]`.
    pub block_tables: Option<Tensor>,
}

/// Model inputs for one forward pass together with their [`Context`].
#[derive(Debug, Clone)]
pub struct PreparedBatch {
    /// Token ids to run, `[num_input_tokens]`.
    pub input_ids: Tensor,
    /// Absolute position of each input token, `[num_input_tokens]`.
    pub positions: Tensor,
    /// Attention indexing for this batch.
    pub context: Context,
}

impl PreparedBatch {
    /// Build inputs for prefilling allocated sequences.
    ///
    /// Tokens already covered by shared prefix blocks are skipped; their KV
    /// is read back through `block_tables`, which is only filled in when some
    /// sequence in the batch has a cached prefix.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyBatch`] for an empty batch,
    /// [`Error::InvariantViolation`] for a sequence without blocks, and
    /// [`Error::TokensUnavailable`] for a sequence without token history.
    pub fn prefill(seqs: &[&Sequence], device: &Device) -> Result<Self> {
        if seqs.is_empty() {
            return Err(Error::EmptyBatch);
        }

        let mut input_ids = Vec::new();
        let mut positions = Vec::new();
        let mut cu_seqlens_q = vec![0u32];
        let mut cu_seqlens_k = vec![0u32];
        let mut max_seqlen_q = 0;
        let mut max_seqlen_k = 0;
        let mut slot_mapping = Vec::new();

        for seq in seqs {
            ensure_allocated(seq)?;
            let seqlen = seq.len();
            let num_cached = seq.num_cached_blocks() * seq.block_size();

            input_ids.extend_from_slice(&seq.token_ids()?[num_cached..]);
            positions.extend((num_cached..seqlen).map(|p| p as i64));

            let seqlen_q = seqlen - num_cached;
            cu_seqlens_q.push(cu_seqlens_q[cu_seqlens_q.len() - 1] + seqlen_q as u32);
            cu_seqlens_k.push(cu_seqlens_k[cu_seqlens_k.len() - 1] + seqlen as u32);
            max_seqlen_q = max_seqlen_q.max(seqlen_q);
            max_seqlen_k = max_seqlen_k.max(seqlen);

            let slots = seq.block_table().get_slot_mapping(num_cached..seqlen)?;
            slot_mapping.extend(slots.into_iter().map(|s| s as i64));
        }

        let has_cached_prefix = cu_seqlens_k.last() > cu_seqlens_q.last();
        let block_tables = if has_cached_prefix {
            Some(block_tables_tensor(seqs, device)?)
        } else {
            None
        };

        let num_cu = cu_seqlens_q.len();
        let context = Context {
            is_prefill: true,
            cu_seqlens_q: Some(Tensor::from_vec(cu_seqlens_q, num_cu, device)?),
            cu_seqlens_k: Some(Tensor::from_vec(cu_seqlens_k, num_cu, device)?),
            max_seqlen_q,
            max_seqlen_k,
            slot_mapping: Some(tensor_1d(slot_mapping, device)?),
            context_lens: None,
            block_tables,
        };

        Ok(Self {
            input_ids: tensor_1d(input_ids, device)?,
            positions: tensor_1d(positions, device)?,
            context,
        })
    }

    /// Build inputs for one decode step.
    ///
    /// Each sequence contributes its last token; call after
    /// [`BlockManager::may_append`](crate::core::block_manager::BlockManager::may_append)
    /// so the token's slot exists.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyBatch`] for an empty batch and
    /// [`Error::InvariantViolation`] for a sequence whose block table does
    /// not cover its last token.
    pub fn decode(seqs: &[&Sequence], device: &Device) -> Result<Self> {
        if seqs.is_empty() {
            return Err(Error::EmptyBatch);
        }

        let mut input_ids = Vec::with_capacity(seqs.len());
        let mut positions = Vec::with_capacity(seqs.len());
        let mut context_lens = Vec::with_capacity(seqs.len());
        let mut slot_mapping = Vec::with_capacity(seqs.len());

        for seq in seqs {
            ensure_allocated(seq)?;
            let last_token = seq.last_token().ok_or(Error::TokensUnavailable)?;
            let position = seq.len() - 1;

            input_ids.push(last_token);
            positions.push(position as i64);
            context_lens.push(seq.len() as u32);
            slot_mapping.push(seq.block_table().slot_for(position)? as i64);
        }

        let context = Context {
            is_prefill: false,
            slot_mapping: Some(tensor_1d(slot_mapping, device)?),
            context_lens: Some(tensor_1d(context_lens, device)?),
            block_tables: Some(block_tables_tensor(seqs, device)?),
            ..Context::default()
        };

        Ok(Self {
            input_ids: tensor_1d(input_ids, device)?,
            positions: tensor_1d(positions, device)?,
            context,
        })
    }
}

fn ensure_allocated(seq: &Sequence) -> Result<()> {
    if seq.block_table().num_blocks() < seq.num_blocks() {
        return Err(Error::InvariantViolation(format!(
            "sequence {} has {} tokens but only {} blocks",
            seq.seq_id(),
            seq.len(),
            seq.block_table().num_blocks()
        )));
    }
    Ok(())
}

fn tensor_1d<T: candle_core::WithDType>(data: Vec<T>, device: &Device) -> Result<Tensor> {
    let len = data.len();
    Ok(Tensor::from_vec(data, len, device)?)
}

/// Pad every block table to the longest one with `-1`.
fn block_tables_tensor(seqs: &[&Sequence], device: &Device) -> Result<Tensor> {
    let max_blocks = seqs
        .iter()
        .map(|seq| seq.block_table().num_blocks())
        .max()
        .unwrap_or(0);

    let mut flat = Vec::with_capacity(seqs.len() * max_blocks);
    for seq in seqs {
        let ids = seq.block_table().get_physical_block_ids();
        flat.extend(ids.iter().map(|&id| id as i64));
        flat.extend(std::iter::repeat(-1i64).take(max_blocks - ids.len()));
    }

    Ok(Tensor::from_vec(flat, (seqs.len(), max_blocks), device)?)
}
