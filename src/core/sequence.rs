//! Sequence tracking for generation requests.
//!
//! A sequence represents a single generation request: its token ids (prompt
//! followed by generated tokens), its lifecycle state, and the block table
//! the [`BlockManager`](super::block_manager::BlockManager) fills in for it.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::config::SamplingConfig;
use crate::core::block::{compute_num_blocks, BlockTable};
use crate::error::{Error, Result};

/// Unique identifier for a sequence.
pub type SequenceId = u64;

static NEXT_SEQ_ID: AtomicU64 = AtomicU64::new(0);

fn next_seq_id() -> SequenceId {
    NEXT_SEQ_ID.fetch_add(1, Ordering::Relaxed)
}

/// Status of a sequence.
///
/// Owned by the scheduler; the allocator only reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SequenceStatus {
    /// Waiting in queue to be scheduled.
    Waiting,
    /// Currently running (prefill or decode).
    Running,
    /// Finished generation.
    Finished,
}

impl SequenceStatus {
    /// Check if the sequence is finished.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished)
    }

    /// Get the status name as a static string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "Waiting",
            Self::Running => "Running",
            Self::Finished => "Finished",
        }
    }
}

/// A single generation request.
///
/// # Example
///
/// ```
/// use paged_kv::core::sequence::{Sequence, SequenceStatus};
///
/// let mut seq = Sequence::new(vec![1, 2, 3, 4, 5], 4);
/// assert_eq!(seq.status(), SequenceStatus::Waiting);
/// assert_eq!(seq.num_blocks(), 2);
/// assert_eq!(seq.last_block_num_tokens(), 1);
///
/// seq.append_token(6);
/// assert_eq!(seq.len(), 6);
/// assert_eq!(seq.num_completion_tokens(), 1);
/// assert_eq!(seq.block(1).unwrap(), &[5, 6]);
/// ```
#[derive(Debug, Clone)]
pub struct Sequence {
    seq_id: SequenceId,
    status: SequenceStatus,
    /// Prompt followed by generated tokens. `None` after a restore that only
    /// carried the last token.
    token_ids: Option<Vec<u32>>,
    last_token: Option<u32>,
    num_tokens: usize,
    num_prompt_tokens: usize,
    /// Tokens whose KV already sits in finalized, hash-indexed blocks.
    num_cached_tokens: usize,
    block_table: BlockTable,
    temperature: f32,
    max_tokens: usize,
    ignore_eos: bool,
}

impl Sequence {
    /// Create a new waiting sequence from prompt tokens with default sampling.
    ///
    /// # Panics
    ///
    /// Panics if `block_size` is zero.
    pub fn new(token_ids: Vec<u32>, block_size: usize) -> Self {
        Self::with_sampling(token_ids, block_size, &SamplingConfig::default())
    }

    /// Create a new waiting sequence with explicit sampling parameters.
    ///
    /// # Panics
    ///
    /// Panics if `block_size` is zero.
    pub fn with_sampling(
        token_ids: Vec<u32>,
        block_size: usize,
        sampling: &SamplingConfig,
    ) -> Self {
        assert!(block_size > 0, "block_size must be positive");
        let num_tokens = token_ids.len();
        Self {
            seq_id: next_seq_id(),
            status: SequenceStatus::Waiting,
            last_token: token_ids.last().copied(),
            token_ids: Some(token_ids),
            num_tokens,
            num_prompt_tokens: num_tokens,
            num_cached_tokens: 0,
            block_table: BlockTable::new(block_size),
            temperature: sampling.temperature,
            max_tokens: sampling.max_tokens,
            ignore_eos: sampling.ignore_eos,
        }
    }

    // ========== Getters ==========

    /// Get the sequence ID.
    pub fn seq_id(&self) -> SequenceId {
        self.seq_id
    }

    /// Get the current status.
    pub fn status(&self) -> SequenceStatus {
        self.status
    }

    /// Check if the sequence is finished.
    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }

    /// Get the block size this sequence is laid out with.
    pub fn block_size(&self) -> usize {
        self.block_table.block_size()
    }

    /// Get the block table.
    pub fn block_table(&self) -> &BlockTable {
        &self.block_table
    }

    pub(crate) fn block_table_mut(&mut self) -> &mut BlockTable {
        &mut self.block_table
    }

    /// Number of leading tokens whose KV is already resident in shared blocks.
    pub fn num_cached_tokens(&self) -> usize {
        self.num_cached_tokens
    }

    pub(crate) fn set_num_cached_tokens(&mut self, num_cached_tokens: usize) {
        self.num_cached_tokens = num_cached_tokens;
    }

    /// Sampling temperature.
    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    /// Maximum number of tokens to generate.
    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Whether generation continues past end-of-sequence.
    pub fn ignore_eos(&self) -> bool {
        self.ignore_eos
    }

    // ========== Length queries ==========

    /// Total number of tokens (prompt + generated).
    pub fn len(&self) -> usize {
        self.num_tokens
    }

    /// Check if the sequence holds no tokens.
    pub fn is_empty(&self) -> bool {
        self.num_tokens == 0
    }

    /// Number of prompt tokens.
    pub fn num_prompt_tokens(&self) -> usize {
        self.num_prompt_tokens
    }

    /// Number of generated tokens.
    pub fn num_completion_tokens(&self) -> usize {
        self.num_tokens - self.num_prompt_tokens
    }

    /// Number of leading blocks fully covered by cached tokens.
    pub fn num_cached_blocks(&self) -> usize {
        self.num_cached_tokens / self.block_size()
    }

    /// Number of blocks needed to hold every token.
    pub fn num_blocks(&self) -> usize {
        compute_num_blocks(self.num_tokens, self.block_size())
    }

    /// Number of tokens in the last (possibly partial) block.
    pub fn last_block_num_tokens(&self) -> usize {
        self.num_tokens - self.num_blocks().saturating_sub(1) * self.block_size()
    }

    // ========== Token access ==========

    /// Get the last token ID.
    pub fn last_token(&self) -> Option<u32> {
        self.last_token
    }

    /// All token IDs (prompt + generated).
    ///
    /// # Errors
    ///
    /// Returns [`Error::TokensUnavailable`] for a sequence restored from a
    /// last-token snapshot.
    pub fn token_ids(&self) -> Result<&[u32]> {
        self.token_ids.as_deref().ok_or(Error::TokensUnavailable)
    }

    /// Prompt token IDs.
    pub fn prompt_token_ids(&self) -> Result<&[u32]> {
        Ok(&self.token_ids()?[..self.num_prompt_tokens])
    }

    /// Generated token IDs.
    pub fn completion_token_ids(&self) -> Result<&[u32]> {
        Ok(&self.token_ids()?[self.num_prompt_tokens..])
    }

    /// Token IDs of logical block `i`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BlockIndexOutOfBounds`] if `i >= num_blocks()` and
    /// [`Error::TokensUnavailable`] if the token history was not restored.
    pub fn block(&self, i: usize) -> Result<&[u32]> {
        let num_blocks = self.num_blocks();
        if i >= num_blocks {
            return Err(Error::BlockIndexOutOfBounds {
                logical_idx: i,
                num_blocks,
            });
        }
        let tokens = self.token_ids()?;
        let block_size = self.block_size();
        let end = ((i + 1) * block_size).min(tokens.len());
        Ok(&tokens[i * block_size..end])
    }

    /// Append a generated token.
    pub fn append_token(&mut self, token_id: u32) {
        if let Some(tokens) = self.token_ids.as_mut() {
            tokens.push(token_id);
        }
        self.last_token = Some(token_id);
        self.num_tokens += 1;
    }

    // ========== State transitions ==========

    /// Transition to running state.
    ///
    /// # Errors
    ///
    /// Returns error if the sequence is not waiting.
    pub fn set_running(&mut self) -> Result<()> {
        match self.status {
            SequenceStatus::Waiting => {
                self.status = SequenceStatus::Running;
                Ok(())
            }
            _ => Err(Error::InvalidStateTransition {
                from: self.status.as_str(),
                to: "Running",
            }),
        }
    }

    /// Transition back to waiting state (preempted by the scheduler).
    ///
    /// # Errors
    ///
    /// Returns error if the sequence is not running.
    pub fn set_waiting(&mut self) -> Result<()> {
        match self.status {
            SequenceStatus::Running => {
                self.status = SequenceStatus::Waiting;
                Ok(())
            }
            _ => Err(Error::InvalidStateTransition {
                from: self.status.as_str(),
                to: "Waiting",
            }),
        }
    }

    /// Mark the sequence as finished.
    pub fn set_finished(&mut self) {
        self.status = SequenceStatus::Finished;
    }

    // ========== Persistence ==========

    /// Capture the state a model worker needs to run this sequence.
    ///
    /// The full token list is only carried while nothing has been generated;
    /// afterwards the last token is enough because earlier tokens' KV is
    /// already in the cache.
    pub fn snapshot(&self) -> SequenceSnapshot {
        // Restore only drops the token history once a token was generated, and
        // generating a token always sets `last_token`.
        let payload = if self.num_completion_tokens() == 0 {
            SnapshotPayload::Tokens(self.token_ids.clone().unwrap_or_default())
        } else {
            SnapshotPayload::LastToken(self.last_token.unwrap_or_default())
        };

        SequenceSnapshot {
            seq_id: self.seq_id,
            num_tokens: self.num_tokens,
            num_prompt_tokens: self.num_prompt_tokens,
            num_cached_tokens: self.num_cached_tokens,
            block_table: self.block_table.get_physical_block_ids().to_vec(),
            payload,
        }
    }

    /// Rebuild a sequence from a snapshot.
    ///
    /// Sampling parameters are not part of the snapshot and come back as
    /// defaults. The status is `Waiting` when nothing has been generated and
    /// `Running` otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSnapshot`] if the payload shape does not match
    /// the completion count, the token counts disagree, or the block table has
    /// the wrong length for `block_size`.
    pub fn restore(snapshot: SequenceSnapshot, block_size: usize) -> Result<Self> {
        let SequenceSnapshot {
            seq_id,
            num_tokens,
            num_prompt_tokens,
            num_cached_tokens,
            block_table,
            payload,
        } = snapshot;

        if block_size == 0 {
            return Err(Error::InvalidSnapshot("block_size must be positive".to_string()));
        }
        if num_prompt_tokens > num_tokens {
            return Err(Error::InvalidSnapshot(format!(
                "{num_prompt_tokens} prompt tokens exceed {num_tokens} total tokens"
            )));
        }
        if num_cached_tokens > num_tokens {
            return Err(Error::InvalidSnapshot(format!(
                "{num_cached_tokens} cached tokens exceed {num_tokens} total tokens"
            )));
        }
        let expected_blocks = compute_num_blocks(num_tokens, block_size);
        if !block_table.is_empty() && block_table.len() != expected_blocks {
            return Err(Error::InvalidSnapshot(format!(
                "block table has {} entries, expected {expected_blocks}",
                block_table.len()
            )));
        }

        let num_completion_tokens = num_tokens - num_prompt_tokens;
        let (token_ids, last_token) = match payload {
            SnapshotPayload::Tokens(tokens) => {
                if num_completion_tokens != 0 {
                    return Err(Error::InvalidSnapshot(format!(
                        "full token payload with {num_completion_tokens} completion tokens"
                    )));
                }
                if tokens.len() != num_tokens {
                    return Err(Error::InvalidSnapshot(format!(
                        "payload has {} tokens, expected {num_tokens}",
                        tokens.len()
                    )));
                }
                let last = tokens.last().copied();
                (Some(tokens), last)
            }
            SnapshotPayload::LastToken(token) => {
                if num_completion_tokens == 0 {
                    return Err(Error::InvalidSnapshot(
                        "last-token payload without completion tokens".to_string(),
                    ));
                }
                (None, Some(token))
            }
        };

        let status = if num_completion_tokens == 0 {
            SequenceStatus::Waiting
        } else {
            SequenceStatus::Running
        };
        let sampling = SamplingConfig::default();

        Ok(Self {
            seq_id,
            status,
            token_ids,
            last_token,
            num_tokens,
            num_prompt_tokens,
            num_cached_tokens,
            block_table: BlockTable::from_block_ids(block_size, block_table),
            temperature: sampling.temperature,
            max_tokens: sampling.max_tokens,
            ignore_eos: sampling.ignore_eos,
        })
    }
}

impl PartialEq for Sequence {
    fn eq(&self, other: &Self) -> bool {
        self.seq_id == other.seq_id
    }
}

impl Eq for Sequence {}

impl std::hash::Hash for Sequence {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.seq_id.hash(state);
    }
}

/// Token payload of a [`SequenceSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotPayload {
    /// Every token id; only while no token has been generated.
    Tokens(Vec<u32>),
    /// The most recently generated token id.
    LastToken(u32),
}

/// Serializable state of a [`Sequence`] shipped to model workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceSnapshot {
    pub seq_id: SequenceId,
    pub num_tokens: usize,
    pub num_prompt_tokens: usize,
    pub num_cached_tokens: usize,
    pub block_table: Vec<usize>,
    pub payload: SnapshotPayload,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_creation() {
        let seq = Sequence::new(vec![10, 20, 30, 40], 2);

        assert_eq!(seq.len(), 4);
        assert_eq!(seq.num_prompt_tokens(), 4);
        assert_eq!(seq.num_completion_tokens(), 0);
        assert_eq!(seq.num_cached_tokens(), 0);
        assert_eq!(seq.last_token(), Some(40));
        assert_eq!(seq.status(), SequenceStatus::Waiting);
        assert!(seq.block_table().is_empty());
    }

    #[test]
    fn test_seq_ids_increase() {
        let a = Sequence::new(vec![1], 4);
        let b = Sequence::new(vec![1], 4);
        assert!(b.seq_id() > a.seq_id());
        assert_ne!(a, b);
    }

    #[test]
    fn test_block_slices() {
        let seq = Sequence::new(vec![1, 2, 3, 4, 5], 2);

        assert_eq!(seq.num_blocks(), 3);
        assert_eq!(seq.block(0).unwrap(), &[1, 2]);
        assert_eq!(seq.block(2).unwrap(), &[5]);
        assert_eq!(seq.last_block_num_tokens(), 1);
        assert!(seq.block(3).is_err());
    }

    #[test]
    fn test_empty_sequence() {
        let seq = Sequence::new(Vec::new(), 4);
        assert!(seq.is_empty());
        assert_eq!(seq.num_blocks(), 0);
        assert_eq!(seq.last_block_num_tokens(), 0);
        assert_eq!(seq.last_token(), None);
    }

    #[test]
    #[should_panic(expected = "block_size must be positive")]
    fn test_zero_block_size_is_rejected_at_construction() {
        Sequence::new(vec![1, 2, 3], 0);
    }

    #[test]
    fn test_state_transitions() {
        let mut seq = Sequence::new(vec![1, 2, 3], 4);

        assert!(seq.set_waiting().is_err());
        assert!(seq.set_running().is_ok());
        assert!(seq.set_running().is_err());
        assert!(seq.set_waiting().is_ok());

        seq.set_finished();
        assert!(seq.is_finished());
        assert!(seq.set_running().is_err());
    }

    #[test]
    fn test_snapshot_payload_switches_after_first_completion() {
        let mut seq = Sequence::new(vec![1, 2, 3], 4);
        assert_eq!(seq.snapshot().payload, SnapshotPayload::Tokens(vec![1, 2, 3]));

        seq.append_token(9);
        assert_eq!(seq.snapshot().payload, SnapshotPayload::LastToken(9));
    }
}
