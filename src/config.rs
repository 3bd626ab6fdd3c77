//! Configuration types for paged-kv.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Block sizes must be a multiple of this many tokens.
///
/// Attention kernels read the cache in aligned tiles; only the engine-facing
/// configuration enforces it. [`BlockManager::new`](crate::core::block_manager::BlockManager::new)
/// accepts any positive size.
pub const BLOCK_SIZE_ALIGNMENT: usize = 256;

/// KV cache pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Number of tokens per block.
    pub block_size: usize,
    /// Total number of blocks in the pool.
    pub num_blocks: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            block_size: 256,
            num_blocks: 1024,
        }
    }
}

impl CacheConfig {
    /// Create a configuration and validate it.
    pub fn new(block_size: usize, num_blocks: usize) -> Result<Self> {
        let config = Self {
            block_size,
            num_blocks,
        };
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file and validate it.
    ///
    /// Missing fields fall back to [`CacheConfig::default`].
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the pool shape.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `num_blocks` is zero or `block_size` is not
    /// a positive multiple of [`BLOCK_SIZE_ALIGNMENT`].
    pub fn validate(&self) -> Result<()> {
        if self.num_blocks == 0 {
            return Err(Error::Config("num_blocks must be positive".to_string()));
        }
        if self.block_size == 0 || self.block_size % BLOCK_SIZE_ALIGNMENT != 0 {
            return Err(Error::Config(format!(
                "block_size {} must be a positive multiple of {}",
                self.block_size, BLOCK_SIZE_ALIGNMENT
            )));
        }
        Ok(())
    }

    /// Total number of token slots in the pool.
    pub fn num_slots(&self) -> usize {
        self.block_size * self.num_blocks
    }
}

/// Per-request sampling parameters.
///
/// Carried on each [`Sequence`](crate::core::sequence::Sequence) for the
/// sampler; the allocator never reads them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Temperature for sampling (1.0 = no change).
    pub temperature: f32,
    /// Maximum tokens to generate.
    pub max_tokens: usize,
    /// Keep generating past an end-of-sequence token.
    pub ignore_eos: bool,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            max_tokens: 64,
            ignore_eos: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_cache_config_is_valid() {
        let config = CacheConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.num_slots(), 256 * 1024);
    }

    #[test]
    fn test_cache_config_rejects_bad_shapes() {
        assert!(CacheConfig::new(256, 0).is_err());
        assert!(CacheConfig::new(0, 16).is_err());
        assert!(CacheConfig::new(16, 16).is_err());
        assert!(CacheConfig::new(512, 16).is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: CacheConfig = serde_json::from_str(r#"{"num_blocks": 8}"#).unwrap();
        assert_eq!(config.num_blocks, 8);
        assert_eq!(config.block_size, 256);

        let sampling: SamplingConfig = serde_json::from_str(r#"{"ignore_eos": true}"#).unwrap();
        assert!(sampling.ignore_eos);
        assert_eq!(sampling.max_tokens, 64);
    }
}
