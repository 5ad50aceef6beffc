//! Engine core configuration.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::kv_cache::KvCacheConfig;

/// Which side of the batch gets first claim on the token budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DecodePreference {
    /// In-flight decode requests are drained before prefill admission.
    #[default]
    Decode,
    /// Prefill continuation and admission run before decode is charged.
    Prefill,
}

/// Configuration for the scheduler, KV cache, and speculative layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineCoreConfig {
    /// Token budget for one batch (prefill + decode combined).
    #[serde(default = "default_max_batch_tokens")]
    pub max_batch_tokens: usize,

    /// Maximum number of requests in one batch.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Token budget for the prefill portion of one batch.
    #[serde(default = "default_max_prefill_tokens")]
    pub max_prefill_tokens: usize,

    /// Total number of KV blocks in the arena.
    #[serde(default = "default_total_kv_blocks")]
    pub total_kv_blocks: usize,

    /// Tokens per KV block.
    #[serde(default = "default_kv_block_size")]
    pub kv_block_size: usize,

    /// Largest prefill chunk one request may charge in a single batch.
    #[serde(default = "default_max_prefill_chunk_size")]
    pub max_prefill_chunk_size: usize,

    /// Split long prompts across multiple batches.
    #[serde(default = "default_true")]
    pub enable_chunked_prefill: bool,

    /// Admit from the waiting queue by priority instead of FIFO.
    #[serde(default)]
    pub enable_priority_scheduling: bool,

    /// Batch-construction preference.
    #[serde(default)]
    pub decode_preference: DecodePreference,

    /// Allow evicting decoding requests when admission lacks blocks.
    #[serde(default = "default_true")]
    pub enable_preemption: bool,

    /// Requests with fewer generated tokens than this are never preempted.
    #[serde(default = "default_min_decode_steps")]
    pub min_decode_steps_before_preempt: usize,

    /// Enable the draft/verify speculative layer (needs a draft executor).
    #[serde(default)]
    pub enable_speculative: bool,

    /// Initial draft length for speculation.
    #[serde(default = "default_speculation_length")]
    pub speculation_length: usize,

    /// Ceiling for the adaptive draft length.
    #[serde(default = "default_max_speculation_length")]
    pub max_speculation_length: usize,

    /// Rolling acceptance rate below which speculation is suspended.
    #[serde(default = "default_min_acceptance_rate")]
    pub min_acceptance_rate: f64,

    /// Number of recent speculation attempts in the acceptance window.
    #[serde(default = "default_acceptance_window")]
    pub acceptance_window: usize,

    /// Number of transformer layers.
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,

    /// Number of KV heads (GQA/MQA aware).
    #[serde(default = "default_num_kv_heads")]
    pub num_kv_heads: usize,

    /// Attention head dimension.
    #[serde(default = "default_head_dim")]
    pub head_dim: usize,

    /// Bytes per cache element (2 for f16, 4 for f32).
    #[serde(default = "default_dtype_bytes")]
    pub dtype_bytes: usize,
}

impl Default for EngineCoreConfig {
    fn default() -> Self {
        Self {
            max_batch_tokens: default_max_batch_tokens(),
            max_batch_size: default_max_batch_size(),
            max_prefill_tokens: default_max_prefill_tokens(),
            total_kv_blocks: default_total_kv_blocks(),
            kv_block_size: default_kv_block_size(),
            max_prefill_chunk_size: default_max_prefill_chunk_size(),
            enable_chunked_prefill: true,
            enable_priority_scheduling: false,
            decode_preference: DecodePreference::default(),
            enable_preemption: true,
            min_decode_steps_before_preempt: default_min_decode_steps(),
            enable_speculative: false,
            speculation_length: default_speculation_length(),
            max_speculation_length: default_max_speculation_length(),
            min_acceptance_rate: default_min_acceptance_rate(),
            acceptance_window: default_acceptance_window(),
            num_layers: default_num_layers(),
            num_kv_heads: default_num_kv_heads(),
            head_dim: default_head_dim(),
            dtype_bytes: default_dtype_bytes(),
        }
    }
}

impl EngineCoreConfig {
    /// Check internal consistency before building an engine from this.
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_tokens == 0 || self.max_batch_size == 0 {
            return Err(Error::Config("batch budgets must be non-zero".into()));
        }
        if self.max_prefill_tokens == 0 || self.max_prefill_chunk_size == 0 {
            return Err(Error::Config("prefill budgets must be non-zero".into()));
        }
        if self.total_kv_blocks == 0 || self.kv_block_size == 0 {
            return Err(Error::Config("kv cache geometry must be non-zero".into()));
        }
        if self.speculation_length == 0 || self.max_speculation_length < self.speculation_length {
            return Err(Error::Config(
                "speculation_length must be in 1..=max_speculation_length".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_acceptance_rate) {
            return Err(Error::Config("min_acceptance_rate must be in [0, 1]".into()));
        }
        Ok(())
    }

    /// KV cache geometry derived from this configuration.
    pub fn kv_cache_config(&self) -> KvCacheConfig {
        KvCacheConfig {
            num_layers: self.num_layers,
            num_kv_heads: self.num_kv_heads,
            head_dim: self.head_dim,
            block_size: self.kv_block_size,
            num_blocks: self.total_kv_blocks,
            dtype_bytes: self.dtype_bytes,
        }
    }
}

fn default_max_batch_tokens() -> usize {
    2048
}

fn default_max_batch_size() -> usize {
    16
}

fn default_max_prefill_tokens() -> usize {
    1024
}

fn default_total_kv_blocks() -> usize {
    1024
}

fn default_kv_block_size() -> usize {
    16
}

fn default_max_prefill_chunk_size() -> usize {
    512
}

fn default_min_decode_steps() -> usize {
    4
}

fn default_speculation_length() -> usize {
    4
}

fn default_max_speculation_length() -> usize {
    8
}

fn default_min_acceptance_rate() -> f64 {
    0.3
}

fn default_acceptance_window() -> usize {
    16
}

fn default_num_layers() -> usize {
    24
}

fn default_num_kv_heads() -> usize {
    8
}

fn default_head_dim() -> usize {
    64
}

fn default_dtype_bytes() -> usize {
    2
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EngineCoreConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_budgets() {
        let config = EngineCoreConfig {
            max_batch_tokens: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_inverted_speculation_bounds() {
        let config = EngineCoreConfig {
            speculation_length: 6,
            max_speculation_length: 4,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
