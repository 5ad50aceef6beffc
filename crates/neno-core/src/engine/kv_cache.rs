//! Paged KV cache: block arena and sequence pager.
//!
//! Follows vLLM's paged attention design:
//! - Fixed-size blocks allocated from a free list
//! - Per-sequence virtual-to-physical block mapping
//! - Token position `p` lives in `blocks[p / block_size]` slot `p % block_size`

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::types::{BlockId, SequenceId};

/// Geometry of the KV cache.
#[derive(Debug, Clone)]
pub struct KvCacheConfig {
    /// Number of transformer layers.
    pub num_layers: usize,
    /// Number of KV heads per layer.
    pub num_kv_heads: usize,
    /// Dimension of each attention head.
    pub head_dim: usize,
    /// Tokens per block.
    pub block_size: usize,
    /// Total number of blocks in the arena.
    pub num_blocks: usize,
    /// Bytes per cache element (2 for f16, 4 for f32).
    pub dtype_bytes: usize,
}

impl Default for KvCacheConfig {
    fn default() -> Self {
        Self {
            num_layers: 24,
            num_kv_heads: 8,
            head_dim: 64,
            block_size: 16,
            num_blocks: 1024,
            dtype_bytes: 2,
        }
    }
}

impl KvCacheConfig {
    /// Bytes held by one block: K and V for every layer and head.
    pub fn block_bytes(&self) -> usize {
        2 * self.num_layers * self.num_kv_heads * self.block_size * self.head_dim * self.dtype_bytes
    }

    /// Bytes of the whole arena region.
    pub fn total_bytes(&self) -> usize {
        self.block_bytes() * self.num_blocks
    }

    /// Number of blocks needed to hold `num_tokens` positions.
    pub fn blocks_for_tokens(&self, num_tokens: usize) -> usize {
        num_tokens.div_ceil(self.block_size)
    }
}

/// Usage snapshot of the arena, exposed through engine stats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvCacheStats {
    pub total_blocks: usize,
    pub free_blocks: usize,
    pub bytes_used: usize,
    pub num_sequences: usize,
}

impl KvCacheStats {
    /// Fraction of blocks in use.
    pub fn utilization(&self) -> f64 {
        if self.total_blocks == 0 {
            return 0.0;
        }
        (self.total_blocks - self.free_blocks) as f64 / self.total_blocks as f64
    }
}

/// Owner of the cache region: one contiguous allocation carved into
/// fixed-size blocks, handed out by physical index.
///
/// The arena attaches no tensor semantics to blocks and does not know
/// which sequence holds which index.
pub struct BlockArena {
    config: KvCacheConfig,
    /// The backing region. Kernels address into it at `block_offset(id)`.
    data: Vec<u8>,
    free_list: VecDeque<BlockId>,
    /// Tracks live indices so a double free fails fast.
    allocated: Vec<bool>,
}

impl BlockArena {
    /// Allocate the region and seed the free list with every index.
    pub fn new(config: KvCacheConfig) -> Self {
        let data = vec![0u8; config.total_bytes()];
        let free_list: VecDeque<BlockId> = (0..config.num_blocks).collect();
        let allocated = vec![false; config.num_blocks];
        debug!(
            blocks = config.num_blocks,
            block_bytes = config.block_bytes(),
            "kv arena created"
        );
        Self {
            config,
            data,
            free_list,
            allocated,
        }
    }

    /// Pop one block from the free list. O(1).
    pub fn allocate(&mut self) -> Option<BlockId> {
        let id = self.free_list.pop_front()?;
        self.allocated[id] = true;
        Some(id)
    }

    /// Return a block to the free list.
    ///
    /// Panics on double free or an out-of-range index: both are
    /// programmer errors, not recoverable conditions.
    pub fn free(&mut self, id: BlockId) {
        assert!(id < self.config.num_blocks, "freed unknown block {id}");
        assert!(self.allocated[id], "double free of block {id}");
        self.allocated[id] = false;
        self.free_list.push_back(id);
    }

    /// Byte offset of a block inside the region.
    pub fn block_offset(&self, id: BlockId) -> usize {
        id * self.config.block_bytes()
    }

    /// Raw bytes of one block, for kernels addressing the region directly.
    pub fn block_bytes_mut(&mut self, id: BlockId) -> &mut [u8] {
        let offset = self.block_offset(id);
        let len = self.config.block_bytes();
        &mut self.data[offset..offset + len]
    }

    pub fn num_free(&self) -> usize {
        self.free_list.len()
    }

    pub fn num_blocks(&self) -> usize {
        self.config.num_blocks
    }

    /// Bytes currently backing live blocks.
    pub fn bytes_used(&self) -> usize {
        (self.num_blocks() - self.num_free()) * self.config.block_bytes()
    }

    pub fn config(&self) -> &KvCacheConfig {
        &self.config
    }
}

/// Cache state of one active request: an ordered block list plus the
/// number of populated positions.
///
/// The last block may be partially filled;
/// `⌈num_tokens / block_size⌉ ≤ blocks.len()` always holds.
#[derive(Debug, Clone)]
pub struct Sequence {
    pub id: SequenceId,
    pub blocks: Vec<BlockId>,
    pub num_tokens: usize,
    block_size: usize,
}

impl Sequence {
    fn new(id: SequenceId, block_size: usize) -> Self {
        Self {
            id,
            blocks: Vec::new(),
            num_tokens: 0,
            block_size,
        }
    }

    /// Physical block holding token position `pos`.
    pub fn block_for_position(&self, pos: usize) -> Option<BlockId> {
        self.blocks.get(pos / self.block_size).copied()
    }

    /// Slot of token position `pos` within its block.
    pub fn slot_for_position(&self, pos: usize) -> usize {
        pos % self.block_size
    }

    /// Positions this block list can hold.
    pub fn capacity_tokens(&self) -> usize {
        self.blocks.len() * self.block_size
    }
}

/// Maps `SequenceId → Sequence` and owns the arena. The sole bridge
/// between logical token positions and physical blocks.
pub struct Pager {
    arena: BlockArena,
    sequences: HashMap<SequenceId, Sequence>,
}

impl Pager {
    pub fn new(config: KvCacheConfig) -> Self {
        Self {
            arena: BlockArena::new(config),
            sequences: HashMap::new(),
        }
    }

    /// Register a new empty sequence. Returns `false` if the id exists.
    pub fn create_sequence(&mut self, id: SequenceId) -> bool {
        if self.sequences.contains_key(&id) {
            return false;
        }
        let block_size = self.arena.config.block_size;
        self.sequences.insert(id, Sequence::new(id, block_size));
        true
    }

    /// Grow a sequence's block list until it covers `min_tokens` positions.
    ///
    /// All-or-nothing: if the arena empties partway, every block acquired
    /// in this call is returned and the sequence is left unchanged.
    pub fn allocate_blocks_for_sequence(&mut self, id: SequenceId, min_tokens: usize) -> bool {
        let need = {
            let Some(seq) = self.sequences.get(&id) else {
                return false;
            };
            let target = self.arena.config.blocks_for_tokens(min_tokens);
            target.saturating_sub(seq.blocks.len())
        };

        let mut acquired = Vec::with_capacity(need);
        for _ in 0..need {
            match self.arena.allocate() {
                Some(block) => acquired.push(block),
                None => {
                    for block in acquired {
                        self.arena.free(block);
                    }
                    debug!(sequence_id = id, min_tokens, "block allocation rolled back");
                    return false;
                }
            }
        }

        let seq = self
            .sequences
            .get_mut(&id)
            .expect("sequence checked above");
        seq.blocks.extend(acquired);
        true
    }

    /// Snapshot of a sequence for the engine's read path.
    pub fn get_sequence(&self, id: SequenceId) -> Option<Sequence> {
        self.sequences.get(&id).cloned()
    }

    /// Record how many positions of a sequence are populated.
    pub fn set_num_tokens(&mut self, id: SequenceId, num_tokens: usize) {
        if let Some(seq) = self.sequences.get_mut(&id) {
            debug_assert!(
                num_tokens <= seq.capacity_tokens(),
                "num_tokens {} beyond capacity {}",
                num_tokens,
                seq.capacity_tokens()
            );
            seq.num_tokens = num_tokens;
        }
    }

    /// Free every block of a sequence back to the arena and drop the
    /// mapping. Unknown ids return silently so that cancel/complete races
    /// stay simple; the block count freed is returned for accounting.
    pub fn delete_sequence(&mut self, id: SequenceId) -> usize {
        let Some(seq) = self.sequences.remove(&id) else {
            return 0;
        };
        let freed = seq.blocks.len();
        for block in seq.blocks {
            self.arena.free(block);
        }
        debug!(sequence_id = id, freed, "sequence deleted");
        freed
    }

    pub fn num_free_blocks(&self) -> usize {
        self.arena.num_free()
    }

    pub fn config(&self) -> &KvCacheConfig {
        &self.arena.config
    }

    pub fn stats(&self) -> KvCacheStats {
        KvCacheStats {
            total_blocks: self.arena.num_blocks(),
            free_blocks: self.arena.num_free(),
            bytes_used: self.arena.bytes_used(),
            num_sequences: self.sequences.len(),
        }
    }

    /// Sum of blocks held by live sequences; with `num_free_blocks` this
    /// must partition the arena.
    pub fn blocks_held(&self) -> usize {
        self.sequences.values().map(|s| s.blocks.len()).sum()
    }

    /// Ids of every live sequence.
    pub fn sequence_ids(&self) -> Vec<SequenceId> {
        self.sequences.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> KvCacheConfig {
        KvCacheConfig {
            num_layers: 2,
            num_kv_heads: 2,
            head_dim: 8,
            block_size: 4,
            num_blocks: 8,
            dtype_bytes: 2,
        }
    }

    #[test]
    fn test_arena_allocate_free() {
        let mut arena = BlockArena::new(small_config());
        assert_eq!(arena.num_free(), 8);

        let a = arena.allocate().unwrap();
        let b = arena.allocate().unwrap();
        assert_ne!(a, b);
        assert_eq!(arena.num_free(), 6);

        arena.free(a);
        assert_eq!(arena.num_free(), 7);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_arena_double_free_panics() {
        let mut arena = BlockArena::new(small_config());
        let a = arena.allocate().unwrap();
        arena.free(a);
        arena.free(a);
    }

    #[test]
    fn test_blocks_for_tokens_rounds_up() {
        let config = small_config();
        assert_eq!(config.blocks_for_tokens(0), 0);
        assert_eq!(config.blocks_for_tokens(1), 1);
        assert_eq!(config.blocks_for_tokens(4), 1);
        assert_eq!(config.blocks_for_tokens(5), 2);
    }

    #[test]
    fn test_pager_allocate_and_position_math() {
        let mut pager = Pager::new(small_config());
        assert!(pager.create_sequence(1));
        assert!(!pager.create_sequence(1));

        assert!(pager.allocate_blocks_for_sequence(1, 6));
        let seq = pager.get_sequence(1).unwrap();
        assert_eq!(seq.blocks.len(), 2);

        // Position 5 sits in the second block, slot 1.
        assert_eq!(seq.block_for_position(5), Some(seq.blocks[1]));
        assert_eq!(seq.slot_for_position(5), 1);
    }

    #[test]
    fn test_pager_rollback_on_exhaustion() {
        let mut pager = Pager::new(small_config());
        pager.create_sequence(1);
        // 8 blocks of 4 tokens each; 40 tokens needs 10 blocks.
        assert!(!pager.allocate_blocks_for_sequence(1, 40));
        // Nothing leaked.
        assert_eq!(pager.num_free_blocks(), 8);
        assert_eq!(pager.get_sequence(1).unwrap().blocks.len(), 0);
    }

    #[test]
    fn test_pager_delete_is_idempotent() {
        let mut pager = Pager::new(small_config());
        pager.create_sequence(7);
        pager.allocate_blocks_for_sequence(7, 8);
        assert_eq!(pager.delete_sequence(7), 2);
        assert_eq!(pager.delete_sequence(7), 0);
        assert_eq!(pager.num_free_blocks(), 8);
    }

    #[test]
    fn test_block_conservation() {
        let mut pager = Pager::new(small_config());
        for id in 0..3 {
            pager.create_sequence(id);
            pager.allocate_blocks_for_sequence(id, 4 + id as usize);
        }
        assert_eq!(pager.blocks_held() + pager.num_free_blocks(), 8);
        pager.delete_sequence(1);
        assert_eq!(pager.blocks_held() + pager.num_free_blocks(), 8);
    }
}
