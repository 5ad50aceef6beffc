//! The consumed transformer contract and the engine adapter over it.
//!
//! The model itself (weights, kernels) lives behind [`ModelExecutor`];
//! the [`Engine`] adapter owns the pager bridge: it snapshots block
//! tables for the kernels, advances `num_tokens`, and applies the
//! sampling pipeline.

use std::sync::{Arc, Mutex};

use rand::Rng;

use crate::error::{Error, Result};
use crate::tokenizer::Tokenizer;

use super::kv_cache::{Pager, Sequence};
use super::request::SamplingParams;
use super::sampler;
use super::types::{Logits, SequenceId, TokenId};

/// The external transformer. One `forward` call covers prefill (feed the
/// whole prompt, use the last logits), decode (feed one token), and
/// speculative verification (logits at every fed position).
///
/// Kernels address KV memory through the block list in the sequence view;
/// position `p` is written to `blocks[p / block_size]` slot
/// `p % block_size`, sequentially for prefill and a single slot per
/// decode step.
pub trait ModelExecutor: Send + Sync {
    /// Run the model over `tokens` at positions
    /// `start_pos .. start_pos + tokens.len()`, returning logits for each
    /// fed position.
    fn forward(&self, tokens: &[TokenId], start_pos: usize, seq: &Sequence) -> Result<Vec<Logits>>;

    fn eos_token_id(&self) -> TokenId;

    fn vocab_size(&self) -> usize;
}

/// Narrow adapter over one executor plus the pager it reads through.
pub struct Engine {
    executor: Arc<dyn ModelExecutor>,
    pager: Arc<Mutex<Pager>>,
    tokenizer: Option<Arc<Tokenizer>>,
}

impl Engine {
    pub fn new(
        executor: Arc<dyn ModelExecutor>,
        pager: Arc<Mutex<Pager>>,
        tokenizer: Option<Arc<Tokenizer>>,
    ) -> Self {
        Self {
            executor,
            pager,
            tokenizer,
        }
    }

    pub fn pager(&self) -> &Arc<Mutex<Pager>> {
        &self.pager
    }

    pub fn eos_token_id(&self) -> TokenId {
        self.executor.eos_token_id()
    }

    pub fn encode(&self, text: &str) -> Result<Vec<TokenId>> {
        match &self.tokenizer {
            Some(t) => t.encode(text),
            None => Err(Error::Tokenization("no tokenizer configured".into())),
        }
    }

    pub fn decode(&self, tokens: &[TokenId]) -> Result<String> {
        match &self.tokenizer {
            Some(t) => t.decode(tokens),
            None => Err(Error::Tokenization("no tokenizer configured".into())),
        }
    }

    /// Run the model over the whole prompt from position 0 and return the
    /// logits of the last position. Records `num_tokens = prompt len`.
    pub fn prefill(&self, prompt_tokens: &[TokenId], seq_id: SequenceId) -> Result<Logits> {
        self.prefill_chunk(prompt_tokens, 0, seq_id)
    }

    /// Chunked-prefill step: feed `tokens` at `start_pos`, returning the
    /// logits of the chunk's last position.
    pub fn prefill_chunk(
        &self,
        tokens: &[TokenId],
        start_pos: usize,
        seq_id: SequenceId,
    ) -> Result<Logits> {
        let mut logits = self.forward_span(tokens, start_pos, seq_id)?;
        logits
            .pop()
            .ok_or_else(|| Error::Engine("prefill returned no logits".into()))
    }

    /// One-token forward pass at the sequence's current position.
    pub fn decode_step(&self, token: TokenId, seq_id: SequenceId) -> Result<Logits> {
        let start_pos = self
            .sequence_view(seq_id)?
            .num_tokens;
        let mut logits = self.forward_span(&[token], start_pos, seq_id)?;
        logits
            .pop()
            .ok_or_else(|| Error::Engine("decode returned no logits".into()))
    }

    /// Feed a window of tokens at the sequence's current position and
    /// return logits for every position. Verification path of the
    /// speculative layer.
    pub fn forward_window(&self, tokens: &[TokenId], seq_id: SequenceId) -> Result<Vec<Logits>> {
        let start_pos = self.sequence_view(seq_id)?.num_tokens;
        self.forward_span(tokens, start_pos, seq_id)
    }

    /// Rewind a sequence's populated-position count. Rejected speculative
    /// positions are simply overwritten by later writes.
    pub fn truncate_sequence(&self, seq_id: SequenceId, num_tokens: usize) {
        self.pager.lock().unwrap().set_num_tokens(seq_id, num_tokens);
    }

    /// Apply the sampling pipeline to full-precision logits.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        logits: &Logits,
        prior_tokens: &[TokenId],
        params: &SamplingParams,
        rng: &mut R,
    ) -> TokenId {
        sampler::sample(logits, prior_tokens, params, rng)
    }

    fn sequence_view(&self, seq_id: SequenceId) -> Result<Sequence> {
        self.pager
            .lock()
            .unwrap()
            .get_sequence(seq_id)
            .ok_or_else(|| Error::Engine(format!("unknown sequence {seq_id}")))
    }

    fn forward_span(
        &self,
        tokens: &[TokenId],
        start_pos: usize,
        seq_id: SequenceId,
    ) -> Result<Vec<Logits>> {
        let view = self.sequence_view(seq_id)?;
        if start_pos + tokens.len() > view.capacity_tokens() {
            // The scheduler reserves capacity before decode; running out
            // here means the reservation was exhausted.
            return Err(Error::ResourceExhausted);
        }
        let logits = self.executor.forward(tokens, start_pos, &view)?;
        if logits.len() != tokens.len() {
            return Err(Error::Engine(format!(
                "executor returned {} logit rows for {} tokens",
                logits.len(),
                tokens.len()
            )));
        }
        self.pager
            .lock()
            .unwrap()
            .set_num_tokens(seq_id, start_pos + tokens.len());
        Ok(logits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::kv_cache::KvCacheConfig;

    /// Deterministic stub: the argmax of every returned row is
    /// `input token + 1`.
    struct NextTokenExecutor {
        vocab: usize,
        eos: TokenId,
    }

    impl ModelExecutor for NextTokenExecutor {
        fn forward(
            &self,
            tokens: &[TokenId],
            _start_pos: usize,
            _seq: &Sequence,
        ) -> Result<Vec<Logits>> {
            Ok(tokens
                .iter()
                .map(|&t| {
                    let mut row = vec![0.0; self.vocab];
                    row[((t + 1) as usize) % self.vocab] = 1.0;
                    row
                })
                .collect())
        }

        fn eos_token_id(&self) -> TokenId {
            self.eos
        }

        fn vocab_size(&self) -> usize {
            self.vocab
        }
    }

    fn engine_with_blocks(num_blocks: usize) -> Engine {
        let config = KvCacheConfig {
            num_layers: 1,
            num_kv_heads: 1,
            head_dim: 4,
            block_size: 4,
            num_blocks,
            dtype_bytes: 2,
        };
        let pager = Arc::new(Mutex::new(Pager::new(config)));
        Engine::new(
            Arc::new(NextTokenExecutor { vocab: 64, eos: 63 }),
            pager,
            None,
        )
    }

    #[test]
    fn test_prefill_then_decode_advances_positions() {
        let engine = engine_with_blocks(4);
        {
            let mut pager = engine.pager().lock().unwrap();
            pager.create_sequence(1);
            assert!(pager.allocate_blocks_for_sequence(1, 8));
        }

        let logits = engine.prefill(&[1, 2, 3], 1).unwrap();
        assert_eq!(sampler::argmax(&logits), 4);
        assert_eq!(engine.pager().lock().unwrap().get_sequence(1).unwrap().num_tokens, 3);

        let logits = engine.decode_step(4, 1).unwrap();
        assert_eq!(sampler::argmax(&logits), 5);
        assert_eq!(engine.pager().lock().unwrap().get_sequence(1).unwrap().num_tokens, 4);
    }

    #[test]
    fn test_decode_past_capacity_is_resource_exhausted() {
        let engine = engine_with_blocks(1);
        {
            let mut pager = engine.pager().lock().unwrap();
            pager.create_sequence(1);
            assert!(pager.allocate_blocks_for_sequence(1, 4));
        }
        engine.prefill(&[1, 2, 3, 4], 1).unwrap();
        match engine.decode_step(5, 1) {
            Err(Error::ResourceExhausted) => {}
            other => panic!("expected ResourceExhausted, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_sequence_is_engine_error() {
        let engine = engine_with_blocks(1);
        assert!(matches!(
            engine.decode_step(1, 99),
            Err(Error::Engine(_))
        ));
    }
}
