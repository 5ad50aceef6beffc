//! Speculative decoding: a small draft model proposes tokens, the target
//! model verifies them in one forward pass.
//!
//! Verification is deterministic argmax match, left to right; the first
//! mismatch discards the rest of the draft. A fully accepted draft earns
//! one bonus token from the target's final logits. A rolling window of
//! acceptance rates adapts the draft length and suspends speculation
//! when the draft model stops earning its keep.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{Error, Result};

use super::config::EngineCoreConfig;
use super::executor::Engine;
use super::request::Request;
use super::sampler;
use super::types::{SequenceId, TokenId};

/// Tuning for the speculative layer.
#[derive(Debug, Clone)]
pub struct SpeculativeConfig {
    /// Draft length at startup.
    pub initial_draft_len: usize,
    /// Ceiling for adaptive growth.
    pub max_draft_len: usize,
    /// Rolling acceptance rate below which speculation is suspended.
    pub min_acceptance_rate: f64,
    /// Number of recent attempts in the rolling window.
    pub window: usize,
}

impl From<&EngineCoreConfig> for SpeculativeConfig {
    fn from(config: &EngineCoreConfig) -> Self {
        Self {
            initial_draft_len: config.speculation_length,
            max_draft_len: config.max_speculation_length,
            min_acceptance_rate: config.min_acceptance_rate,
            window: config.acceptance_window,
        }
    }
}

/// Outcome of one draft/verify round.
#[derive(Debug, Clone)]
pub struct SpeculationResult {
    pub proposed: Vec<TokenId>,
    pub accepted: Vec<TokenId>,
    /// Present only when every proposal was accepted.
    pub bonus_token: Option<TokenId>,
}

impl SpeculationResult {
    pub fn num_accepted(&self) -> usize {
        self.accepted.len()
    }

    /// Tokens this round contributes to the request.
    pub fn total_tokens(&self) -> usize {
        self.accepted.len() + usize::from(self.bonus_token.is_some())
    }
}

/// Counters exposed through engine stats.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpeculativeStats {
    pub attempts: usize,
    pub proposed: usize,
    pub accepted: usize,
    pub bonus_tokens: usize,
    pub fallbacks: usize,
    pub current_draft_len: usize,
    pub rolling_acceptance: f64,
    /// Mean tokens emitted per attempt; 1.0 is the non-speculative
    /// baseline.
    pub tokens_per_attempt: f64,
}

struct SpecState {
    draft_len: usize,
    window: VecDeque<f64>,
    attempts: usize,
    proposed: usize,
    accepted: usize,
    bonus_tokens: usize,
    fallbacks: usize,
    emitted: usize,
}

/// Wraps a target and a draft [`Engine`], each with its own disjoint
/// arena. The draft mirrors every target sequence it speculates for and
/// keeps it in sync across partial acceptance by truncating
/// `num_tokens`; rejected slots are overwritten by later writes.
pub struct SpeculativeEngine {
    target: Arc<Engine>,
    draft: Arc<Engine>,
    config: SpeculativeConfig,
    state: Mutex<SpecState>,
}

impl SpeculativeEngine {
    pub fn new(target: Arc<Engine>, draft: Arc<Engine>, config: SpeculativeConfig) -> Self {
        let draft_len = config.initial_draft_len.clamp(1, config.max_draft_len);
        Self {
            target,
            draft,
            config,
            state: Mutex::new(SpecState {
                draft_len,
                window: VecDeque::new(),
                attempts: 0,
                proposed: 0,
                accepted: 0,
                bonus_tokens: 0,
                fallbacks: 0,
                emitted: 0,
            }),
        }
    }

    /// Whether the rolling acceptance rate still justifies speculating.
    /// When it does not, the caller decodes with the target model alone;
    /// the fallback is counted.
    pub fn should_speculate(&self) -> bool {
        let mut st = self.state.lock().unwrap();
        if st.window.is_empty() {
            return true;
        }
        let rate = st.window.iter().sum::<f64>() / st.window.len() as f64;
        if rate < self.config.min_acceptance_rate {
            st.fallbacks += 1;
            return false;
        }
        true
    }

    /// One draft/verify round for a decoding request. `remaining` caps
    /// the draft length (tokens the request may still emit).
    ///
    /// Returns `Err(ResourceExhausted)` when the draft arena cannot hold
    /// the mirror sequence; the caller falls back to plain decoding.
    pub fn speculate(&self, request: &Request, remaining: usize) -> Result<SpeculationResult> {
        let seq_id = request
            .sequence_id()
            .ok_or_else(|| Error::Engine(format!("request {} has no live sequence", request.id)))?;

        let k = {
            let st = self.state.lock().unwrap();
            st.draft_len.min(remaining)
        };
        if k == 0 {
            return Ok(SpeculationResult {
                proposed: Vec::new(),
                accepted: Vec::new(),
                bonus_token: None,
            });
        }

        self.prune_stale_draft_sequences();

        let context = request.context_tokens();
        let newest = *context
            .last()
            .ok_or_else(|| Error::Engine("speculation on empty context".into()))?;
        let consumed = context.len() - 1;

        self.sync_draft_sequence(seq_id, &context, consumed, k)?;

        // Draft proposes k tokens autoregressively, greedy.
        let mut proposed = Vec::with_capacity(k);
        let mut input = newest;
        for _ in 0..k {
            let logits = self.draft.decode_step(input, seq_id)?;
            let token = sampler::argmax(&logits);
            proposed.push(token);
            input = token;
        }

        // Target verifies the whole window in one pass: position i checks
        // proposal i, the extra final row feeds the bonus token.
        let mut window_tokens = Vec::with_capacity(k + 1);
        window_tokens.push(newest);
        window_tokens.extend_from_slice(&proposed);
        let target_logits = self.target.forward_window(&window_tokens, seq_id)?;

        let mut accepted = Vec::new();
        for (i, &token) in proposed.iter().enumerate() {
            if sampler::argmax(&target_logits[i]) == token {
                accepted.push(token);
            } else {
                break;
            }
        }

        let bonus_token = if accepted.len() == k {
            Some(sampler::argmax(&target_logits[k]))
        } else {
            // Roll both models back to the accepted prefix.
            let keep = consumed + accepted.len();
            self.target.truncate_sequence(seq_id, keep);
            self.draft.truncate_sequence(seq_id, keep);
            None
        };

        let result = SpeculationResult {
            proposed,
            accepted,
            bonus_token,
        };
        self.record(&result, k);
        trace!(
            request_id = %request.id,
            proposed = k,
            accepted = result.num_accepted(),
            bonus = result.bonus_token.is_some(),
            "speculation round"
        );
        Ok(result)
    }

    /// Drop the draft mirror of a finished sequence.
    pub fn release(&self, seq_id: SequenceId) {
        self.draft.pager().lock().unwrap().delete_sequence(seq_id);
    }

    pub fn stats(&self) -> SpeculativeStats {
        let st = self.state.lock().unwrap();
        let rolling = if st.window.is_empty() {
            0.0
        } else {
            st.window.iter().sum::<f64>() / st.window.len() as f64
        };
        SpeculativeStats {
            attempts: st.attempts,
            proposed: st.proposed,
            accepted: st.accepted,
            bonus_tokens: st.bonus_tokens,
            fallbacks: st.fallbacks,
            current_draft_len: st.draft_len,
            rolling_acceptance: rolling,
            tokens_per_attempt: if st.attempts == 0 {
                0.0
            } else {
                st.emitted as f64 / st.attempts as f64
            },
        }
    }

    /// Bring the draft mirror of `seq_id` level with the target: create
    /// it on first use, reserve room for the proposal window, and replay
    /// any context positions the draft has not consumed yet.
    fn sync_draft_sequence(
        &self,
        seq_id: SequenceId,
        context: &[TokenId],
        consumed: usize,
        k: usize,
    ) -> Result<()> {
        let draft_consumed = {
            let mut pager = self.draft.pager().lock().unwrap();
            pager.create_sequence(seq_id);
            if !pager.allocate_blocks_for_sequence(seq_id, context.len() + k) {
                return Err(Error::ResourceExhausted);
            }
            let seq = pager
                .get_sequence(seq_id)
                .ok_or_else(|| Error::Engine(format!("unknown draft sequence {seq_id}")))?;
            if seq.num_tokens > consumed {
                pager.set_num_tokens(seq_id, consumed);
                consumed
            } else {
                seq.num_tokens
            }
        };
        if draft_consumed < consumed {
            self.draft
                .prefill_chunk(&context[draft_consumed..consumed], draft_consumed, seq_id)?;
        }
        Ok(())
    }

    /// Draft sequences whose target counterpart is gone (request
    /// finished, cancelled, or preempted) are deleted.
    fn prune_stale_draft_sequences(&self) {
        let live = {
            let target = self.target.pager().lock().unwrap();
            target.sequence_ids()
        };
        let mut draft = self.draft.pager().lock().unwrap();
        for id in draft.sequence_ids() {
            if !live.contains(&id) {
                draft.delete_sequence(id);
                debug!(sequence_id = id, "stale draft sequence pruned");
            }
        }
    }

    fn record(&self, result: &SpeculationResult, k: usize) {
        let mut st = self.state.lock().unwrap();
        st.attempts += 1;
        st.proposed += k;
        st.accepted += result.num_accepted();
        st.bonus_tokens += usize::from(result.bonus_token.is_some());
        st.emitted += result.total_tokens();

        st.window.push_back(result.num_accepted() as f64 / k as f64);
        while st.window.len() > self.config.window {
            st.window.pop_front();
        }

        let rate = st.window.iter().sum::<f64>() / st.window.len() as f64;
        if rate > 0.8 && st.draft_len < self.config.max_draft_len {
            st.draft_len += 1;
        } else if rate < 0.5 && st.draft_len > 1 {
            st.draft_len -= 1;
        }
    }
}
