//! Continuous-batching request scheduler.
//!
//! The scheduler manages request queues and decides which requests to
//! process in each engine step. It handles:
//! - Waiting queue (admitted requests awaiting prefill)
//! - Prefilling set (chunked prefills spanning multiple steps)
//! - Decoding queue (steady-state one-token-per-step requests)
//! - Paused queue (preempted requests awaiting re-prefill)
//! - Token and batch-size budgets
//! - KV block accounting and preemption under memory pressure
//!
//! Every state transition happens behind one mutex; `next_batch` never
//! calls into the model.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

use super::config::{DecodePreference, EngineCoreConfig};
use super::kv_cache::{KvCacheStats, Pager};
use super::request::Request;
use super::types::{FinishReason, RequestId, RequestStatus, SequenceId, TokenId};

/// One prefill unit inside a batch. `start..start + len` indexes the
/// request's context (prompt plus any generated tokens on re-prefill).
pub struct PrefillEntry {
    pub request: Arc<Request>,
    pub start: usize,
    pub len: usize,
    /// Whether this chunk reaches the end of the context, producing the
    /// first sampled token.
    pub completes: bool,
}

/// A transient unit of work handed to the worker. Every member request
/// has a live sequence; the budgets were enforced at construction.
#[derive(Default)]
pub struct Batch {
    pub prefill: Vec<PrefillEntry>,
    pub decode: Vec<Arc<Request>>,
    pub total_tokens: usize,
    pub prefill_tokens: usize,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.prefill.is_empty() && self.decode.is_empty()
    }

    pub fn num_requests(&self) -> usize {
        self.prefill.len() + self.decode.len()
    }
}

/// Aggregate scheduler counters and queue depths.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub waiting: usize,
    pub prefilling: usize,
    pub decoding: usize,
    pub paused: usize,
    pub completed: usize,
    pub cancelled: usize,
    pub failed: usize,
    pub preemptions: usize,
    pub batches: usize,
    pub generated_tokens: usize,
    pub prefill_tokens: usize,
}

#[derive(Default)]
struct Counters {
    completed: usize,
    cancelled: usize,
    failed: usize,
    preemptions: usize,
    batches: usize,
    generated_tokens: usize,
    prefill_tokens: usize,
}

struct SchedulerState {
    waiting: VecDeque<Arc<Request>>,
    prefilling: Vec<Arc<Request>>,
    decoding: Vec<Arc<Request>>,
    paused: VecDeque<Arc<Request>>,
    all: HashMap<RequestId, Arc<Request>>,
    /// Mirror of the arena's free count. The scheduler is the single
    /// writer of allocations, so within the lock this is authoritative.
    num_free_blocks: usize,
    next_sequence_id: SequenceId,
    shutting_down: bool,
    counters: Counters,
}

pub struct Scheduler {
    config: EngineCoreConfig,
    pager: Arc<Mutex<Pager>>,
    eos_token_id: TokenId,
    state: Mutex<SchedulerState>,
}

impl Scheduler {
    pub fn new(config: EngineCoreConfig, pager: Arc<Mutex<Pager>>, eos_token_id: TokenId) -> Self {
        let num_free_blocks = pager.lock().unwrap().num_free_blocks();
        Self {
            config,
            pager,
            eos_token_id,
            state: Mutex::new(SchedulerState {
                waiting: VecDeque::new(),
                prefilling: Vec::new(),
                decoding: Vec::new(),
                paused: VecDeque::new(),
                all: HashMap::new(),
                num_free_blocks,
                next_sequence_id: 0,
                shutting_down: false,
                counters: Counters::default(),
            }),
        }
    }

    pub fn eos_token_id(&self) -> TokenId {
        self.eos_token_id
    }

    /// Enqueue a request. Fails on duplicate ids and after shutdown.
    pub fn submit_request(&self, request: Arc<Request>) -> Result<()> {
        request.params.validate()?;
        let mut st = self.state.lock().unwrap();
        if st.shutting_down {
            return Err(Error::ShuttingDown);
        }
        if st.all.contains_key(&request.id) {
            return Err(Error::DuplicateRequest(request.id.clone()));
        }
        debug!(
            request_id = %request.id,
            prompt_tokens = request.prompt_tokens.len(),
            priority = request.priority,
            "request enqueued"
        );
        st.all.insert(request.id.clone(), request.clone());
        st.waiting.push_back(request);
        Ok(())
    }

    /// Cancel a request. Synchronous: marks it finished, frees its
    /// blocks, and removes it from every queue. Idempotent; returns
    /// whether this call performed the cancellation.
    pub fn cancel_request(&self, id: &str) -> bool {
        let mut st = self.state.lock().unwrap();
        let Some(request) = st.all.get(id).cloned() else {
            return false;
        };
        if request.is_finished() {
            return false;
        }
        request.finish(FinishReason::Cancelled);
        self.release_sequence(&mut st, &request);
        Self::remove_from_queues(&mut st, &request.id);
        st.counters.cancelled += 1;
        debug!(request_id = %request.id, "request cancelled");
        true
    }

    pub fn get_request(&self, id: &str) -> Option<Arc<Request>> {
        self.state.lock().unwrap().all.get(id).cloned()
    }

    /// Build one batch under the token, prefill, and batch-size budgets.
    ///
    /// Returns an empty batch when nothing can run; the worker sleeps
    /// briefly and retries.
    pub fn next_batch(&self) -> Batch {
        let mut st = self.state.lock().unwrap();
        let mut batch = Batch::default();
        if st.shutting_down {
            return batch;
        }

        // Paused requests re-enter at the front of the waiting queue, in
        // their original order, before anything else is considered.
        let resumed: Vec<_> = st.paused.drain(..).collect();
        for request in resumed.into_iter().rev() {
            st.waiting.push_front(request);
        }

        self.retire_stopped(&mut st);
        match self.config.decode_preference {
            DecodePreference::Decode => {
                self.drain_decode(&mut st, &mut batch);
                self.continue_prefill(&mut st, &mut batch);
                self.admit_new(&mut st, &mut batch);
            }
            DecodePreference::Prefill => {
                self.continue_prefill(&mut st, &mut batch);
                self.admit_new(&mut st, &mut batch);
                self.drain_decode(&mut st, &mut batch);
            }
        }

        debug_assert!(batch.total_tokens <= self.config.max_batch_tokens);
        debug_assert!(batch.prefill_tokens <= self.config.max_prefill_tokens);
        debug_assert!(batch.num_requests() <= self.config.max_batch_size);
        batch
    }

    /// Post-execution accounting. Prefill completions already joined the
    /// decoding queue at construction; no state transitions happen here.
    pub fn complete_batch(&self, batch: &Batch) {
        let mut st = self.state.lock().unwrap();
        st.counters.batches += 1;
        st.counters.prefill_tokens += batch.prefill_tokens;
        st.counters.generated_tokens += batch.decode.len()
            + batch.prefill.iter().filter(|e| e.completes).count();
    }

    /// Make sure a decoding request's sequence can absorb `lookahead`
    /// more positions, growing its block list if the next write crosses a
    /// block boundary. On exhaustion, preempts one victim and retries
    /// once before giving up.
    pub fn ensure_decode_capacity(&self, request: &Arc<Request>, lookahead: usize) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        let Some(seq_id) = request.sequence_id() else {
            return Err(Error::Engine(format!(
                "request {} has no live sequence",
                request.id
            )));
        };
        if self.try_grow(&mut st, seq_id, lookahead)? {
            return Ok(());
        }
        if self.config.enable_preemption {
            let preempted =
                self.preempt_victims(&mut st, None, 1, request.priority, Some(&request.id));
            if preempted > 0 && self.try_grow(&mut st, seq_id, lookahead)? {
                return Ok(());
            }
        }
        warn!(request_id = %request.id, "decode growth exhausted kv blocks");
        Err(Error::ResourceExhausted)
    }

    /// Mark a request failed, releasing its blocks. Other requests are
    /// unaffected.
    pub fn fail_request(&self, request: &Arc<Request>, message: &str) {
        let mut st = self.state.lock().unwrap();
        if request.is_finished() {
            return;
        }
        request.fail(message);
        self.release_sequence(&mut st, request);
        Self::remove_from_queues(&mut st, &request.id);
        st.counters.failed += 1;
        warn!(request_id = %request.id, error = message, "request failed");
    }

    /// Cancel every unfinished request and refuse new submissions.
    pub fn shutdown(&self) {
        let mut st = self.state.lock().unwrap();
        st.shutting_down = true;
        let live: Vec<_> = st.all.values().cloned().collect();
        let mut cancelled = 0;
        for request in live {
            if !request.is_finished() {
                request.finish(FinishReason::Cancelled);
                self.release_sequence(&mut st, &request);
                cancelled += 1;
            }
        }
        st.waiting.clear();
        st.prefilling.clear();
        st.decoding.clear();
        st.paused.clear();
        st.counters.cancelled += cancelled;
        info!(cancelled, "scheduler shut down");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().unwrap().shutting_down
    }

    pub fn stats(&self) -> SchedulerStats {
        let st = self.state.lock().unwrap();
        SchedulerStats {
            waiting: st.waiting.len(),
            prefilling: st.prefilling.len(),
            decoding: st.decoding.len(),
            paused: st.paused.len(),
            completed: st.counters.completed,
            cancelled: st.counters.cancelled,
            failed: st.counters.failed,
            preemptions: st.counters.preemptions,
            batches: st.counters.batches,
            generated_tokens: st.counters.generated_tokens,
            prefill_tokens: st.counters.prefill_tokens,
        }
    }

    pub fn kv_stats(&self) -> KvCacheStats {
        self.pager.lock().unwrap().stats()
    }

    // Batch construction phases.

    /// Retire decoding requests whose stop condition was reached on the
    /// previous step: mark completed and release their blocks.
    fn retire_stopped(&self, st: &mut SchedulerState) {
        let decoding = std::mem::take(&mut st.decoding);
        for request in decoding {
            if request.is_finished() {
                // Cancelled or failed concurrently; blocks are already
                // released.
                continue;
            }
            match request.should_stop(self.eos_token_id) {
                Some(reason) => {
                    request.finish(reason);
                    self.release_sequence(st, &request);
                    st.counters.completed += 1;
                    debug!(request_id = %request.id, ?reason, "request completed");
                }
                None => st.decoding.push(request),
            }
        }
    }

    fn drain_decode(&self, st: &mut SchedulerState, batch: &mut Batch) {
        for request in &st.decoding {
            if batch.total_tokens + 1 > self.config.max_batch_tokens
                || batch.num_requests() >= self.config.max_batch_size
            {
                break;
            }
            batch.decode.push(request.clone());
            batch.total_tokens += 1;
        }
    }

    fn continue_prefill(&self, st: &mut SchedulerState, batch: &mut Batch) {
        let prefilling = std::mem::take(&mut st.prefilling);
        for request in prefilling {
            if request.is_finished() {
                continue;
            }
            let context_len = request.prompt_tokens.len() + request.num_generated();
            let start = request.num_computed_tokens();
            let remaining = context_len.saturating_sub(start);
            let chunk = self.chunk_budget(batch, remaining);
            if chunk == 0 || batch.num_requests() >= self.config.max_batch_size {
                st.prefilling.push(request);
                continue;
            }
            let completes = chunk == remaining;
            batch.total_tokens += chunk;
            batch.prefill_tokens += chunk;
            batch.prefill.push(PrefillEntry {
                request: request.clone(),
                start,
                len: chunk,
                completes,
            });
            if completes {
                st.decoding.push(request);
            } else {
                st.prefilling.push(request);
            }
        }
    }

    fn admit_new(&self, st: &mut SchedulerState, batch: &mut Batch) {
        while batch.num_requests() < self.config.max_batch_size {
            let Some(idx) = self.pick_waiting(st) else {
                break;
            };
            let request = st.waiting[idx].clone();
            if request.is_finished() {
                let _ = st.waiting.remove(idx);
                continue;
            }

            let context_len = request.prompt_tokens.len() + request.num_generated();
            let remaining_gen = request.params.max_tokens - request.num_generated();
            let reserve_tokens = context_len + remaining_gen;
            let need_blocks = self
                .pager
                .lock()
                .unwrap()
                .config()
                .blocks_for_tokens(reserve_tokens);

            if need_blocks > st.num_free_blocks {
                if self.config.enable_preemption {
                    self.preempt_victims(
                        st,
                        Some(batch),
                        need_blocks,
                        request.priority,
                        Some(&request.id),
                    );
                }
                if need_blocks > st.num_free_blocks {
                    break;
                }
            }

            // Acquire blocks first, then check the token budgets; on
            // failure the fresh allocation goes straight back.
            let seq_id = st.next_sequence_id;
            st.next_sequence_id += 1;
            {
                let mut pager = self.pager.lock().unwrap();
                pager.create_sequence(seq_id);
                if !pager.allocate_blocks_for_sequence(seq_id, reserve_tokens) {
                    pager.delete_sequence(seq_id);
                    break;
                }
            }
            st.num_free_blocks -= need_blocks;

            let chunk = self.chunk_budget(batch, context_len);
            if chunk == 0 {
                let freed = self.pager.lock().unwrap().delete_sequence(seq_id);
                st.num_free_blocks += freed;
                break;
            }

            let _ = st.waiting.remove(idx);
            request.assign_sequence(seq_id);
            request.set_status(RequestStatus::Prefilling);
            let completes = chunk == context_len;
            batch.total_tokens += chunk;
            batch.prefill_tokens += chunk;
            batch.prefill.push(PrefillEntry {
                request: request.clone(),
                start: 0,
                len: chunk,
                completes,
            });
            debug!(
                request_id = %request.id,
                sequence_id = seq_id,
                blocks = need_blocks,
                chunk,
                "request admitted"
            );
            if completes {
                st.decoding.push(request);
            } else {
                st.prefilling.push(request);
            }
        }
    }

    /// Largest prefill chunk the budgets still allow for this batch.
    fn chunk_budget(&self, batch: &Batch, remaining: usize) -> usize {
        let mut chunk = remaining;
        if self.config.enable_chunked_prefill {
            chunk = chunk.min(self.config.max_prefill_chunk_size);
        }
        chunk = chunk.min(
            self.config
                .max_prefill_tokens
                .saturating_sub(batch.prefill_tokens),
        );
        chunk = chunk.min(
            self.config
                .max_batch_tokens
                .saturating_sub(batch.total_tokens),
        );
        if !self.config.enable_chunked_prefill && chunk < remaining {
            // Whole-prompt admission only.
            return 0;
        }
        chunk
    }

    /// Index of the next admissible waiting request: FIFO front, or the
    /// earliest highest-priority entry under priority scheduling.
    fn pick_waiting(&self, st: &SchedulerState) -> Option<usize> {
        if st.waiting.is_empty() {
            return None;
        }
        if !self.config.enable_priority_scheduling {
            return Some(0);
        }
        let mut best = 0;
        for (i, request) in st.waiting.iter().enumerate().skip(1) {
            if request.priority > st.waiting[best].priority {
                best = i;
            }
        }
        Some(best)
    }

    /// Release decoding victims until `target_free` blocks are free or
    /// candidates run out. Victims must be strictly lower priority than
    /// the admitting request, have generated at least
    /// `min_decode_steps_before_preempt` tokens, and are taken lowest
    /// priority first, most progress first among ties. Returns the number
    /// of requests preempted.
    fn preempt_victims(
        &self,
        st: &mut SchedulerState,
        mut batch: Option<&mut Batch>,
        target_free: usize,
        admit_priority: u8,
        skip_id: Option<&str>,
    ) -> usize {
        let mut candidates: Vec<Arc<Request>> = st
            .decoding
            .iter()
            .filter(|r| {
                !r.is_finished()
                    && r.priority < admit_priority
                    && r.num_generated() >= self.config.min_decode_steps_before_preempt
                    && Some(r.id.as_str()) != skip_id
            })
            .cloned()
            .collect();
        candidates.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(b.num_generated().cmp(&a.num_generated()))
        });

        let mut preempted = 0;
        for victim in candidates {
            if st.num_free_blocks >= target_free {
                break;
            }
            self.release_sequence(st, &victim);
            victim.clear_sequence();
            victim.set_status(RequestStatus::Paused);
            st.decoding.retain(|r| r.id != victim.id);
            if let Some(batch) = batch.as_deref_mut() {
                let before = batch.decode.len();
                batch.decode.retain(|r| r.id != victim.id);
                batch.total_tokens -= before - batch.decode.len();
            }
            st.paused.push_back(victim.clone());
            st.counters.preemptions += 1;
            preempted += 1;
            info!(
                request_id = %victim.id,
                generated = victim.num_generated(),
                "request preempted"
            );
        }
        preempted
    }

    /// Grow `seq_id` to cover `lookahead` more positions. Ok(true) when
    /// capacity is available (possibly without allocating), Ok(false)
    /// when the arena lacks blocks.
    fn try_grow(
        &self,
        st: &mut SchedulerState,
        seq_id: SequenceId,
        lookahead: usize,
    ) -> Result<bool> {
        let mut pager = self.pager.lock().unwrap();
        let seq = pager
            .get_sequence(seq_id)
            .ok_or_else(|| Error::Engine(format!("unknown sequence {seq_id}")))?;
        let target = seq.num_tokens + lookahead;
        let missing = pager
            .config()
            .blocks_for_tokens(target)
            .saturating_sub(seq.blocks.len());
        if missing == 0 {
            return Ok(true);
        }
        if missing > st.num_free_blocks {
            return Ok(false);
        }
        if !pager.allocate_blocks_for_sequence(seq_id, target) {
            return Ok(false);
        }
        st.num_free_blocks -= missing;
        Ok(true)
    }

    fn release_sequence(&self, st: &mut SchedulerState, request: &Arc<Request>) {
        if let Some(seq_id) = request.sequence_id() {
            let freed = self.pager.lock().unwrap().delete_sequence(seq_id);
            st.num_free_blocks += freed;
        }
    }

    fn remove_from_queues(st: &mut SchedulerState, id: &str) {
        st.waiting.retain(|r| r.id != id);
        st.prefilling.retain(|r| r.id != id);
        st.decoding.retain(|r| r.id != id);
        st.paused.retain(|r| r.id != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::request::SamplingParams;

    fn test_config() -> EngineCoreConfig {
        EngineCoreConfig {
            max_batch_tokens: 64,
            max_batch_size: 4,
            max_prefill_tokens: 32,
            total_kv_blocks: 16,
            kv_block_size: 4,
            enable_chunked_prefill: false,
            min_decode_steps_before_preempt: 1,
            ..Default::default()
        }
    }

    fn scheduler_with(config: EngineCoreConfig) -> Scheduler {
        let pager = Arc::new(Mutex::new(Pager::new(config.kv_cache_config())));
        Scheduler::new(config, pager, 9999)
    }

    fn request(id: &str, prompt: Vec<TokenId>, max_tokens: usize, priority: u8) -> Arc<Request> {
        Arc::new(Request::new(
            id.into(),
            prompt,
            SamplingParams {
                max_tokens,
                temperature: 0.0,
                ..Default::default()
            },
            priority,
            None,
        ))
    }

    fn assert_conserved(sched: &Scheduler) {
        let pager = sched.pager.lock().unwrap();
        assert_eq!(
            pager.blocks_held() + pager.num_free_blocks(),
            pager.stats().total_blocks
        );
    }

    #[test]
    fn test_submit_rejects_duplicates_and_shutdown() {
        let sched = scheduler_with(test_config());
        sched.submit_request(request("a", vec![1], 4, 0)).unwrap();
        assert!(matches!(
            sched.submit_request(request("a", vec![1], 4, 0)),
            Err(Error::DuplicateRequest(_))
        ));
        sched.shutdown();
        assert!(matches!(
            sched.submit_request(request("b", vec![1], 4, 0)),
            Err(Error::ShuttingDown)
        ));
    }

    #[test]
    fn test_admission_builds_prefill_batch() {
        let sched = scheduler_with(test_config());
        sched
            .submit_request(request("a", vec![1, 2, 3], 4, 0))
            .unwrap();
        let batch = sched.next_batch();
        assert_eq!(batch.prefill.len(), 1);
        assert!(batch.prefill[0].completes);
        assert_eq!(batch.prefill_tokens, 3);
        let req = sched.get_request("a").unwrap();
        assert_eq!(req.status(), RequestStatus::Prefilling);
        assert!(req.sequence_id().is_some());
        assert_conserved(&sched);
    }

    #[test]
    fn test_budget_obedience() {
        let mut config = test_config();
        config.max_prefill_tokens = 4;
        let sched = scheduler_with(config);
        sched
            .submit_request(request("a", vec![1, 2, 3], 2, 0))
            .unwrap();
        sched
            .submit_request(request("b", vec![1, 2, 3], 2, 0))
            .unwrap();
        // Only one 3-token prompt fits under max_prefill_tokens = 4 with
        // whole-prompt admission.
        let batch = sched.next_batch();
        assert_eq!(batch.prefill.len(), 1);
        assert!(batch.prefill_tokens <= 4);
        assert_conserved(&sched);
    }

    #[test]
    fn test_decode_follows_prefill() {
        let sched = scheduler_with(test_config());
        sched
            .submit_request(request("a", vec![1, 2, 3], 4, 0))
            .unwrap();
        sched.next_batch();
        let req = sched.get_request("a").unwrap();
        req.add_generated_token(4, sched.eos_token_id());
        req.set_status(RequestStatus::Decoding);

        let batch = sched.next_batch();
        assert_eq!(batch.decode.len(), 1);
        assert_eq!(batch.total_tokens, 1);
    }

    #[test]
    fn test_stop_token_retires_request() {
        let sched = scheduler_with(test_config());
        let mut params = SamplingParams {
            max_tokens: 8,
            temperature: 0.0,
            ..Default::default()
        };
        params.stop_token_ids.insert(6);
        let req = Arc::new(Request::new("a".into(), vec![1, 2], params, 0, None));
        sched.submit_request(req.clone()).unwrap();
        sched.next_batch();
        req.add_generated_token(6, sched.eos_token_id());
        req.set_status(RequestStatus::Decoding);

        let batch = sched.next_batch();
        assert!(batch.is_empty());
        assert_eq!(req.status(), RequestStatus::Completed);
        assert_eq!(req.finish_reason(), Some(FinishReason::Stop));
        // All blocks back in the arena.
        assert_eq!(sched.kv_stats().free_blocks, 16);
        assert_conserved(&sched);
    }

    #[test]
    fn test_cancel_releases_blocks_and_is_idempotent() {
        let sched = scheduler_with(test_config());
        sched
            .submit_request(request("a", vec![1, 2, 3], 4, 0))
            .unwrap();
        sched.next_batch();
        assert!(sched.cancel_request("a"));
        assert!(!sched.cancel_request("a"));
        let req = sched.get_request("a").unwrap();
        assert_eq!(req.status(), RequestStatus::Completed);
        assert_eq!(req.finish_reason(), Some(FinishReason::Cancelled));
        assert_eq!(sched.kv_stats().free_blocks, 16);
        assert_conserved(&sched);
    }

    #[test]
    fn test_preemption_frees_blocks_for_higher_priority() {
        let mut config = test_config();
        // Room for exactly one resident request: 2 blocks of 4 tokens.
        config.total_kv_blocks = 2;
        config.kv_block_size = 4;
        let sched = scheduler_with(config);

        sched
            .submit_request(request("low", vec![1, 2, 3, 4], 4, 0))
            .unwrap();
        let batch = sched.next_batch();
        assert_eq!(batch.prefill.len(), 1);
        let low = sched.get_request("low").unwrap();
        low.set_status(RequestStatus::Decoding);
        low.add_generated_token(5, sched.eos_token_id());

        sched
            .submit_request(request("high", vec![1, 2, 3, 4], 4, 1))
            .unwrap();
        let batch = sched.next_batch();
        // The low-priority request was evicted to admit the high one.
        assert_eq!(batch.prefill.len(), 1);
        assert_eq!(batch.prefill[0].request.id, "high");
        assert_eq!(low.status(), RequestStatus::Paused);
        assert!(low.sequence_id().is_none());
        assert_eq!(sched.stats().preemptions, 1);
        assert_conserved(&sched);

        // The paused request keeps its generated tokens for re-prefill.
        assert_eq!(low.generated_tokens(), vec![5]);
    }

    #[test]
    fn test_paused_request_resumes_after_capacity_returns() {
        let mut config = test_config();
        config.total_kv_blocks = 2;
        config.kv_block_size = 4;
        let sched = scheduler_with(config);

        sched
            .submit_request(request("low", vec![1, 2, 3, 4], 4, 0))
            .unwrap();
        sched.next_batch();
        let low = sched.get_request("low").unwrap();
        low.set_status(RequestStatus::Decoding);
        low.add_generated_token(5, sched.eos_token_id());

        sched
            .submit_request(request("high", vec![1, 2, 3, 4], 4, 1))
            .unwrap();
        sched.next_batch();
        assert_eq!(low.status(), RequestStatus::Paused);

        // Finish the high-priority request, freeing its blocks.
        assert!(sched.cancel_request("high"));

        // The paused request re-admits from the front of the queue and
        // re-prefills its whole context (prompt + generated token).
        let batch = sched.next_batch();
        assert_eq!(batch.prefill.len(), 1);
        assert_eq!(batch.prefill[0].request.id, "low");
        assert_eq!(batch.prefill[0].len, 5);
        assert_eq!(low.status(), RequestStatus::Prefilling);
        assert_conserved(&sched);
    }

    #[test]
    fn test_preemption_respects_min_decode_steps() {
        let mut config = test_config();
        config.total_kv_blocks = 2;
        config.kv_block_size = 4;
        config.min_decode_steps_before_preempt = 3;
        let sched = scheduler_with(config);

        sched
            .submit_request(request("low", vec![1, 2, 3, 4], 4, 0))
            .unwrap();
        sched.next_batch();
        let low = sched.get_request("low").unwrap();
        low.set_status(RequestStatus::Decoding);
        low.add_generated_token(5, sched.eos_token_id());

        sched
            .submit_request(request("high", vec![1, 2, 3, 4], 4, 1))
            .unwrap();
        let batch = sched.next_batch();
        // One generated token < 3: the victim is protected, the
        // high-priority request stays queued.
        assert!(batch.prefill.is_empty());
        assert_eq!(low.status(), RequestStatus::Decoding);
        assert_eq!(sched.stats().waiting, 1);
        assert_conserved(&sched);
    }

    #[test]
    fn test_chunked_prefill_spans_batches() {
        let mut config = test_config();
        config.enable_chunked_prefill = true;
        config.max_prefill_chunk_size = 4;
        let sched = scheduler_with(config);

        let prompt: Vec<TokenId> = (1..=10).collect();
        sched.submit_request(request("a", prompt, 4, 0)).unwrap();

        let batch = sched.next_batch();
        assert_eq!(batch.prefill.len(), 1);
        assert_eq!(batch.prefill[0].len, 4);
        assert!(!batch.prefill[0].completes);
        let req = sched.get_request("a").unwrap();
        req.advance_computed_tokens(4);

        let batch = sched.next_batch();
        assert_eq!(batch.prefill[0].start, 4);
        assert_eq!(batch.prefill[0].len, 4);
        req.advance_computed_tokens(4);

        let batch = sched.next_batch();
        assert_eq!(batch.prefill[0].start, 8);
        assert_eq!(batch.prefill[0].len, 2);
        assert!(batch.prefill[0].completes);
        assert_conserved(&sched);
    }

    #[test]
    fn test_shutdown_cancels_everything() {
        let sched = scheduler_with(test_config());
        sched
            .submit_request(request("a", vec![1, 2, 3], 4, 0))
            .unwrap();
        sched
            .submit_request(request("b", vec![1, 2, 3], 4, 0))
            .unwrap();
        sched.next_batch();
        sched.shutdown();

        for id in ["a", "b"] {
            let req = sched.get_request(id).unwrap();
            assert_eq!(req.status(), RequestStatus::Completed);
            assert_eq!(req.finish_reason(), Some(FinishReason::Cancelled));
        }
        assert_eq!(sched.kv_stats().free_blocks, 16);
        assert!(sched.next_batch().is_empty());
    }

    #[test]
    fn test_ensure_decode_capacity_grows_lazily() {
        let mut config = test_config();
        config.total_kv_blocks = 4;
        let sched = scheduler_with(config);
        sched
            .submit_request(request("a", vec![1, 2, 3, 4], 4, 0))
            .unwrap();
        sched.next_batch();
        let req = sched.get_request("a").unwrap();
        // Admission reserved ceil(8 / 4) = 2 blocks; growth inside the
        // reservation is a no-op.
        assert!(sched.ensure_decode_capacity(&req, 1).is_ok());
        assert_conserved(&sched);
    }
}
