//! End-to-end engine tests against deterministic stub executors.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use neno_core::engine::{
    EngineCore, EngineCoreConfig, FinishReason, ModelExecutor, RequestStatus, SamplingParams,
    Sequence, TokenId,
};
use neno_core::Result;

const VOCAB: usize = 256;
const EOS: TokenId = 255;

/// Deterministic stub: the argmax of every returned row is
/// `input token + 1`. An optional per-call delay widens scheduling
/// windows for the preemption scenario.
struct NextTokenExecutor {
    delay: Duration,
    calls: AtomicUsize,
}

impl NextTokenExecutor {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: AtomicUsize::new(0),
        }
    }
}

impl ModelExecutor for NextTokenExecutor {
    fn forward(
        &self,
        tokens: &[TokenId],
        _start_pos: usize,
        _seq: &Sequence,
    ) -> Result<Vec<neno_core::engine::Logits>> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        Ok(tokens
            .iter()
            .map(|&t| {
                let mut row = vec![0.0f32; VOCAB];
                row[((t + 1) as usize) % VOCAB] = 1.0;
                row
            })
            .collect())
    }

    fn eos_token_id(&self) -> TokenId {
        EOS
    }

    fn vocab_size(&self) -> usize {
        VOCAB
    }
}

fn small_config() -> EngineCoreConfig {
    EngineCoreConfig {
        max_batch_tokens: 128,
        max_batch_size: 8,
        max_prefill_tokens: 64,
        total_kv_blocks: 32,
        kv_block_size: 4,
        enable_chunked_prefill: false,
        min_decode_steps_before_preempt: 1,
        num_layers: 1,
        num_kv_heads: 1,
        head_dim: 8,
        ..Default::default()
    }
}

fn core_with(config: EngineCoreConfig, delay: Duration) -> EngineCore {
    EngineCore::new(
        config,
        Arc::new(NextTokenExecutor::new(delay)),
        None,
        None,
    )
    .unwrap()
}

fn greedy(max_tokens: usize) -> SamplingParams {
    SamplingParams {
        temperature: 0.0,
        max_tokens,
        ..Default::default()
    }
}

fn wait_for<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    false
}

#[test]
fn test_single_prompt_greedy_runs_to_length() {
    let core = core_with(small_config(), Duration::ZERO);
    let id = core
        .submit(vec![1, 2, 3], greedy(5), 0, None)
        .unwrap();

    assert!(wait_for(
        || core
            .get_request(&id)
            .is_some_and(|r| r.status.is_finished()),
        Duration::from_secs(2),
    ));
    let snapshot = core.get_request(&id).unwrap();
    assert_eq!(snapshot.generated_tokens, vec![4, 5, 6, 7, 8]);
    assert_eq!(snapshot.finish_reason, Some(FinishReason::Length));
    assert_eq!(snapshot.status, RequestStatus::Completed);
}

#[test]
fn test_stop_token_cuts_generation() {
    let core = core_with(small_config(), Duration::ZERO);
    let mut params = greedy(5);
    params.stop_token_ids.insert(6);
    let id = core.submit(vec![1, 2, 3], params, 0, None).unwrap();

    assert!(wait_for(
        || core
            .get_request(&id)
            .is_some_and(|r| r.status.is_finished()),
        Duration::from_secs(2),
    ));
    let snapshot = core.get_request(&id).unwrap();
    assert_eq!(snapshot.generated_tokens, vec![4, 5, 6]);
    assert_eq!(snapshot.finish_reason, Some(FinishReason::Stop));
}

#[test]
fn test_streaming_callbacks_are_ordered_with_terminal_flag() {
    let core = core_with(small_config(), Duration::ZERO);
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink_events = events.clone();
    let id = core
        .submit(
            vec![10],
            greedy(4),
            0,
            Some(Box::new(move |token: TokenId, finished: bool| {
                sink_events.lock().unwrap().push((token, finished));
            })),
        )
        .unwrap();

    assert!(wait_for(
        || core
            .get_request(&id)
            .is_some_and(|r| r.status.is_finished()),
        Duration::from_secs(2),
    ));
    let events = events.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![(11, false), (12, false), (13, false), (14, true)]
    );
}

#[test]
fn test_cancel_mid_flight() {
    // Slow decode keeps the request in flight while we cancel it.
    let core = core_with(small_config(), Duration::from_millis(5));
    let (first_token_tx, first_token_rx) = mpsc::channel();
    let id = core
        .submit(
            vec![1, 2, 3],
            greedy(100),
            0,
            Some(Box::new(move |token: TokenId, _finished: bool| {
                let _ = first_token_tx.send(token);
            })),
        )
        .unwrap();

    // Wait for the first streamed token, then cancel.
    first_token_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("no first token");
    assert!(core.cancel(&id));

    let snapshot = core.get_request(&id).unwrap();
    assert_eq!(snapshot.status, RequestStatus::Completed);
    assert_eq!(snapshot.finish_reason, Some(FinishReason::Cancelled));

    // Cancellation is idempotent and the blocks are back.
    assert!(!core.cancel(&id));
    assert!(wait_for(
        || core.stats().kv_cache.free_blocks == core.stats().kv_cache.total_blocks,
        Duration::from_secs(2),
    ));
}

#[test]
fn test_preemption_and_resume() {
    let config = EngineCoreConfig {
        total_kv_blocks: 2,
        kv_block_size: 4,
        enable_priority_scheduling: true,
        ..small_config()
    };
    let core = core_with(config, Duration::from_millis(10));

    let id_a = core.submit(vec![1, 2, 3, 4], greedy(4), 0, None).unwrap();
    // Let A produce at least one token before the contender arrives.
    assert!(wait_for(
        || core
            .get_request(&id_a)
            .is_some_and(|r| !r.generated_tokens.is_empty()),
        Duration::from_secs(2),
    ));

    let id_b = core.submit(vec![1, 2, 3, 4], greedy(4), 1, None).unwrap();

    for id in [&id_b, &id_a] {
        assert!(
            wait_for(
                || core
                    .get_request(id)
                    .is_some_and(|r| r.status.is_finished()),
                Duration::from_secs(5),
            ),
            "request {id} did not finish"
        );
        let snapshot = core.get_request(id).unwrap();
        assert_eq!(snapshot.status, RequestStatus::Completed);
        assert_eq!(snapshot.finish_reason, Some(FinishReason::Length));
        assert_eq!(snapshot.generated_tokens, vec![5, 6, 7, 8]);
    }

    let stats = core.stats();
    assert!(stats.scheduler.preemptions >= 1, "A was never preempted");
    assert_eq!(stats.kv_cache.free_blocks, stats.kv_cache.total_blocks);
}

#[test]
fn test_concurrent_requests_all_complete() {
    let core = Arc::new(core_with(small_config(), Duration::ZERO));
    let ids: Vec<_> = (0..6)
        .map(|i| {
            core.submit(vec![i as TokenId + 1, i as TokenId + 2], greedy(4), 0, None)
                .unwrap()
        })
        .collect();

    for id in &ids {
        assert!(wait_for(
            || core
                .get_request(id)
                .is_some_and(|r| r.status == RequestStatus::Completed),
            Duration::from_secs(5),
        ));
    }
    let stats = core.stats();
    assert_eq!(stats.scheduler.completed, 6);
    assert_eq!(stats.kv_cache.free_blocks, stats.kv_cache.total_blocks);
}

#[test]
fn test_chunked_prefill_end_to_end() {
    let config = EngineCoreConfig {
        enable_chunked_prefill: true,
        max_prefill_chunk_size: 4,
        ..small_config()
    };
    let core = core_with(config, Duration::ZERO);
    let prompt: Vec<TokenId> = (1..=11).collect();
    let id = core.submit(prompt, greedy(3), 0, None).unwrap();

    assert!(wait_for(
        || core
            .get_request(&id)
            .is_some_and(|r| r.status.is_finished()),
        Duration::from_secs(2),
    ));
    let snapshot = core.get_request(&id).unwrap();
    // Last prompt token is 11, so greedy continuation is 12, 13, 14.
    assert_eq!(snapshot.generated_tokens, vec![12, 13, 14]);
    assert_eq!(snapshot.finish_reason, Some(FinishReason::Length));
}

#[test]
fn test_duplicate_id_and_shutdown_rejections() {
    let core = core_with(small_config(), Duration::ZERO);
    core.submit_with_id("dup".into(), vec![1], greedy(2), 0, None)
        .unwrap();
    assert!(matches!(
        core.submit_with_id("dup".into(), vec![1], greedy(2), 0, None),
        Err(neno_core::Error::DuplicateRequest(_))
    ));

    core.shutdown();
    assert!(matches!(
        core.submit(vec![1], greedy(2), 0, None),
        Err(neno_core::Error::ShuttingDown)
    ));
}

#[test]
fn test_invalid_params_rejected_at_submission() {
    let core = core_with(small_config(), Duration::ZERO);
    let params = SamplingParams {
        top_p: 1.5,
        ..Default::default()
    };
    assert!(matches!(
        core.submit(vec![1], params, 0, None),
        Err(neno_core::Error::InvalidParams(_))
    ));
}

#[test]
fn test_speculative_end_to_end_matches_plain_decoding() {
    // Draft and target share the same deterministic rule, so every
    // proposal is accepted and the output must equal plain greedy
    // decoding.
    let config = EngineCoreConfig {
        enable_speculative: true,
        speculation_length: 3,
        ..small_config()
    };
    let core = EngineCore::new(
        config,
        Arc::new(NextTokenExecutor::new(Duration::ZERO)),
        Some(Arc::new(NextTokenExecutor::new(Duration::ZERO))),
        None,
    )
    .unwrap();

    let id = core.submit(vec![1, 2, 3], greedy(8), 0, None).unwrap();
    assert!(wait_for(
        || core
            .get_request(&id)
            .is_some_and(|r| r.status.is_finished()),
        Duration::from_secs(2),
    ));
    let snapshot = core.get_request(&id).unwrap();
    assert_eq!(
        snapshot.generated_tokens,
        vec![4, 5, 6, 7, 8, 9, 10, 11]
    );
    assert_eq!(snapshot.finish_reason, Some(FinishReason::Length));

    let stats = core.stats();
    let spec = stats.speculation.expect("speculation stats missing");
    assert!(spec.attempts >= 1);
    assert!(spec.accepted >= 1);
    assert!(spec.tokens_per_attempt > 1.0);
}
