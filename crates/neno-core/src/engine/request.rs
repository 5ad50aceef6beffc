//! Request lifecycle types: sampling parameters, the shared request
//! object, and the streaming token sink.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::types::{FinishReason, Priority, RequestId, RequestStatus, SequenceId, TokenId};

/// Sampling parameters for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Softmax temperature; 0 selects the argmax.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Nucleus threshold in (0, 1].
    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// Keep the k highest logits; 0 disables the filter.
    #[serde(default)]
    pub top_k: usize,

    /// Penalty >= 1 applied to previously seen tokens.
    #[serde(default = "default_repetition_penalty")]
    pub repetition_penalty: f32,

    /// Upper bound on generated tokens.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Token ids that end generation when emitted.
    #[serde(default)]
    pub stop_token_ids: HashSet<TokenId>,

    /// Seed for reproducible sampling.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: 0,
            repetition_penalty: default_repetition_penalty(),
            max_tokens: default_max_tokens(),
            stop_token_ids: HashSet::new(),
            seed: None,
        }
    }
}

impl SamplingParams {
    /// Range-check every field; surfaced to the caller on submission.
    pub fn validate(&self) -> Result<()> {
        if self.temperature < 0.0 || !self.temperature.is_finite() {
            return Err(Error::InvalidParams(format!(
                "temperature must be >= 0, got {}",
                self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(Error::InvalidParams(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        if self.repetition_penalty < 1.0 {
            return Err(Error::InvalidParams(format!(
                "repetition_penalty must be >= 1, got {}",
                self.repetition_penalty
            )));
        }
        if self.max_tokens == 0 {
            return Err(Error::InvalidParams("max_tokens must be >= 1".into()));
        }
        Ok(())
    }
}

fn default_temperature() -> f32 {
    1.0
}

fn default_top_p() -> f32 {
    1.0
}

fn default_repetition_penalty() -> f32 {
    1.0
}

fn default_max_tokens() -> usize {
    256
}

/// Streaming capability handed in at submission. `on_token` fires on the
/// worker thread and must not block; dropping the sink is the terminal
/// signal for finishes that carry no token (cancel, error).
pub trait TokenSink: Send {
    fn on_token(&self, token: TokenId, finished: bool);
}

impl<F> TokenSink for F
where
    F: Fn(TokenId, bool) + Send,
{
    fn on_token(&self, token: TokenId, finished: bool) {
        self(token, finished)
    }
}

/// Token event emitted through a [`channel_sink`].
pub type TokenEvent = (TokenId, bool);

/// A sink backed by an unbounded channel, for async consumers (the HTTP
/// frontends). The worker-side send never blocks; the channel closes
/// when the request finishes and the sink is dropped.
pub fn channel_sink() -> (
    Box<dyn TokenSink>,
    tokio::sync::mpsc::UnboundedReceiver<TokenEvent>,
) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let sink = move |token: TokenId, finished: bool| {
        let _ = tx.send((token, finished));
    };
    (Box::new(sink), rx)
}

/// Outcome of appending a sampled token to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenAppend {
    /// Token recorded and streamed; `Some` when it ends the request.
    Appended(Option<FinishReason>),
    /// The request finished concurrently; the token was discarded.
    Dropped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSnapshot {
    pub id: RequestId,
    pub status: RequestStatus,
    pub num_prompt_tokens: usize,
    pub generated_tokens: Vec<TokenId>,
    pub finish_reason: Option<FinishReason>,
    pub error_message: Option<String>,
    pub time_to_first_token_ms: Option<u64>,
    pub total_time_ms: Option<u64>,
}

struct RequestState {
    status: RequestStatus,
    sequence_id: Option<SequenceId>,
    generated: Vec<TokenId>,
    /// Context positions already written to the KV cache; drives chunked
    /// prefill continuation and is reset on preemption.
    num_computed_tokens: usize,
    finish_reason: Option<FinishReason>,
    error_message: Option<String>,
    first_token_at: Option<Instant>,
    finished_at: Option<Instant>,
    rng: StdRng,
}

/// One unit of work. Shared by the scheduler, the worker (through the
/// batch), and the frontend; the header is immutable and the mutable
/// state sits behind an internal lock.
pub struct Request {
    pub id: RequestId,
    pub prompt_tokens: Vec<TokenId>,
    pub params: SamplingParams,
    pub priority: Priority,
    pub arrived_at: Instant,
    state: Mutex<RequestState>,
    sink: Mutex<Option<Box<dyn TokenSink>>>,
}

impl Request {
    pub fn new(
        id: RequestId,
        prompt_tokens: Vec<TokenId>,
        params: SamplingParams,
        priority: Priority,
        sink: Option<Box<dyn TokenSink>>,
    ) -> Self {
        let rng = match params.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            id,
            prompt_tokens,
            params,
            priority,
            arrived_at: Instant::now(),
            state: Mutex::new(RequestState {
                status: RequestStatus::Waiting,
                sequence_id: None,
                generated: Vec::new(),
                num_computed_tokens: 0,
                finish_reason: None,
                error_message: None,
                first_token_at: None,
                finished_at: None,
                rng,
            }),
            sink: Mutex::new(sink),
        }
    }

    pub fn status(&self) -> RequestStatus {
        self.state.lock().unwrap().status
    }

    pub fn set_status(&self, status: RequestStatus) {
        self.state.lock().unwrap().status = status;
    }

    pub fn is_finished(&self) -> bool {
        self.status().is_finished()
    }

    pub fn sequence_id(&self) -> Option<SequenceId> {
        self.state.lock().unwrap().sequence_id
    }

    pub fn assign_sequence(&self, id: SequenceId) {
        self.state.lock().unwrap().sequence_id = Some(id);
    }

    /// Drop the sequence binding and forget prefill progress. Used on
    /// preemption; the token ids stay intact for re-prefill.
    pub fn clear_sequence(&self) {
        let mut state = self.state.lock().unwrap();
        state.sequence_id = None;
        state.num_computed_tokens = 0;
    }

    pub fn num_generated(&self) -> usize {
        self.state.lock().unwrap().generated.len()
    }

    pub fn generated_tokens(&self) -> Vec<TokenId> {
        self.state.lock().unwrap().generated.clone()
    }

    /// Prompt plus generated tokens, the full logical context.
    pub fn context_tokens(&self) -> Vec<TokenId> {
        let state = self.state.lock().unwrap();
        let mut tokens = self.prompt_tokens.clone();
        tokens.extend_from_slice(&state.generated);
        tokens
    }

    /// The newest token, the decode-step input.
    pub fn last_token(&self) -> TokenId {
        let state = self.state.lock().unwrap();
        state
            .generated
            .last()
            .copied()
            .or_else(|| self.prompt_tokens.last().copied())
            .unwrap_or(0)
    }

    pub fn num_computed_tokens(&self) -> usize {
        self.state.lock().unwrap().num_computed_tokens
    }

    pub fn advance_computed_tokens(&self, n: usize) {
        self.state.lock().unwrap().num_computed_tokens += n;
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.state.lock().unwrap().finish_reason
    }

    pub fn error_message(&self) -> Option<String> {
        self.state.lock().unwrap().error_message.clone()
    }

    /// Sample with the request's own RNG, keeping seeded runs reproducible.
    pub fn with_rng<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state.rng)
    }

    /// Stop condition after the last emitted token: stop set, EOS, or
    /// length, in that precedence.
    pub fn should_stop(&self, eos_token_id: TokenId) -> Option<FinishReason> {
        let state = self.state.lock().unwrap();
        if let Some(reason) = state.finish_reason {
            return Some(reason);
        }
        if let Some(&last) = state.generated.last() {
            if self.params.stop_token_ids.contains(&last) {
                return Some(FinishReason::Stop);
            }
            if last == eos_token_id {
                return Some(FinishReason::Eos);
            }
        }
        if state.generated.len() >= self.params.max_tokens {
            return Some(FinishReason::Length);
        }
        None
    }

    /// Append a sampled token and fire the streaming callback.
    ///
    /// Tolerates the request having finished concurrently (cancellation
    /// mid-step): the token is dropped without error. The callback runs
    /// outside the state lock.
    pub fn add_generated_token(&self, token: TokenId, eos_token_id: TokenId) -> TokenAppend {
        let finished = {
            let mut state = self.state.lock().unwrap();
            if state.status.is_finished() {
                return TokenAppend::Dropped;
            }
            if state.first_token_at.is_none() {
                state.first_token_at = Some(Instant::now());
            }
            state.generated.push(token);

            let reason = if self.params.stop_token_ids.contains(&token) {
                Some(FinishReason::Stop)
            } else if token == eos_token_id {
                Some(FinishReason::Eos)
            } else if state.generated.len() >= self.params.max_tokens {
                Some(FinishReason::Length)
            } else {
                None
            };
            if let Some(reason) = reason {
                state.finish_reason = Some(reason);
            }
            reason
        };

        let mut sink = self.sink.lock().unwrap();
        if let Some(s) = sink.as_ref() {
            s.on_token(token, finished.is_some());
        }
        if finished.is_some() {
            // Terminal event delivered; release the sink.
            *sink = None;
        }
        TokenAppend::Appended(finished)
    }

    /// Move to a terminal state. An already-recorded reason wins; the sink
    /// is dropped so token-less finishes still terminate the stream.
    pub fn finish(&self, reason: FinishReason) {
        {
            let mut state = self.state.lock().unwrap();
            if state.status.is_finished() {
                return;
            }
            if state.finish_reason.is_none() {
                state.finish_reason = Some(reason);
            }
            state.status = if matches!(state.finish_reason, Some(FinishReason::Error)) {
                RequestStatus::Failed
            } else {
                RequestStatus::Completed
            };
            state.finished_at = Some(Instant::now());
        }
        *self.sink.lock().unwrap() = None;
    }

    pub fn fail(&self, message: impl Into<String>) {
        self.state.lock().unwrap().error_message = Some(message.into());
        self.finish(FinishReason::Error);
    }

    pub fn snapshot(&self) -> RequestSnapshot {
        let state = self.state.lock().unwrap();
        let millis = |d: Duration| d.as_millis() as u64;
        RequestSnapshot {
            id: self.id.clone(),
            status: state.status,
            num_prompt_tokens: self.prompt_tokens.len(),
            generated_tokens: state.generated.clone(),
            finish_reason: state.finish_reason,
            error_message: state.error_message.clone(),
            time_to_first_token_ms: state
                .first_token_at
                .map(|t| millis(t.duration_since(self.arrived_at))),
            total_time_ms: state
                .finished_at
                .map(|t| millis(t.duration_since(self.arrived_at))),
        }
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("prompt_tokens", &self.prompt_tokens.len())
            .field("priority", &self.priority)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const EOS: TokenId = 99;

    fn request(params: SamplingParams) -> Request {
        Request::new("r1".into(), vec![1, 2, 3], params, 0, None)
    }

    #[test]
    fn test_params_validation() {
        assert!(SamplingParams::default().validate().is_ok());

        let bad = SamplingParams {
            top_p: 0.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let bad = SamplingParams {
            repetition_penalty: 0.5,
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let bad = SamplingParams {
            max_tokens: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_append_until_length() {
        let req = request(SamplingParams {
            max_tokens: 2,
            ..Default::default()
        });
        assert_eq!(req.add_generated_token(10, EOS), TokenAppend::Appended(None));
        assert_eq!(
            req.add_generated_token(11, EOS),
            TokenAppend::Appended(Some(FinishReason::Length))
        );
        assert_eq!(req.should_stop(EOS), Some(FinishReason::Length));
    }

    #[test]
    fn test_stop_token_beats_length() {
        let mut params = SamplingParams {
            max_tokens: 1,
            ..Default::default()
        };
        params.stop_token_ids.insert(42);
        let req = request(params);
        assert_eq!(
            req.add_generated_token(42, EOS),
            TokenAppend::Appended(Some(FinishReason::Stop))
        );
    }

    #[test]
    fn test_token_dropped_after_finish() {
        let req = request(SamplingParams::default());
        req.finish(FinishReason::Cancelled);
        assert_eq!(req.add_generated_token(5, EOS), TokenAppend::Dropped);
        assert_eq!(req.num_generated(), 0);
        assert_eq!(req.status(), RequestStatus::Completed);
        assert_eq!(req.finish_reason(), Some(FinishReason::Cancelled));
    }

    #[test]
    fn test_sink_sees_ordered_tokens_and_terminal_flag() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_by_sink = seen.clone();
        let sink = move |token: TokenId, finished: bool| {
            seen_by_sink.lock().unwrap().push((token, finished));
        };
        let req = Request::new(
            "r2".into(),
            vec![1],
            SamplingParams {
                max_tokens: 3,
                ..Default::default()
            },
            0,
            Some(Box::new(sink)),
        );
        req.add_generated_token(7, EOS);
        req.add_generated_token(8, EOS);
        req.add_generated_token(9, EOS);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(7, false), (8, false), (9, true)]
        );
    }

    #[tokio::test]
    async fn test_channel_sink_closes_on_finish() {
        let (sink, mut rx) = channel_sink();
        let req = Request::new(
            "r4".into(),
            vec![1],
            SamplingParams {
                max_tokens: 2,
                ..Default::default()
            },
            0,
            Some(sink),
        );
        req.add_generated_token(5, EOS);
        req.add_generated_token(6, EOS);
        assert_eq!(rx.recv().await, Some((5, false)));
        assert_eq!(rx.recv().await, Some((6, true)));
        // Sink dropped on finish: the channel is closed.
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn test_finish_is_idempotent_and_keeps_first_reason() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let req = Request::new(
            "r3".into(),
            vec![1],
            SamplingParams::default(),
            0,
            Some(Box::new(move |_t: TokenId, _f: bool| {
                c.fetch_add(1, Ordering::SeqCst);
            })),
        );
        req.finish(FinishReason::Cancelled);
        req.finish(FinishReason::Error);
        assert_eq!(req.finish_reason(), Some(FinishReason::Cancelled));
        assert_eq!(req.status(), RequestStatus::Completed);
        // No token callbacks, only the sink drop.
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
