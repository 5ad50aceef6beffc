//! Shared identifier and token types for the engine core.

use serde::{Deserialize, Serialize};

/// Physical index of a KV block inside the arena.
pub type BlockId = usize;

/// Monotonic sequence identifier. Never reused, which rules out ABA
/// hazards across preemption.
pub type SequenceId = i64;

/// Opaque request identifier supplied by (or generated for) the caller.
pub type RequestId = String;

/// Vocabulary token id.
pub type TokenId = u32;

/// Request priority. Higher values are more important.
pub type Priority = u8;

/// Raw logits for a single position, full vocabulary width.
pub type Logits = Vec<f32>;

/// Lifecycle state of a request.
///
/// The main line is `Waiting → Prefilling → Decoding → Completed`;
/// `Paused` (preempted) and `Failed` are side arcs. Cancellation finishes
/// a request as `Completed` with [`FinishReason::Cancelled`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    /// Admitted to the waiting queue, prefill not started.
    Waiting,
    /// Prompt tokens are being processed.
    Prefilling,
    /// Steady-state one-token-per-step generation.
    Decoding,
    /// Preempted; cache blocks released, awaiting re-prefill.
    Paused,
    /// Terminal success state (includes cancellation).
    Completed,
    /// Terminal failure state.
    Failed,
}

impl RequestStatus {
    /// Whether this is a terminal state.
    pub fn is_finished(&self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Failed)
    }
}

/// Why a request finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishReason {
    /// A configured stop token was emitted.
    Stop,
    /// Reached `max_tokens`.
    Length,
    /// The model emitted its end-of-sequence token.
    Eos,
    /// Cancelled by the caller or by shutdown.
    Cancelled,
    /// An engine error ended the request.
    Error,
}

impl FinishReason {
    /// Wire-format name used by the HTTP frontends.
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::Eos => "stop",
            FinishReason::Cancelled => "cancelled",
            FinishReason::Error => "error",
        }
    }
}
