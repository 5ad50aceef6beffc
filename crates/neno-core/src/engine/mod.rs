//! The inference serving core.
//!
//! Five components, leaves first: the block arena and pager own KV
//! memory; the scheduler packs continuous batches under token,
//! batch-size, and block budgets; the engine adapter drives the external
//! transformer; the worker loop executes batches on a dedicated thread;
//! the optional speculative layer wraps two engines for draft/verify
//! decoding.

mod config;
mod core;
mod executor;
mod kv_cache;
mod metrics;
mod request;
mod sampler;
mod scheduler;
mod speculative;
mod types;
mod worker;

pub use self::core::EngineCore;
pub use config::{DecodePreference, EngineCoreConfig};
pub use executor::{Engine, ModelExecutor};
pub use kv_cache::{BlockArena, KvCacheConfig, KvCacheStats, Pager, Sequence};
pub use metrics::EngineMetrics;
pub use request::{
    channel_sink, Request, RequestSnapshot, SamplingParams, TokenAppend, TokenEvent, TokenSink,
};
pub use sampler::{argmax, sample};
pub use scheduler::{Batch, PrefillEntry, Scheduler, SchedulerStats};
pub use speculative::{SpeculationResult, SpeculativeConfig, SpeculativeEngine, SpeculativeStats};
pub use types::{
    BlockId, FinishReason, Logits, Priority, RequestId, RequestStatus, SequenceId, TokenId,
};
pub use worker::{Worker, WorkerHandle};
