//! Neno Core - Continuous-Batching LLM Inference Engine
//!
//! This crate provides the serving core of a local LLM runner: it accepts
//! concurrent text-generation requests and drives them through an
//! external transformer executor with bounded memory and predictable
//! latency.
//!
//! # Architecture
//!
//! The engine follows vLLM's architecture patterns with:
//! - Paged KV-cache memory management (block arena + sequence pager)
//! - Continuous batching with chunked prefill and preemption
//! - Streaming token output
//! - Optional draft/verify speculative decoding
//!
//! # Example
//!
//! ```ignore
//! use neno_core::engine::{EngineCore, EngineCoreConfig, SamplingParams};
//!
//! let config = EngineCoreConfig::default();
//! let core = EngineCore::new(config, executor, None, None)?;
//!
//! let id = core.submit(prompt_tokens, SamplingParams::default(), 0, None)?;
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod tokenizer;

pub use engine::{
    Engine, EngineCore, EngineCoreConfig, EngineMetrics, FinishReason, ModelExecutor, Pager,
    Request, RequestSnapshot, RequestStatus, SamplingParams, Scheduler, SpeculativeEngine,
    TokenSink,
};

pub use config::RunnerConfig;
pub use error::{Error, Result};
pub use tokenizer::Tokenizer;
