//! The engine facade: wires the pager, scheduler, worker, and optional
//! speculative layer together behind the request lifecycle API.

use std::sync::{Arc, Mutex};

use tracing::info;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::tokenizer::Tokenizer;

use super::config::EngineCoreConfig;
use super::executor::{Engine, ModelExecutor};
use super::kv_cache::Pager;
use super::metrics::EngineMetrics;
use super::request::{Request, RequestSnapshot, SamplingParams, TokenSink};
use super::scheduler::Scheduler;
use super::speculative::{SpeculativeConfig, SpeculativeEngine};
use super::types::{Priority, RequestId, TokenId};
use super::worker::{Worker, WorkerHandle};

/// One serving engine: a target executor, its KV arena, the scheduler,
/// and a worker thread. Hold it behind an `Arc` and call `submit` /
/// `cancel` from any thread.
pub struct EngineCore {
    config: EngineCoreConfig,
    scheduler: Arc<Scheduler>,
    engine: Arc<Engine>,
    speculative: Option<Arc<SpeculativeEngine>>,
    tokenizer: Option<Arc<Tokenizer>>,
    worker: Mutex<Option<WorkerHandle>>,
}

impl EngineCore {
    /// Build and start an engine. A draft executor enables the
    /// speculative layer when the configuration asks for it; the draft
    /// holds its own disjoint arena.
    pub fn new(
        config: EngineCoreConfig,
        executor: Arc<dyn ModelExecutor>,
        draft_executor: Option<Arc<dyn ModelExecutor>>,
        tokenizer: Option<Arc<Tokenizer>>,
    ) -> Result<Self> {
        config.validate()?;
        let eos_token_id = executor.eos_token_id();

        let pager = Arc::new(Mutex::new(Pager::new(config.kv_cache_config())));
        let engine = Arc::new(Engine::new(executor, pager.clone(), tokenizer.clone()));
        let scheduler = Arc::new(Scheduler::new(config.clone(), pager, eos_token_id));

        let speculative = match (config.enable_speculative, draft_executor) {
            (true, Some(draft)) => {
                let draft_pager = Arc::new(Mutex::new(Pager::new(config.kv_cache_config())));
                let draft_engine = Arc::new(Engine::new(draft, draft_pager, None));
                Some(Arc::new(SpeculativeEngine::new(
                    engine.clone(),
                    draft_engine,
                    SpeculativeConfig::from(&config),
                )))
            }
            (true, None) => {
                return Err(Error::Config(
                    "speculative decoding enabled without a draft executor".into(),
                ))
            }
            _ => None,
        };

        let worker = Worker::new(scheduler.clone(), engine.clone(), speculative.clone()).spawn();
        info!(
            kv_blocks = config.total_kv_blocks,
            block_size = config.kv_block_size,
            speculative = speculative.is_some(),
            "engine core started"
        );

        Ok(Self {
            config,
            scheduler,
            engine,
            speculative,
            tokenizer,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn config(&self) -> &EngineCoreConfig {
        &self.config
    }

    pub fn eos_token_id(&self) -> TokenId {
        self.scheduler.eos_token_id()
    }

    /// Submit pre-tokenized work. Returns the generated request id.
    pub fn submit(
        &self,
        prompt_tokens: Vec<TokenId>,
        params: SamplingParams,
        priority: Priority,
        sink: Option<Box<dyn TokenSink>>,
    ) -> Result<RequestId> {
        let id = Uuid::new_v4().to_string();
        self.submit_with_id(id.clone(), prompt_tokens, params, priority, sink)?;
        Ok(id)
    }

    /// Submit with a caller-chosen id; duplicates are rejected.
    pub fn submit_with_id(
        &self,
        id: RequestId,
        prompt_tokens: Vec<TokenId>,
        params: SamplingParams,
        priority: Priority,
        sink: Option<Box<dyn TokenSink>>,
    ) -> Result<()> {
        let request = Arc::new(Request::new(id, prompt_tokens, params, priority, sink));
        self.scheduler.submit_request(request)
    }

    /// Tokenize and submit a text prompt. Tokenizer failures surface to
    /// the caller; the request is never admitted.
    pub fn submit_text(
        &self,
        prompt: &str,
        params: SamplingParams,
        priority: Priority,
        sink: Option<Box<dyn TokenSink>>,
    ) -> Result<RequestId> {
        let tokens = self.encode(prompt)?;
        self.submit(tokens, params, priority, sink)
    }

    pub fn cancel(&self, id: &str) -> bool {
        self.scheduler.cancel_request(id)
    }

    pub fn get_request(&self, id: &str) -> Option<RequestSnapshot> {
        self.scheduler.get_request(id).map(|r| r.snapshot())
    }

    pub fn stats(&self) -> EngineMetrics {
        EngineMetrics {
            scheduler: self.scheduler.stats(),
            kv_cache: self.scheduler.kv_stats(),
            speculation: self.speculative.as_ref().map(|s| s.stats()),
        }
    }

    pub fn encode(&self, text: &str) -> Result<Vec<TokenId>> {
        self.engine.encode(text)
    }

    pub fn decode(&self, tokens: &[TokenId]) -> Result<String> {
        self.engine.decode(tokens)
    }

    pub fn tokenizer(&self) -> Option<&Arc<Tokenizer>> {
        self.tokenizer.as_ref()
    }

    /// Stop the worker and cancel everything outstanding. Idempotent.
    pub fn shutdown(&self) {
        if let Some(worker) = self.worker.lock().unwrap().take() {
            worker.shutdown();
        }
        self.scheduler.shutdown();
    }
}

impl Drop for EngineCore {
    fn drop(&mut self) {
        self.shutdown();
    }
}
