//! The engine worker: a blocking thread that pulls batches from the
//! scheduler and drives the model.
//!
//! Engine invocations are blocking by nature (device kernels), so the
//! worker is a plain OS thread. Errors are caught per request and never
//! propagate out of the loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::error::Error;

use super::executor::Engine;
use super::request::{Request, TokenAppend};
use super::scheduler::{Batch, PrefillEntry, Scheduler};
use super::speculative::SpeculativeEngine;
use super::types::RequestStatus;

pub struct Worker {
    scheduler: Arc<Scheduler>,
    engine: Arc<Engine>,
    speculative: Option<Arc<SpeculativeEngine>>,
}

/// Join handle for a spawned worker. Dropping without `shutdown` leaves
/// the thread running.
pub struct WorkerHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Stop the loop at the next iteration boundary and join the thread.
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Worker {
    pub fn new(
        scheduler: Arc<Scheduler>,
        engine: Arc<Engine>,
        speculative: Option<Arc<SpeculativeEngine>>,
    ) -> Self {
        Self {
            scheduler,
            engine,
            speculative,
        }
    }

    /// Spawn the worker loop on a dedicated thread.
    pub fn spawn(self) -> WorkerHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let thread = std::thread::Builder::new()
            .name("neno-worker".into())
            .spawn(move || {
                info!("worker started");
                while !stop_flag.load(Ordering::Relaxed) {
                    if !self.step() {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                }
                info!("worker stopped");
            })
            .expect("failed to spawn worker thread");
        WorkerHandle {
            stop,
            thread: Some(thread),
        }
    }

    /// Pull and execute one batch. Returns `false` when there was no
    /// work, signalling the loop to sleep briefly.
    pub fn step(&self) -> bool {
        let batch = self.scheduler.next_batch();
        if batch.is_empty() {
            return false;
        }
        for entry in &batch.prefill {
            self.run_prefill(entry);
        }
        for request in &batch.decode {
            self.run_decode(request);
        }
        self.scheduler.complete_batch(&batch);
        self.release_finished(&batch);
        true
    }

    fn run_prefill(&self, entry: &PrefillEntry) {
        let request = &entry.request;
        if request.is_finished() {
            return;
        }
        let Some(seq_id) = request.sequence_id() else {
            return;
        };

        let context = request.context_tokens();
        let chunk = &context[entry.start..entry.start + entry.len];
        let logits = match self.engine.prefill_chunk(chunk, entry.start, seq_id) {
            Ok(logits) => logits,
            Err(err) => {
                self.handle_engine_error(request, err, "prefill");
                return;
            }
        };
        request.advance_computed_tokens(entry.len);

        if entry.completes {
            let token = request.with_rng(|rng| {
                self.engine.sample(&logits, &context, &request.params, rng)
            });
            request.add_generated_token(token, self.scheduler.eos_token_id());
            if !request.is_finished() {
                request.set_status(RequestStatus::Decoding);
            }
            debug!(request_id = %request.id, token, "prefill complete");
        }
    }

    fn run_decode(&self, request: &Arc<Request>) {
        if request.is_finished() {
            return;
        }
        let remaining = request
            .params
            .max_tokens
            .saturating_sub(request.num_generated());
        if remaining == 0 {
            return;
        }

        if let Some(spec) = &self.speculative {
            if spec.should_speculate() {
                match spec.speculate(request, remaining) {
                    Ok(result) if result.total_tokens() > 0 => {
                        let eos = self.scheduler.eos_token_id();
                        for token in result
                            .accepted
                            .iter()
                            .copied()
                            .chain(result.bonus_token)
                        {
                            match request.add_generated_token(token, eos) {
                                TokenAppend::Appended(None) => {}
                                // Terminal token or concurrent finish:
                                // later tokens are dropped.
                                TokenAppend::Appended(Some(_)) | TokenAppend::Dropped => break,
                            }
                        }
                        return;
                    }
                    // Nothing accepted: fall through to a plain decode
                    // step so the request still makes progress.
                    Ok(_) => {}
                    // Draft arena is full; decode normally this step.
                    Err(Error::ResourceExhausted) => {}
                    Err(err) => {
                        self.handle_engine_error(request, err, "speculate");
                        return;
                    }
                }
            }
        }

        if let Err(err) = self.scheduler.ensure_decode_capacity(request, 1) {
            self.handle_engine_error(request, err, "decode growth");
            return;
        }
        let Some(seq_id) = request.sequence_id() else {
            return;
        };

        let logits = match self.engine.decode_step(request.last_token(), seq_id) {
            Ok(logits) => logits,
            Err(err) => {
                self.handle_engine_error(request, err, "decode");
                return;
            }
        };
        let prior = request.context_tokens();
        let token =
            request.with_rng(|rng| self.engine.sample(&logits, &prior, &request.params, rng));
        request.add_generated_token(token, self.scheduler.eos_token_id());
    }

    /// A request that finished mid-batch (stop token, cancel) leaves a
    /// draft mirror behind; drop it eagerly.
    fn release_finished(&self, batch: &Batch) {
        let Some(spec) = &self.speculative else {
            return;
        };
        for request in &batch.decode {
            if request.is_finished() {
                if let Some(seq_id) = request.sequence_id() {
                    spec.release(seq_id);
                }
            }
        }
    }

    /// Per-request error handling. A request that finished concurrently
    /// (cancellation mid-step) swallows the error; invariant violations
    /// have already been logged by the layer that detected them.
    fn handle_engine_error(&self, request: &Arc<Request>, err: Error, stage: &str) {
        if request.is_finished() {
            debug!(request_id = %request.id, stage, "step raced a finished request");
            return;
        }
        error!(request_id = %request.id, stage, error = %err, "engine step failed");
        self.scheduler.fail_request(request, &err.to_string());
    }
}
