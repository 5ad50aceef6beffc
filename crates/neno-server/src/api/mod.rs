//! HTTP API: OpenAI- and Ollama-compatible surfaces over the engine.

pub mod ollama;
pub mod openai;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;

use neno_core::engine::{channel_sink, Priority, RequestId, SamplingParams, TokenEvent, TokenId};
use neno_core::EngineCore;

use crate::error::ApiError;
use crate::state::AppState;

pub fn create_router(state: AppState, cors_enabled: bool) -> Router {
    let router = Router::new()
        .route("/health", get(health))
        .route("/v1/chat/completions", post(openai::chat_completions))
        .route("/v1/completions", post(openai::completions))
        .route("/v1/models", get(openai::models))
        .route("/api/generate", post(ollama::generate))
        .route("/api/chat", post(ollama::chat))
        .route("/api/tags", get(ollama::tags))
        .route("/api/version", get(ollama::version))
        .with_state(state);
    if cors_enabled {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

/// Cancels the request when the client goes away mid-stream. Cancelling
/// a finished request is a no-op.
pub(crate) struct CancelOnDrop {
    engine: Arc<EngineCore>,
    id: RequestId,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.engine.cancel(&self.id);
    }
}

/// Submit a text prompt with a channel-backed sink. The unbounded send
/// keeps the worker-side callback non-blocking; the channel closes when
/// the request finishes and the sink is dropped.
pub(crate) fn submit_streaming(
    state: &AppState,
    prompt: &str,
    params: SamplingParams,
    priority: Priority,
) -> Result<
    (
        RequestId,
        mpsc::UnboundedReceiver<TokenEvent>,
        CancelOnDrop,
    ),
    ApiError,
> {
    let (sink, rx) = channel_sink();
    let id = state.engine.submit_text(prompt, params, priority, Some(sink))?;
    let guard = CancelOnDrop {
        engine: state.engine.clone(),
        id: id.clone(),
    };
    Ok((id, rx, guard))
}

/// Drain a request to completion, returning its text and final snapshot.
pub(crate) async fn collect_completion(
    state: &AppState,
    id: &str,
    rx: &mut mpsc::UnboundedReceiver<TokenEvent>,
) -> Result<(String, neno_core::RequestSnapshot), ApiError> {
    let mut tokens: Vec<TokenId> = Vec::new();
    while let Some((token, _finished)) = rx.recv().await {
        tokens.push(token);
    }
    let snapshot = state
        .engine
        .get_request(id)
        .ok_or_else(|| ApiError::internal("request vanished"))?;
    let text = state.engine.decode(&tokens).unwrap_or_default();
    Ok((text, snapshot))
}

pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
