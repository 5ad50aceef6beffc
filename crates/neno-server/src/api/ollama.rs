//! Ollama-compatible endpoints: generate, chat, tags, version.
//!
//! Streaming responses are newline-delimited JSON objects; the terminal
//! object carries `done: true` and the run statistics.

use std::collections::HashSet;
use std::convert::Infallible;

use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use neno_core::engine::{SamplingParams, TokenId};

use crate::error::ApiError;
use crate::state::AppState;

use super::{collect_completion, submit_streaming, unix_now};

#[derive(Debug, Default, Deserialize)]
pub struct OllamaOptions {
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub num_predict: Option<usize>,
    #[serde(default)]
    pub repeat_penalty: Option<f32>,
    #[serde(default)]
    pub stop_token_ids: Option<Vec<TokenId>>,
    #[serde(default)]
    pub seed: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub prompt: String,
    #[serde(default = "default_stream")]
    pub stream: bool,
    #[serde(default)]
    pub options: OllamaOptions,
}

#[derive(Debug, Deserialize)]
pub struct OllamaChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct OllamaChatRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<OllamaChatMessage>,
    #[serde(default = "default_stream")]
    pub stream: bool,
    #[serde(default)]
    pub options: OllamaOptions,
}

fn default_stream() -> bool {
    true
}

impl OllamaOptions {
    fn sampling_params(self) -> SamplingParams {
        let defaults = SamplingParams::default();
        SamplingParams {
            temperature: self.temperature.unwrap_or(defaults.temperature),
            top_p: self.top_p.unwrap_or(defaults.top_p),
            top_k: self.top_k.unwrap_or(defaults.top_k),
            max_tokens: self.num_predict.unwrap_or(defaults.max_tokens),
            repetition_penalty: self.repeat_penalty.unwrap_or(defaults.repetition_penalty),
            stop_token_ids: self
                .stop_token_ids
                .map(|ids| ids.into_iter().collect::<HashSet<_>>())
                .unwrap_or_default(),
            seed: self.seed,
        }
    }
}

fn check_model(requested: &Option<String>, served: &str) -> Result<(), ApiError> {
    match requested {
        Some(model) if model != served => Err(ApiError::not_found(format!(
            "model {model:?} not found; this server serves {served:?}"
        ))),
        _ => Ok(()),
    }
}

fn render_chat_prompt(messages: &[OllamaChatMessage]) -> String {
    let mut prompt = String::new();
    for message in messages {
        prompt.push_str("<|im_start|>");
        prompt.push_str(&message.role);
        prompt.push('\n');
        prompt.push_str(&message.content);
        prompt.push_str("<|im_end|>\n");
    }
    prompt.push_str("<|im_start|>assistant\n");
    prompt
}

pub async fn version() -> Json<serde_json::Value> {
    Json(json!({"version": env!("CARGO_PKG_VERSION")}))
}

pub async fn tags(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "models": [{
            "name": state.model_name,
            "model": state.model_name,
            "modified_at": unix_now().to_string(),
            "size": 0,
            "details": {"family": "neno", "format": "daemon"}
        }]
    }))
}

pub async fn generate(
    State(state): State<AppState>,
    Json(request): Json<GenerateRequest>,
) -> Result<Response, ApiError> {
    check_model(&request.model, &state.model_name)?;
    let params = request.options.sampling_params();
    let (id, mut rx, guard) = submit_streaming(&state, &request.prompt, params, 0)?;

    if request.stream {
        return Ok(ndjson_stream(state, id, rx, guard, false));
    }

    let (text, snapshot) = collect_completion(&state, &id, &mut rx).await?;
    drop(guard);
    Ok(Json(json!({
        "model": state.model_name,
        "created_at": unix_now().to_string(),
        "response": text,
        "done": true,
        "done_reason": snapshot.finish_reason.map(|r| r.as_str()),
        "prompt_eval_count": snapshot.num_prompt_tokens,
        "eval_count": snapshot.generated_tokens.len(),
        "total_duration_ms": snapshot.total_time_ms
    }))
    .into_response())
}

pub async fn chat(
    State(state): State<AppState>,
    Json(request): Json<OllamaChatRequest>,
) -> Result<Response, ApiError> {
    check_model(&request.model, &state.model_name)?;
    if request.messages.is_empty() {
        return Err(ApiError::bad_request("messages must not be empty"));
    }
    let prompt = render_chat_prompt(&request.messages);
    let params = request.options.sampling_params();
    let (id, mut rx, guard) = submit_streaming(&state, &prompt, params, 0)?;

    if request.stream {
        return Ok(ndjson_stream(state, id, rx, guard, true));
    }

    let (text, snapshot) = collect_completion(&state, &id, &mut rx).await?;
    drop(guard);
    Ok(Json(json!({
        "model": state.model_name,
        "created_at": unix_now().to_string(),
        "message": {"role": "assistant", "content": text},
        "done": true,
        "done_reason": snapshot.finish_reason.map(|r| r.as_str()),
        "prompt_eval_count": snapshot.num_prompt_tokens,
        "eval_count": snapshot.generated_tokens.len()
    }))
    .into_response())
}

/// Stream one JSON object per line; the last line has `done: true`.
fn ndjson_stream(
    state: AppState,
    id: String,
    mut rx: tokio::sync::mpsc::UnboundedReceiver<super::TokenEvent>,
    guard: super::CancelOnDrop,
    chat_shape: bool,
) -> Response {
    let stream = async_stream::stream! {
        let _guard = guard;
        while let Some((token, _finished)) = rx.recv().await {
            let text = state.engine.decode(&[token]).unwrap_or_default();
            let line = if chat_shape {
                json!({
                    "model": state.model_name,
                    "created_at": unix_now().to_string(),
                    "message": {"role": "assistant", "content": text},
                    "done": false
                })
            } else {
                json!({
                    "model": state.model_name,
                    "created_at": unix_now().to_string(),
                    "response": text,
                    "done": false
                })
            };
            yield Ok::<_, Infallible>(format!("{line}\n"));
        }
        let snapshot = state.engine.get_request(&id);
        let done_reason = snapshot
            .as_ref()
            .and_then(|s| s.finish_reason)
            .map(|r| r.as_str());
        let eval_count = snapshot
            .as_ref()
            .map(|s| s.generated_tokens.len())
            .unwrap_or(0);
        let line = if chat_shape {
            json!({
                "model": state.model_name,
                "created_at": unix_now().to_string(),
                "message": {"role": "assistant", "content": ""},
                "done": true,
                "done_reason": done_reason,
                "eval_count": eval_count
            })
        } else {
            json!({
                "model": state.model_name,
                "created_at": unix_now().to_string(),
                "response": "",
                "done": true,
                "done_reason": done_reason,
                "eval_count": eval_count
            })
        };
        yield Ok::<_, Infallible>(format!("{line}\n"));
    };

    (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(stream),
    )
        .into_response()
}
