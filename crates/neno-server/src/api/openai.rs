//! OpenAI-compatible endpoints: chat completions, completions, models.
//!
//! Streaming responses are Server-Sent Events: one `data: <json>` frame
//! per chunk, terminated by `data: [DONE]`.

use std::collections::HashSet;
use std::convert::Infallible;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;

use neno_core::engine::{SamplingParams, TokenId};

use crate::error::ApiError;
use crate::state::AppState;

use super::{collect_completion, submit_streaming, unix_now};

#[derive(Debug, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub max_tokens: Option<usize>,
    #[serde(default)]
    pub repetition_penalty: Option<f32>,
    #[serde(default)]
    pub stop_token_ids: Option<Vec<TokenId>>,
    #[serde(default)]
    pub seed: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct CompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub prompt: String,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub max_tokens: Option<usize>,
    #[serde(default)]
    pub repetition_penalty: Option<f32>,
    #[serde(default)]
    pub stop_token_ids: Option<Vec<TokenId>>,
    #[serde(default)]
    pub seed: Option<u64>,
}

#[derive(Debug, Serialize)]
struct ChunkDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct ChunkChoice {
    index: usize,
    delta: ChunkDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Serialize)]
struct ChatCompletionChunk {
    id: String,
    object: &'static str,
    created: u64,
    model: String,
    choices: Vec<ChunkChoice>,
}

fn sampling_params(
    temperature: Option<f32>,
    top_p: Option<f32>,
    top_k: Option<usize>,
    max_tokens: Option<usize>,
    repetition_penalty: Option<f32>,
    stop_token_ids: Option<Vec<TokenId>>,
    seed: Option<u64>,
) -> SamplingParams {
    let defaults = SamplingParams::default();
    SamplingParams {
        temperature: temperature.unwrap_or(defaults.temperature),
        top_p: top_p.unwrap_or(defaults.top_p),
        top_k: top_k.unwrap_or(defaults.top_k),
        max_tokens: max_tokens.unwrap_or(defaults.max_tokens),
        repetition_penalty: repetition_penalty.unwrap_or(defaults.repetition_penalty),
        stop_token_ids: stop_token_ids
            .map(|ids| ids.into_iter().collect::<HashSet<_>>())
            .unwrap_or_default(),
        seed,
    }
}

/// Reject requests addressed to a model this server does not serve.
fn check_model(requested: &Option<String>, served: &str) -> Result<(), ApiError> {
    match requested {
        Some(model) if model != served => Err(ApiError::not_found(format!(
            "model {model:?} not found; this server serves {served:?}"
        ))),
        _ => Ok(()),
    }
}

/// Render chat messages into a ChatML prompt.
fn render_chat_prompt(messages: &[ChatMessage]) -> String {
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

pub async fn models(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "object": "list",
        "data": [{
            "id": state.model_name,
            "object": "model",
            "created": unix_now(),
            "owned_by": "neno"
        }]
    }))
}

pub async fn chat_completions(
    State(state): State<AppState>,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<Response, ApiError> {
    check_model(&request.model, &state.model_name)?;
    if request.messages.is_empty() {
        return Err(ApiError::bad_request("messages must not be empty"));
    }
    let prompt = render_chat_prompt(&request.messages);
    let params = sampling_params(
        request.temperature,
        request.top_p,
        request.top_k,
        request.max_tokens,
        request.repetition_penalty,
        request.stop_token_ids,
        request.seed,
    );

    let (id, mut rx, guard) = submit_streaming(&state, &prompt, params, 0)?;

    if request.stream {
        let stream = chat_chunk_stream(state.clone(), id, rx, guard);
        return Ok(Sse::new(stream).keep_alive(KeepAlive::default()).into_response());
    }

    let (text, snapshot) = collect_completion(&state, &id, &mut rx).await?;
    drop(guard);
    Ok(Json(json!({
        "id": format!("chatcmpl-{id}"),
        "object": "chat.completion",
        "created": unix_now(),
        "model": state.model_name,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": text},
            "finish_reason": snapshot.finish_reason.map(|r| r.as_str())
        }],
        "usage": {
            "prompt_tokens": snapshot.num_prompt_tokens,
            "completion_tokens": snapshot.generated_tokens.len(),
            "total_tokens": snapshot.num_prompt_tokens + snapshot.generated_tokens.len()
        }
    }))
    .into_response())
}

pub async fn completions(
    State(state): State<AppState>,
    Json(request): Json<CompletionRequest>,
) -> Result<Response, ApiError> {
    check_model(&request.model, &state.model_name)?;
    let params = sampling_params(
        request.temperature,
        request.top_p,
        request.top_k,
        request.max_tokens,
        request.repetition_penalty,
        request.stop_token_ids,
        request.seed,
    );
    let (id, mut rx, guard) = submit_streaming(&state, &request.prompt, params, 0)?;

    if request.stream {
        let stream = completion_chunk_stream(state.clone(), id, rx, guard);
        return Ok(Sse::new(stream).keep_alive(KeepAlive::default()).into_response());
    }

    let (text, snapshot) = collect_completion(&state, &id, &mut rx).await?;
    drop(guard);
    Ok(Json(json!({
        "id": format!("cmpl-{id}"),
        "object": "text_completion",
        "created": unix_now(),
        "model": state.model_name,
        "choices": [{
            "index": 0,
            "text": text,
            "finish_reason": snapshot.finish_reason.map(|r| r.as_str())
        }],
        "usage": {
            "prompt_tokens": snapshot.num_prompt_tokens,
            "completion_tokens": snapshot.generated_tokens.len(),
            "total_tokens": snapshot.num_prompt_tokens + snapshot.generated_tokens.len()
        }
    }))
    .into_response())
}

fn chat_chunk_stream(
    state: AppState,
    id: String,
    mut rx: tokio::sync::mpsc::UnboundedReceiver<super::TokenEvent>,
    guard: super::CancelOnDrop,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        // Held for the whole response: dropping the stream cancels the
        // request.
        let _guard = guard;
        let mut first = true;
        while let Some((token, _finished)) = rx.recv().await {
            let text = state.engine.decode(&[token]).unwrap_or_default();
            let chunk = ChatCompletionChunk {
                id: format!("chatcmpl-{id}"),
                object: "chat.completion.chunk",
                created: unix_now(),
                model: state.model_name.clone(),
                choices: vec![ChunkChoice {
                    index: 0,
                    delta: ChunkDelta {
                        role: first.then(|| "assistant".to_string()),
                        content: Some(text),
                    },
                    finish_reason: None,
                }],
            };
            first = false;
            yield Ok(Event::default().data(serde_json::to_string(&chunk).unwrap_or_default()));
        }
        let finish_reason = state
            .engine
            .get_request(&id)
            .and_then(|s| s.finish_reason)
            .map(|r| r.as_str().to_string());
        let done = ChatCompletionChunk {
            id: format!("chatcmpl-{id}"),
            object: "chat.completion.chunk",
            created: unix_now(),
            model: state.model_name.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta { role: None, content: None },
                finish_reason,
            }],
        };
        yield Ok(Event::default().data(serde_json::to_string(&done).unwrap_or_default()));
        yield Ok(Event::default().data("[DONE]"));
    }
}

fn completion_chunk_stream(
    state: AppState,
    id: String,
    mut rx: tokio::sync::mpsc::UnboundedReceiver<super::TokenEvent>,
    guard: super::CancelOnDrop,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        let _guard = guard;
        while let Some((token, _finished)) = rx.recv().await {
            let text = state.engine.decode(&[token]).unwrap_or_default();
            let chunk = json!({
                "id": format!("cmpl-{id}"),
                "object": "text_completion",
                "created": unix_now(),
                "model": state.model_name,
                "choices": [{"index": 0, "text": text, "finish_reason": null}]
            });
            yield Ok(Event::default().data(chunk.to_string()));
        }
        let finish_reason = state
            .engine
            .get_request(&id)
            .and_then(|s| s.finish_reason)
            .map(|r| r.as_str());
        let done = json!({
            "id": format!("cmpl-{id}"),
            "object": "text_completion",
            "created": unix_now(),
            "model": state.model_name,
            "choices": [{"index": 0, "text": "", "finish_reason": finish_reason}]
        });
        yield Ok(Event::default().data(done.to_string()));
        yield Ok(Event::default().data("[DONE]"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_prompt_rendering() {
        let messages = vec![
            ChatMessage {
                role: "system".into(),
                content: "Be brief.".into(),
            },
            ChatMessage {
                role: "user".into(),
                content: "Hi".into(),
            },
        ];
        let prompt = render_chat_prompt(&messages);
        assert!(prompt.starts_with("<|im_start|>system\nBe brief.<|im_end|>\n"));
        assert!(prompt.ends_with("<|im_start|>assistant\n"));
    }

    #[test]
    fn test_sampling_params_mapping() {
        let params = sampling_params(Some(0.0), None, Some(40), Some(64), None, Some(vec![7]), Some(1));
        assert_eq!(params.temperature, 0.0);
        assert_eq!(params.top_k, 40);
        assert_eq!(params.max_tokens, 64);
        assert!(params.stop_token_ids.contains(&7));
        assert_eq!(params.seed, Some(1));
    }
}
