use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderValue, header};
use bytes::Bytes;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{Attempt, Next, Stage};
use crate::gateway::observability::Observability;
use crate::gateway::upstream::{ResponseBody, UpstreamError, UpstreamResponse};
use crate::utils::sse::{data_event, done_event};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamAdaptationConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Characters of generated text per synthetic delta.
    #[serde(default = "default_chunk_chars")]
    pub chunk_chars: usize,
}

fn default_enabled() -> bool {
    true
}

fn default_chunk_chars() -> usize {
    48
}

impl Default for StreamAdaptationConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            chunk_chars: default_chunk_chars(),
        }
    }
}

/// Serves streamed requests from channels that only answer in one piece: the call
/// goes out with `stream: false` and the answer is replayed as server-sent events.
pub struct StreamAdaptStage {
    config: StreamAdaptationConfig,
    observability: Arc<Observability>,
}

impl StreamAdaptStage {
    pub fn new(config: StreamAdaptationConfig, observability: Arc<Observability>) -> Self {
        Self {
            config,
            observability,
        }
    }
}

#[async_trait]
impl Stage for StreamAdaptStage {
    fn name(&self) -> &'static str {
        "stream_adapt"
    }

    async fn around(
        &self,
        attempt: &Attempt<'_>,
        next: Next<'_>,
    ) -> Result<UpstreamResponse, UpstreamError> {
        if !attempt.client_stream || attempt.channel.supports_streaming {
            let _ = attempt.trace.stream_adapted.set(false);
            return next.run(attempt).await;
        }

        let Some(body) = blocking_body(&attempt.request.body) else {
            let _ = attempt.trace.stream_adapted.set(false);
            return next.run(attempt).await;
        };
        let _ = attempt.trace.stream_adapted.set(true);
        self.observability.record_stream_adaptation();
        tracing::debug!(
            request_id = %attempt.request_id,
            channel = %attempt.channel.id,
            "adapting blocking channel response into a stream"
        );

        let derived = attempt.with_request(attempt.request.with_body(body, false));
        let response = next.run(&derived).await?;
        let ResponseBody::Full(full) = &response.body else {
            return Ok(response);
        };

        let events = synthesize_stream(full, self.config.chunk_chars);
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/event-stream"),
        );
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        Ok(UpstreamResponse {
            status: response.status,
            headers,
            body: ResponseBody::Stream(
                futures_util::stream::iter(events.into_iter().map(Ok)).boxed(),
            ),
            usage: response.usage,
        })
    }
}

/// Copy of the client body with streaming switched off. The input is not touched.
fn blocking_body(body: &Bytes) -> Option<Bytes> {
    let mut value: Value = serde_json::from_slice(body).ok()?;
    let object = value.as_object_mut()?;
    object.insert("stream".to_string(), Value::Bool(false));
    object.remove("stream_options");
    serde_json::to_vec(&value).ok().map(Bytes::from)
}

/// Re-frames a complete JSON answer as the event stream a streaming upstream would
/// have produced. Unknown shapes become a single event.
pub fn synthesize_stream(body: &Bytes, chunk_chars: usize) -> Vec<Bytes> {
    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        return vec![data_event(&String::from_utf8_lossy(body)), done_event()];
    };

    if value.get("object").and_then(Value::as_str) == Some("response") {
        return synthesize_responses_stream(&value, chunk_chars);
    }
    if value.get("choices").and_then(Value::as_array).is_some() {
        return synthesize_chat_stream(&value, chunk_chars);
    }
    vec![data_event(&value.to_string()), done_event()]
}

fn synthesize_chat_stream(value: &Value, chunk_chars: usize) -> Vec<Bytes> {
    let id = value.get("id").cloned().unwrap_or(Value::Null);
    let model = value.get("model").cloned().unwrap_or(Value::Null);
    let created = value.get("created").cloned().unwrap_or(Value::Null);
    let chunk = |choices: Value| {
        json!({
            "id": id,
            "object": "chat.completion.chunk",
            "created": created,
            "model": model,
            "choices": choices,
        })
    };

    let mut events = Vec::new();
    let choices = value
        .get("choices")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for (position, choice) in choices.iter().enumerate() {
        let index = choice.get("index").cloned().unwrap_or(json!(position));
        let message = choice.get("message").cloned().unwrap_or(Value::Null);
        let role = message.get("role").cloned().unwrap_or(json!("assistant"));
        events.push(data_event(
            &chunk(json!([{"index": index, "delta": {"role": role}, "finish_reason": null}]))
                .to_string(),
        ));

        let content = message.get("content").and_then(Value::as_str).unwrap_or("");
        for piece in split_chars(content, chunk_chars) {
            events.push(data_event(
                &chunk(json!([{
                    "index": index,
                    "delta": {"content": piece},
                    "finish_reason": null
                }]))
                .to_string(),
            ));
        }
        if let Some(tool_calls) = message.get("tool_calls") {
            events.push(data_event(
                &chunk(json!([{
                    "index": index,
                    "delta": {"tool_calls": tool_calls},
                    "finish_reason": null
                }]))
                .to_string(),
            ));
        }

        let finish_reason = choice
            .get("finish_reason")
            .cloned()
            .unwrap_or(json!("stop"));
        events.push(data_event(
            &chunk(json!([{"index": index, "delta": {}, "finish_reason": finish_reason}]))
                .to_string(),
        ));
    }

    if let Some(usage) = value.get("usage") {
        let mut tail = chunk(json!([]));
        if let Some(object) = tail.as_object_mut() {
            object.insert("usage".to_string(), usage.clone());
        }
        events.push(data_event(&tail.to_string()));
    }
    events.push(done_event());
    events
}

fn synthesize_responses_stream(value: &Value, chunk_chars: usize) -> Vec<Bytes> {
    let mut events = Vec::new();
    let mut in_progress = value.clone();
    if let Some(object) = in_progress.as_object_mut() {
        object.insert("status".to_string(), json!("in_progress"));
        object.insert("output".to_string(), json!([]));
        object.remove("usage");
    }
    events.push(named_event(
        "response.created",
        &json!({"type": "response.created", "response": in_progress}),
    ));

    let text: String = value
        .get("output")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|item| item.get("content").and_then(Value::as_array))
        .flatten()
        .filter(|part| part.get("type").and_then(Value::as_str) == Some("output_text"))
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect();
    for piece in split_chars(&text, chunk_chars) {
        events.push(named_event(
            "response.output_text.delta",
            &json!({
                "type": "response.output_text.delta",
                "output_index": 0,
                "content_index": 0,
                "delta": piece
            }),
        ));
    }

    events.push(named_event(
        "response.completed",
        &json!({"type": "response.completed", "response": value}),
    ));
    events
}

fn named_event(name: &str, payload: &Value) -> Bytes {
    let payload = payload.to_string();
    let mut out = String::with_capacity(payload.len() + name.len() + 16);
    out.push_str("event: ");
    out.push_str(name);
    out.push('\n');
    out.push_str("data: ");
    out.push_str(&payload);
    out.push_str("\n\n");
    Bytes::from(out)
}

fn split_chars(text: &str, chunk_chars: usize) -> Vec<&str> {
    let chunk_chars = chunk_chars.max(1);
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut count = 0;
    for (offset, _) in text.char_indices() {
        if count == chunk_chars {
            pieces.push(&text[start..offset]);
            start = offset;
            count = 0;
        }
        count += 1;
    }
    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces
}
