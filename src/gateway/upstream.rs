use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method};
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde::Serialize;
use thiserror::Error;

use super::types::{Channel, TokenUsage};
use crate::utils::http::{read_body_bounded, read_error_body};

const MAX_UPSTREAM_ERROR_BODY_BYTES: usize = 64 * 1024;
const MAX_UPSTREAM_BODY_BYTES: usize = 64 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamErrorKind {
    Timeout,
    Connection,
    Provider4xx,
    /// 429 or another upstream-signaled throttle.
    Throttled,
    Provider5xx,
    Cancelled,
}

impl UpstreamErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            UpstreamErrorKind::Timeout => "upstream_timeout",
            UpstreamErrorKind::Connection => "upstream_connection_failed",
            UpstreamErrorKind::Provider4xx => "upstream_rejected",
            UpstreamErrorKind::Throttled => "upstream_throttled",
            UpstreamErrorKind::Provider5xx => "upstream_error",
            UpstreamErrorKind::Cancelled => "cancelled",
        }
    }

    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            UpstreamErrorKind::Timeout
                | UpstreamErrorKind::Connection
                | UpstreamErrorKind::Throttled
                | UpstreamErrorKind::Provider5xx
        )
    }

    /// Failures that count against the channel's health. Caller-caused 4xx do not.
    pub fn counts_against_channel(self) -> bool {
        self.is_retryable()
    }
}

#[derive(Clone, Debug, Error)]
#[error("{}: {message}", .kind.code())]
pub struct UpstreamError {
    pub kind: UpstreamErrorKind,
    pub status: Option<u16>,
    pub message: String,
    /// Upstream error body, passed through to the client for provider 4xx.
    pub body: Option<Bytes>,
}

impl UpstreamError {
    pub fn new(kind: UpstreamErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
            body: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(UpstreamErrorKind::Timeout, message)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(UpstreamErrorKind::Connection, message)
    }

    pub fn from_status(status: u16, body: Bytes) -> Self {
        let kind = match status {
            429 => UpstreamErrorKind::Throttled,
            400..=499 => UpstreamErrorKind::Provider4xx,
            _ => UpstreamErrorKind::Provider5xx,
        };
        let message = String::from_utf8_lossy(&body).to_string();
        Self {
            kind,
            status: Some(status),
            message: format!("upstream status {status}: {message}"),
            body: Some(body),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// A buffered request as it will be replayed to a channel. The body is immutable
/// shared bytes, so every attempt sends exactly what the client sent unless a
/// stage derives a new request.
#[derive(Clone, Debug)]
pub struct UpstreamRequest {
    pub method: Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub stream: bool,
}

impl UpstreamRequest {
    /// Copy with a different body; the original buffer is left untouched.
    pub fn with_body(&self, body: Bytes, stream: bool) -> Self {
        Self {
            method: self.method.clone(),
            path_and_query: self.path_and_query.clone(),
            headers: self.headers.clone(),
            body,
            stream,
        }
    }
}

pub type ByteStream = BoxStream<'static, Result<Bytes, UpstreamError>>;

pub enum ResponseBody {
    Full(Bytes),
    Stream(ByteStream),
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseBody::Full(bytes) => f.debug_tuple("Full").field(&bytes.len()).finish(),
            ResponseBody::Stream(_) => f.write_str("Stream"),
        }
    }
}

#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: ResponseBody,
    pub usage: Option<TokenUsage>,
}

impl UpstreamResponse {
    pub fn full(status: u16, headers: HeaderMap, body: Bytes) -> Self {
        let usage = parse_usage(&body);
        Self {
            status,
            headers,
            body: ResponseBody::Full(body),
            usage,
        }
    }

    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        Self::full(status, headers, Bytes::from(value.to_string()))
    }

    pub fn full_body(&self) -> Option<&Bytes> {
        match &self.body {
            ResponseBody::Full(bytes) => Some(bytes),
            ResponseBody::Stream(_) => None,
        }
    }
}

/// The network call at the bottom of the pipeline.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn send(
        &self,
        channel: &Channel,
        request: &UpstreamRequest,
    ) -> Result<UpstreamResponse, UpstreamError>;
}

#[derive(Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
}

impl HttpUpstream {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn send(
        &self,
        channel: &Channel,
        request: &UpstreamRequest,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let url = join_base_url(&channel.base_url, &request.path_and_query);
        let mut headers = request.headers.clone();
        sanitize_client_headers(&mut headers);
        apply_channel_headers(&mut headers, &channel.headers)?;

        // Deadlines are owned by the timeout stage, which drops this future on expiry.
        let req = self
            .client
            .request(request.method.clone(), url)
            .headers(headers)
            .body(request.body.clone());

        let response = req.send().await.map_err(classify_reqwest_error)?;
        let status = response.status().as_u16();
        let response_headers = response.headers().clone();

        if !response.status().is_success() {
            let body = read_error_body(response, MAX_UPSTREAM_ERROR_BODY_BYTES).await;
            return Err(UpstreamError::from_status(status, body));
        }

        if request.stream && is_event_stream(&response_headers) {
            let stream = response
                .bytes_stream()
                .map(|chunk| chunk.map_err(classify_reqwest_error))
                .boxed();
            return Ok(UpstreamResponse {
                status,
                headers: response_headers,
                body: ResponseBody::Stream(stream),
                usage: None,
            });
        }

        let body = read_body_bounded(response, MAX_UPSTREAM_BODY_BYTES)
            .await
            .map_err(|err| {
                UpstreamError::connection(format!("failed to read upstream body: {err}"))
            })?;
        Ok(UpstreamResponse::full(status, response_headers, body))
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> UpstreamError {
    if err.is_timeout() {
        UpstreamError::timeout(format!("upstream request timed out: {err}"))
    } else {
        UpstreamError::connection(format!("upstream request failed: {err}"))
    }
}

fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("text/event-stream"))
}

/// Strips hop-by-hop and client credential headers before forwarding.
pub fn sanitize_client_headers(headers: &mut HeaderMap) {
    for name in [
        "authorization",
        "x-api-key",
        "host",
        "content-length",
        "connection",
        "transfer-encoding",
        "x-conduit-channel",
    ] {
        headers.remove(name);
    }
}

fn apply_channel_headers(
    headers: &mut HeaderMap,
    channel_headers: &BTreeMap<String, String>,
) -> Result<(), UpstreamError> {
    for (name, value) in channel_headers {
        let header_name = name.parse::<HeaderName>().map_err(|_| {
            UpstreamError::connection(format!("invalid channel header name: {name}"))
        })?;
        let header_value = value.parse::<HeaderValue>().map_err(|_| {
            UpstreamError::connection(format!("invalid channel header value for {name}"))
        })?;
        headers.insert(header_name, header_value);
    }
    Ok(())
}

pub(crate) fn join_base_url(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let path_no_leading_slash = path.strip_prefix('/').unwrap_or(path);

    // Allow base_url to include /v1 and still accept /v1* paths.
    if base.ends_with("/v1") {
        if path_no_leading_slash == "v1" {
            return base.to_string();
        }
        if let Some(rest) = path_no_leading_slash.strip_prefix("v1/") {
            return format!("{base}/{rest}");
        }
    }

    format!("{base}/{path_no_leading_slash}")
}

/// Reads OpenAI-style (`prompt_tokens`/`completion_tokens`) or Responses/Anthropic-style
/// (`input_tokens`/`output_tokens`) usage from a JSON body.
pub fn parse_usage(body: &[u8]) -> Option<TokenUsage> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    let usage = value.get("usage")?;
    let read = |keys: &[&str]| {
        keys.iter()
            .find_map(|key| usage.get(*key).and_then(|value| value.as_u64()))
            .map(|value| u32::try_from(value).unwrap_or(u32::MAX))
    };
    let input_tokens = read(&["prompt_tokens", "input_tokens"]);
    let output_tokens = read(&["completion_tokens", "output_tokens"]);
    if input_tokens.is_none() && output_tokens.is_none() {
        return None;
    }
    Some(TokenUsage {
        input_tokens: input_tokens.unwrap_or(0),
        output_tokens: output_tokens.unwrap_or(0),
    })
}
