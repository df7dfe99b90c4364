use std::net::IpAddr;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use axum::http::{HeaderMap, Method};
use bytes::Bytes;
use serde::Serialize;

use super::GatewayError;
use super::types::{Principal, ResolvedModel, Tenant};

pub const PINNED_CHANNEL_HEADER: &str = "x-conduit-channel";

/// A client request after its body has been buffered once.
#[derive(Clone, Debug)]
pub struct InboundRequest {
    pub request_id: String,
    pub method: Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_ip: Option<IpAddr>,
    json: Option<serde_json::Value>,
}

impl InboundRequest {
    pub fn new(
        request_id: impl Into<String>,
        method: Method,
        path_and_query: impl Into<String>,
        headers: HeaderMap,
        body: Bytes,
    ) -> Self {
        let json = if body.is_empty() {
            None
        } else {
            serde_json::from_slice::<serde_json::Value>(&body)
                .ok()
                .filter(|value| value.is_object())
        };
        Self {
            request_id: request_id.into(),
            method,
            path_and_query: path_and_query.into(),
            headers,
            body,
            client_ip: None,
            json,
        }
    }

    pub fn with_client_ip(mut self, ip: Option<IpAddr>) -> Self {
        self.client_ip = ip;
        self
    }

    pub fn path(&self) -> &str {
        self.path_and_query
            .split_once('?')
            .map(|(path, _)| path)
            .unwrap_or(&self.path_and_query)
    }

    pub fn json(&self) -> Option<&serde_json::Value> {
        self.json.as_ref()
    }

    pub fn body_str_field(&self, field: &str) -> Option<&str> {
        self.json
            .as_ref()
            .and_then(|value| value.get(field))
            .and_then(|value| value.as_str())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn stream_requested(&self) -> bool {
        self.json
            .as_ref()
            .and_then(|value| value.get("stream"))
            .and_then(|value| value.as_bool())
            .unwrap_or(false)
    }

    pub fn pinned_channel_header(&self) -> Option<&str> {
        self.headers
            .get(PINNED_CHANNEL_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    /// Rough pre-dispatch token estimate for TPM accounting: prompt bytes / 4 plus the
    /// requested completion budget.
    pub fn estimated_tokens(&self) -> u64 {
        let prompt = (self.body.len() as u64).div_ceil(4);
        let completion = self
            .json
            .as_ref()
            .and_then(|value| {
                ["max_tokens", "max_completion_tokens", "max_output_tokens"]
                    .iter()
                    .find_map(|key| value.get(*key).and_then(|value| value.as_u64()))
            })
            .unwrap_or(0);
        prompt.saturating_add(completion)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PinSource {
    Header,
    StoreAffinity,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChannelPin {
    pub channel_id: String,
    pub source: PinSource,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    Hit,
    Miss,
    Bypass,
}

/// Per-attempt facts written by pipeline stages. Each field is written at most once,
/// by the stage that owns it.
#[derive(Clone, Debug, Default)]
pub struct AttemptTrace {
    pub cache: OnceLock<CacheStatus>,
    pub deadline: OnceLock<Duration>,
    pub stream_adapted: OnceLock<bool>,
    pub latency: OnceLock<Duration>,
    pub upstream_contacted: OnceLock<bool>,
}

impl AttemptTrace {
    pub fn contacted_upstream(&self) -> bool {
        self.upstream_contacted.get().copied().unwrap_or(false)
    }

    pub fn cache_hit(&self) -> bool {
        self.cache.get() == Some(&CacheStatus::Hit)
    }
}

#[derive(Debug)]
pub struct AttemptRecord {
    pub channel_id: String,
    pub trace: AttemptTrace,
    /// `None` on success, otherwise the failure code.
    pub failure: Option<&'static str>,
}

/// Request-scoped state. Identity is fixed at creation; everything else only grows:
/// the model is set once, exclusions and attempts are appended, nothing is retracted.
#[derive(Debug)]
pub struct RequestContext {
    request_id: String,
    tenant: Arc<Tenant>,
    principal: Arc<Principal>,
    started_at: Instant,
    started_at_ms: u64,
    model: OnceLock<ResolvedModel>,
    pin: OnceLock<ChannelPin>,
    excluded: Vec<String>,
    attempts: Vec<AttemptRecord>,
}

impl RequestContext {
    pub fn new(
        request_id: impl Into<String>,
        tenant: Arc<Tenant>,
        principal: Arc<Principal>,
        started_at_ms: u64,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            tenant,
            principal,
            started_at: Instant::now(),
            started_at_ms,
            model: OnceLock::new(),
            pin: OnceLock::new(),
            excluded: Vec::new(),
            attempts: Vec::new(),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn tenant(&self) -> &Arc<Tenant> {
        &self.tenant
    }

    pub fn principal(&self) -> &Arc<Principal> {
        &self.principal
    }

    pub fn started_at_ms(&self) -> u64 {
        self.started_at_ms
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn set_model(&self, model: ResolvedModel) -> Result<(), GatewayError> {
        self.model.set(model).map_err(|_| GatewayError::Internal {
            message: "resolved model already recorded for this request".to_string(),
        })
    }

    pub fn model(&self) -> Option<&ResolvedModel> {
        self.model.get()
    }

    pub fn model_name(&self) -> Option<&str> {
        self.model.get().map(|model| model.name.as_str())
    }

    pub fn set_pin(&self, pin: ChannelPin) -> Result<(), GatewayError> {
        self.pin.set(pin).map_err(|_| GatewayError::Internal {
            message: "channel pin already recorded for this request".to_string(),
        })
    }

    pub fn pin(&self) -> Option<&ChannelPin> {
        self.pin.get()
    }

    pub fn exclude(&mut self, channel_id: &str) {
        if !self.is_excluded(channel_id) {
            self.excluded.push(channel_id.to_string());
        }
    }

    pub fn is_excluded(&self, channel_id: &str) -> bool {
        self.excluded.iter().any(|excluded| excluded == channel_id)
    }

    pub fn excluded(&self) -> &[String] {
        &self.excluded
    }

    pub fn record_attempt(&mut self, record: AttemptRecord) {
        self.attempts.push(record);
    }

    pub fn attempts(&self) -> &[AttemptRecord] {
        &self.attempts
    }

    pub fn attempt_count(&self) -> u32 {
        u32::try_from(self.attempts.len()).unwrap_or(u32::MAX)
    }

    pub fn last_channel(&self) -> Option<&str> {
        self.attempts.last().map(|record| record.channel_id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::types::{ModelConfig, RetryPolicy};

    fn context() -> RequestContext {
        RequestContext::new(
            "req-1",
            Arc::new(Tenant::new("t1")),
            Arc::new(Principal::new("p1", "t1", "sk-1")),
            0,
        )
    }

    #[test]
    fn model_is_written_once() {
        let ctx = context();
        let model = ModelConfig::new("gpt-4o").merged_for("t1", &RetryPolicy::default());
        ctx.set_model(model.clone()).expect("first write");
        assert!(ctx.set_model(model).is_err());
        assert_eq!(ctx.model_name(), Some("gpt-4o"));
    }

    #[test]
    fn exclusions_only_grow_and_dedup() {
        let mut ctx = context();
        ctx.exclude("a");
        ctx.exclude("b");
        ctx.exclude("a");
        assert_eq!(ctx.excluded(), ["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn attempt_trace_fields_are_write_once() {
        let trace = AttemptTrace::default();
        assert!(trace.cache.set(CacheStatus::Miss).is_ok());
        assert!(trace.cache.set(CacheStatus::Hit).is_err());
        assert!(!trace.cache_hit());
    }

    #[test]
    fn inbound_request_reads_json_fields() {
        let body = Bytes::from_static(br#"{"model":" gpt-4o ","stream":true,"max_tokens":100}"#);
        let request = InboundRequest::new(
            "r",
            Method::POST,
            "/v1/chat/completions?x=1",
            HeaderMap::new(),
            body.clone(),
        );
        assert_eq!(request.path(), "/v1/chat/completions");
        assert_eq!(request.body_str_field("model"), Some("gpt-4o"));
        assert!(request.stream_requested());
        assert_eq!(
            request.estimated_tokens(),
            (body.len() as u64).div_ceil(4) + 100
        );
    }
}
