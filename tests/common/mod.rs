#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderValue, Method};
use bytes::Bytes;
use conduit_gateway::gateway::upstream::{
    Upstream, UpstreamError, UpstreamRequest, UpstreamResponse,
};
use conduit_gateway::gateway::{
    Channel, ConsumptionEvent, GatewayConfig, InboundRequest, ModelConfig, Principal, StoreError,
    Tenant, UsageRecord, UsageSink, generate_request_id,
};
use serde_json::json;

pub const MODEL: &str = "gpt-4o-mini";

/// Keeps every event and record the accounting workers hand over.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ConsumptionEvent>>,
    records: Mutex<Vec<UsageRecord>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<ConsumptionEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn records(&self) -> Vec<UsageRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl UsageSink for RecordingSink {
    async fn apply(&self, record: &UsageRecord) -> Result<(), StoreError> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }

    fn observe(&self, event: &ConsumptionEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

pub enum Reply {
    Fail(UpstreamError),
    /// Answers normally after sleeping on the tokio clock.
    Delay(Duration),
}

/// Plays queued replies per channel, then answers 200 with a small usage block.
#[derive(Default)]
pub struct ScriptedUpstream {
    script: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<(String, Bytes)>>,
}

impl ScriptedUpstream {
    pub fn push(&self, channel: &str, reply: Reply) {
        self.script
            .lock()
            .unwrap()
            .entry(channel.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn calls(&self) -> Vec<(String, Bytes)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, channel: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == channel)
            .count()
    }
}

#[async_trait]
impl Upstream for ScriptedUpstream {
    async fn send(
        &self,
        channel: &Channel,
        request: &UpstreamRequest,
    ) -> Result<UpstreamResponse, UpstreamError> {
        self.calls
            .lock()
            .unwrap()
            .push((channel.id.clone(), request.body.clone()));
        let reply = self
            .script
            .lock()
            .unwrap()
            .get_mut(&channel.id)
            .and_then(|queue| queue.pop_front());
        match reply {
            Some(Reply::Fail(err)) => return Err(err),
            Some(Reply::Delay(delay)) => tokio::time::sleep(delay).await,
            None => {}
        }
        Ok(UpstreamResponse::json(
            200,
            &json!({
                "id": "chatcmpl-1",
                "object": "chat.completion",
                "choices": [{"index": 0, "message": {"role": "assistant", "content": "ok"}}],
                "usage": {"prompt_tokens": 10, "completion_tokens": 5}
            }),
        ))
    }
}

pub fn tenant(id: &str, balance_usd_micros: i64) -> Tenant {
    let mut tenant = Tenant::new(id);
    tenant.balance_usd_micros = balance_usd_micros;
    tenant.allowed_models.insert("*".to_string());
    tenant
}

pub fn channel(id: &str) -> Channel {
    Channel::new(id, format!("http://{id}.invalid")).with_models(["gpt-*"])
}

/// The given tenant reachable with key `sk-acme`, one model, and the given channels.
pub fn config(tenant: Tenant, model: ModelConfig, channels: Vec<Channel>) -> GatewayConfig {
    let principal = Principal::new("key-1", tenant.id.clone(), "sk-acme");
    GatewayConfig {
        tenants: vec![tenant],
        principals: vec![principal],
        channels,
        models: vec![model],
        ..GatewayConfig::default()
    }
}

pub fn chat_request(secret: &str) -> InboundRequest {
    let mut headers = HeaderMap::new();
    headers.insert(
        "authorization",
        HeaderValue::from_str(&format!("Bearer {secret}")).unwrap(),
    );
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    let body = json!({
        "model": MODEL,
        "messages": [{"role": "user", "content": "hi"}]
    });
    InboundRequest::new(
        generate_request_id(),
        Method::POST,
        "/v1/chat/completions",
        headers,
        Bytes::from(body.to_string()),
    )
}
