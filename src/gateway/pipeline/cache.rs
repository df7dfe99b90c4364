use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::http::HeaderMap;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{Attempt, Next, Stage};
use crate::gateway::Clock;
use crate::gateway::context::CacheStatus;
use crate::gateway::observability::Observability;
use crate::gateway::upstream::{ResponseBody, UpstreamError, UpstreamResponse};

const CACHE_HEADER: &str = "x-conduit-cache";
const MAX_POOLED_BUFFERS: usize = 32;
const MAX_POOLED_BUFFER_BYTES: usize = 256 * 1024;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default = "default_max_total_body_bytes")]
    pub max_total_body_bytes: usize,
}

fn default_enabled() -> bool {
    true
}

fn default_ttl_seconds() -> u64 {
    60
}

fn default_max_entries() -> usize {
    1024
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

fn default_max_total_body_bytes() -> usize {
    64 * 1024 * 1024
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            ttl_seconds: default_ttl_seconds(),
            max_entries: default_max_entries(),
            max_body_bytes: default_max_body_bytes(),
            max_total_body_bytes: default_max_total_body_bytes(),
        }
    }
}

#[derive(Clone, Debug)]
struct CachedResponse {
    status: u16,
    headers: HeaderMap,
    body: Bytes,
    expires_at: u64,
}

/// TTL + insertion-order eviction, bounded by entry count and total body bytes.
#[derive(Debug)]
pub struct ResponseCache {
    config: CacheConfig,
    entries: HashMap<String, CachedResponse>,
    order: VecDeque<String>,
    total_body_bytes: usize,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            order: VecDeque::new(),
            total_body_bytes: 0,
        }
    }

    fn get(&mut self, key: &str, now: u64) -> Option<CachedResponse> {
        let expires_at = self.entries.get(key)?.expires_at;
        if now >= expires_at {
            self.remove(key);
            return None;
        }
        self.entries.get(key).cloned()
    }

    fn insert(&mut self, key: String, status: u16, headers: HeaderMap, body: Bytes, now: u64) {
        if self.config.ttl_seconds == 0 || self.config.max_entries == 0 {
            return;
        }
        let body_len = body.len();
        if body_len > self.config.max_body_bytes || body_len > self.config.max_total_body_bytes {
            return;
        }

        self.remove(&key);
        self.entries.insert(
            key.clone(),
            CachedResponse {
                status,
                headers,
                body,
                expires_at: now.saturating_add(self.config.ttl_seconds),
            },
        );
        self.total_body_bytes = self.total_body_bytes.saturating_add(body_len);
        self.order.push_back(key);

        while self.entries.len() > self.config.max_entries
            || self.total_body_bytes > self.config.max_total_body_bytes
        {
            let Some(candidate) = self.order.pop_front() else {
                break;
            };
            if let Some(entry) = self.entries.remove(&candidate) {
                self.total_body_bytes = self.total_body_bytes.saturating_sub(entry.body.len());
            }
        }
    }

    fn remove(&mut self, key: &str) -> bool {
        let Some(entry) = self.entries.remove(key) else {
            return false;
        };
        self.total_body_bytes = self.total_body_bytes.saturating_sub(entry.body.len());
        self.order.retain(|candidate| candidate != key);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Reusable scratch buffers for key normalization.
#[derive(Debug, Default)]
struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    fn take(&self) -> Vec<u8> {
        self.buffers
            .lock()
            .ok()
            .and_then(|mut buffers| buffers.pop())
            .unwrap_or_default()
    }

    fn give(&self, mut buffer: Vec<u8>) {
        if buffer.capacity() > MAX_POOLED_BUFFER_BYTES {
            return;
        }
        buffer.clear();
        if let Ok(mut buffers) = self.buffers.lock() {
            if buffers.len() < MAX_POOLED_BUFFERS {
                buffers.push(buffer);
            }
        }
    }
}

/// sha256 over model, path and the JSON body re-serialized with sorted keys, so
/// key order and whitespace do not split entries.
pub fn cache_key(
    model: &str,
    path: &str,
    body: &serde_json::Value,
    scratch: &mut Vec<u8>,
) -> String {
    scratch.clear();
    scratch.extend_from_slice(model.as_bytes());
    scratch.push(0);
    scratch.extend_from_slice(path.as_bytes());
    scratch.push(0);
    if serde_json::to_writer(&mut *scratch, body).is_err() {
        scratch.extend_from_slice(body.to_string().as_bytes());
    }
    hex_lower(&Sha256::digest(scratch.as_slice()))
}

fn hex_lower(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len().saturating_mul(2));
    for &byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}

pub struct CacheStage {
    cache: Mutex<ResponseCache>,
    pool: BufferPool,
    clock: Arc<dyn Clock>,
    observability: Arc<Observability>,
}

impl CacheStage {
    pub fn new(
        cache: ResponseCache,
        clock: Arc<dyn Clock>,
        observability: Arc<Observability>,
    ) -> Self {
        Self {
            cache: Mutex::new(cache),
            pool: BufferPool::default(),
            clock,
            observability,
        }
    }

    /// Only non-streamed, JSON requests of cacheable models with no sampling temperature.
    fn key_for(&self, attempt: &Attempt<'_>) -> Option<String> {
        if !attempt.model.cacheable || attempt.client_stream || attempt.request.stream {
            return None;
        }
        let body: serde_json::Value = serde_json::from_slice(&attempt.request.body).ok()?;
        let temperature = body
            .get("temperature")
            .and_then(|value| value.as_f64())
            .unwrap_or(0.0);
        if temperature > 0.0 {
            return None;
        }
        let path = attempt
            .request
            .path_and_query
            .split_once('?')
            .map(|(path, _)| path)
            .unwrap_or(&attempt.request.path_and_query);
        let mut scratch = self.pool.take();
        let key = cache_key(&attempt.model.name, path, &body, &mut scratch);
        self.pool.give(scratch);
        Some(key)
    }
}

#[async_trait]
impl Stage for CacheStage {
    fn name(&self) -> &'static str {
        "cache"
    }

    async fn before(&self, attempt: &Attempt<'_>) -> Option<UpstreamResponse> {
        let Some(key) = self.key_for(attempt) else {
            let _ = attempt.trace.cache.set(CacheStatus::Bypass);
            return None;
        };
        let now = self.clock.now_epoch_seconds();
        let cached = match self.cache.lock() {
            Ok(mut cache) => cache.get(&key, now),
            Err(_) => {
                tracing::warn!(
                    request_id = %attempt.request_id,
                    "response cache lock poisoned; bypassing"
                );
                None
            }
        };
        let Some(cached) = cached else {
            let _ = attempt.trace.cache.set(CacheStatus::Miss);
            return None;
        };

        let _ = attempt.trace.cache.set(CacheStatus::Hit);
        self.observability.record_cache_hit();
        let mut headers = cached.headers;
        headers.insert(CACHE_HEADER, axum::http::HeaderValue::from_static("hit"));
        Some(UpstreamResponse::full(cached.status, headers, cached.body))
    }

    async fn around(
        &self,
        attempt: &Attempt<'_>,
        next: Next<'_>,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let response = next.run(attempt).await?;
        if attempt.trace.cache.get() != Some(&CacheStatus::Miss) {
            return Ok(response);
        }
        if let ResponseBody::Full(body) = &response.body {
            if (200..300).contains(&response.status) {
                if let Some(key) = self.key_for(attempt) {
                    let now = self.clock.now_epoch_seconds();
                    match self.cache.lock() {
                        Ok(mut cache) => cache.insert(
                            key,
                            response.status,
                            response.headers.clone(),
                            body.clone(),
                            now,
                        ),
                        Err(_) => tracing::warn!(
                            request_id = %attempt.request_id,
                            "response cache lock poisoned; not storing"
                        ),
                    }
                }
            }
        }
        Ok(response)
    }
}
