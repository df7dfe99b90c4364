//! The request engine: one call to [`Gateway::handle`] per inbound request.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use bytes::Bytes;
use futures_util::Stream;
use serde::Serialize;
use tracing::Instrument as _;

use crate::utils::sse::SseUsageScanner;
use crate::utils::task::AbortOnDrop;
use crate::{ConduitError, Result};

use super::accounting::{AccountingStats, UsageAccountant, UsageSink};
use super::affinity::{AffinityTable, is_stored_response_path};
use super::config::GatewayConfig;
use super::context::{AttemptRecord, AttemptTrace, CacheStatus, InboundRequest, RequestContext};
use super::costing::ModelPricing;
use super::health::{HealthRegistry, HealthSnapshot};
use super::limits::{CounterStore, MemoryCounterStore};
use super::observability::{Observability, ObservabilitySnapshot};
use super::pipeline::{Attempt, ChannelRecorder, ExecutionPipeline};
use super::policy::{AlertNotifier, AuthorizeInput, ConsumeLevelPolicy, PolicyGate};
use super::resolver::{ModelCatalog, ModelResolver};
use super::retry::{RetryCoordinator, RetryDecision};
use super::router::{ChannelSelector, RandomSource, RoutingTable, SystemRandom};
use super::store::{
    AuthProvider, CachedStore, MemoryStore, PersistentStore, StoreAuthProvider, StoreError,
    extract_credential,
};
use super::types::{Channel, ConsumptionEvent, Outcome, ResolvedModel, TokenUsage};
use super::upstream::{
    ByteStream, HttpUpstream, ResponseBody, Upstream, UpstreamError, UpstreamRequest,
    UpstreamResponse,
};
use super::{Clock, GatewayError, SystemClock};

static REQUEST_ID_SEQ: AtomicU64 = AtomicU64::new(0);

pub fn generate_request_id() -> String {
    let seq = REQUEST_ID_SEQ.fetch_add(1, Ordering::Relaxed);
    let ts_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0);
    format!("conduit-{ts_ms}-{seq}")
}

/// What the engine hands back for a request that reached a channel and succeeded.
pub struct GatewayResponse {
    pub request_id: String,
    pub status: u16,
    pub headers: HeaderMap,
    pub body: ResponseBody,
    /// `None` when the response came from the cache without contacting a channel.
    pub channel_id: Option<String>,
    pub cache: Option<CacheStatus>,
    pub attempts: u32,
}

impl std::fmt::Debug for GatewayResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayResponse")
            .field("request_id", &self.request_id)
            .field("status", &self.status)
            .field("channel_id", &self.channel_id)
            .field("cache", &self.cache)
            .field("attempts", &self.attempts)
            .field("body", &self.body)
            .finish()
    }
}

/// Served at `GET /status`.
#[derive(Clone, Debug, Serialize)]
pub struct GatewayStatus {
    pub observability: ObservabilitySnapshot,
    pub accounting: AccountingStats,
    pub channels: usize,
    pub models: usize,
    pub health: HealthSnapshot,
}

pub struct GatewayBuilder {
    config: GatewayConfig,
    store: Option<Arc<dyn PersistentStore>>,
    auth: Option<Arc<dyn AuthProvider>>,
    counters: Option<Arc<dyn CounterStore>>,
    upstream: Option<Arc<dyn Upstream>>,
    random: Option<Arc<dyn RandomSource>>,
    clock: Option<Arc<dyn Clock>>,
    notifier: Option<Arc<dyn AlertNotifier>>,
    consume_levels: Option<Arc<dyn ConsumeLevelPolicy>>,
    usage_sink: Option<Arc<dyn UsageSink>>,
}

impl GatewayBuilder {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            store: None,
            auth: None,
            counters: None,
            upstream: None,
            random: None,
            clock: None,
            notifier: None,
            consume_levels: None,
            usage_sink: None,
        }
    }

    /// Replaces the in-memory store seeded from the config.
    pub fn store(mut self, store: Arc<dyn PersistentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn auth(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn counters(mut self, counters: Arc<dyn CounterStore>) -> Self {
        self.counters = Some(counters);
        self
    }

    pub fn upstream(mut self, upstream: Arc<dyn Upstream>) -> Self {
        self.upstream = Some(upstream);
        self
    }

    pub fn random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = Some(random);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn AlertNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn consume_levels(mut self, levels: Arc<dyn ConsumeLevelPolicy>) -> Self {
        self.consume_levels = Some(levels);
        self
    }

    /// Sends priced usage somewhere other than the gateway's own store.
    pub fn usage_sink(mut self, sink: Arc<dyn UsageSink>) -> Self {
        self.usage_sink = Some(sink);
        self
    }

    /// Wires every component and loads the initial routing table and model catalog.
    /// Must run inside a tokio runtime: the accounting workers are spawned here.
    pub async fn build(self) -> Result<Gateway> {
        let GatewayBuilder {
            config,
            store,
            auth,
            counters,
            upstream,
            random,
            clock,
            notifier,
            consume_levels,
            usage_sink,
        } = self;

        let clock = clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = match store {
            Some(store) => store,
            None => Arc::new(MemoryStore::seeded(
                config.tenants.iter().cloned(),
                config.principals.iter().cloned(),
                config.channels.iter().cloned(),
                config.models.iter().cloned(),
            )?),
        };
        let store = Arc::new(CachedStore::new(store));
        let auth = auth.unwrap_or_else(|| Arc::new(StoreAuthProvider::new(store.clone())));

        let counters = match counters {
            Some(counters) => counters,
            None => counter_store(&config)?,
        };
        let mut policy = PolicyGate::from_config(&config.policy, counters, clock.clone())
            .map_err(|err| ConduitError::Config(format!("policy: {err}")))?;
        if let Some(levels) = consume_levels {
            policy = policy.with_consume_levels(levels);
        }
        if let Some(notifier) = notifier {
            policy = policy.with_notifier(notifier);
        }

        let channels = store.channels().await?;
        let models = store.models().await?;

        let affinity = Arc::new(AffinityTable::new(
            clock.clone(),
            config.routing.affinity_ttl_seconds,
            config.routing.affinity_capacity,
        ));
        let resolver = ModelResolver::new(
            Arc::new(ModelCatalog::new(models.iter().cloned())),
            affinity.clone(),
            config.retry.clone(),
        );

        let health = Arc::new(HealthRegistry::new(
            config.routing.health.clone(),
            clock.clone(),
        ));
        let random = random.unwrap_or_else(|| Arc::new(SystemRandom::default()));
        let selector = ChannelSelector::new(
            RoutingTable::new(channels.iter().cloned()),
            health.clone(),
            random,
            clock.clone(),
        );

        let observability = Arc::new(Observability::default());
        let upstream = match upstream {
            Some(upstream) => upstream,
            None => Arc::new(HttpUpstream::new()?),
        };
        let channel_recorder = ChannelRecorder::new(health.clone(), observability.clone());
        let pipeline = ExecutionPipeline::builder(upstream)
            .standard(&config.pipeline, health, observability.clone(), clock.clone())
            .build();

        let sink: Arc<dyn UsageSink> = match usage_sink {
            Some(sink) => sink,
            None => store.clone() as Arc<dyn UsageSink>,
        };
        let accountant = Arc::new(UsageAccountant::start(config.accounting.clone(), sink));

        tracing::info!(
            channels = channels.len(),
            models = models.len(),
            stages = ?pipeline.stage_names(),
            "gateway ready"
        );

        Ok(Gateway {
            store,
            auth,
            policy,
            resolver,
            selector,
            affinity,
            pipeline,
            channel_recorder,
            accountant,
            observability,
            clock,
            refresh_interval: Duration::from_secs(config.routing.refresh_interval_seconds.max(1)),
            refresh_task: Mutex::new(None),
        })
    }
}

#[cfg(feature = "gateway-store-redis")]
fn counter_store(config: &GatewayConfig) -> Result<Arc<dyn CounterStore>> {
    use super::limits::FallbackCounterStore;
    use super::redis_store::RedisCounterStore;

    let Some(url) = config.redis_url.as_deref() else {
        return Ok(Arc::new(MemoryCounterStore::new()));
    };
    let mut redis = RedisCounterStore::new(url)
        .map_err(|err| ConduitError::Config(format!("redis_url: {err}")))?;
    if let Some(prefix) = config.redis_prefix.as_deref() {
        redis = redis.with_prefix(prefix);
    }
    Ok(Arc::new(FallbackCounterStore::new(Arc::new(redis))))
}

#[cfg(not(feature = "gateway-store-redis"))]
fn counter_store(config: &GatewayConfig) -> Result<Arc<dyn CounterStore>> {
    if config.redis_url.is_some() {
        return Err(ConduitError::Config(
            "redis_url requires `--features gateway-store-redis`".into(),
        ));
    }
    Ok(Arc::new(MemoryCounterStore::new()))
}

pub struct Gateway {
    store: Arc<CachedStore>,
    auth: Arc<dyn AuthProvider>,
    policy: PolicyGate,
    resolver: ModelResolver,
    selector: ChannelSelector,
    affinity: Arc<AffinityTable>,
    pipeline: ExecutionPipeline,
    channel_recorder: ChannelRecorder,
    accountant: Arc<UsageAccountant>,
    observability: Arc<Observability>,
    clock: Arc<dyn Clock>,
    refresh_interval: Duration,
    refresh_task: Mutex<Option<AbortOnDrop>>,
}

impl Gateway {
    pub fn builder(config: GatewayConfig) -> GatewayBuilder {
        GatewayBuilder::new(config)
    }

    pub fn store(&self) -> &Arc<CachedStore> {
        &self.store
    }

    pub fn accountant(&self) -> &Arc<UsageAccountant> {
        &self.accountant
    }

    pub fn observability(&self) -> &Arc<Observability> {
        &self.observability
    }

    pub fn affinity(&self) -> &Arc<AffinityTable> {
        &self.affinity
    }

    pub fn selector(&self) -> &ChannelSelector {
        &self.selector
    }

    pub fn health(&self) -> &Arc<HealthRegistry> {
        self.selector.health()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn status(&self) -> GatewayStatus {
        GatewayStatus {
            observability: self.observability.snapshot(),
            accounting: self.accountant.stats(),
            channels: self.selector.table().channels().len(),
            models: self.resolver.catalog().len(),
            health: self.selector.health().snapshot().as_ref().clone(),
        }
    }

    /// Reloads channels and models from the store and republishes the health snapshot.
    /// On a store error the previous snapshots stay in place.
    pub async fn refresh(&self) -> std::result::Result<(), StoreError> {
        self.store.invalidate_all();
        let channels = self.store.channels().await?;
        let models = self.store.models().await?;

        self.selector
            .replace_table(RoutingTable::new(channels.iter().cloned()));
        self.resolver.catalog().replace(models.iter().cloned());

        let table = self.selector.table();
        let health = self.selector.health();
        health.retain_channels(&|channel_id| table.get(channel_id).is_some());
        health.refresh();
        Ok(())
    }

    /// Starts the periodic refresh task. The task stops once the gateway is dropped.
    pub fn start_background_refresh(self: &Arc<Self>) {
        let gateway = Arc::downgrade(self);
        let period = self.refresh_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(gateway) = gateway.upgrade() else {
                    break;
                };
                if let Err(err) = gateway.refresh().await {
                    tracing::warn!(
                        error = %err,
                        "routing refresh failed; keeping previous snapshot"
                    );
                }
            }
        });
        let guard = AbortOnDrop::new(handle.abort_handle());
        match self.refresh_task.lock() {
            Ok(mut slot) => *slot = Some(guard),
            Err(poisoned) => *poisoned.into_inner() = Some(guard),
        }
    }

    /// Stops background refresh and drains pending usage events.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let task = match self.refresh_task.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(task);
        self.accountant.drain(timeout).await
    }

    pub async fn handle(
        &self,
        request: InboundRequest,
    ) -> std::result::Result<GatewayResponse, GatewayError> {
        self.observability.record_request();
        let span = tracing::info_span!(
            "gateway_request",
            request_id = %request.request_id,
            tenant_id = tracing::field::Empty,
            model = tracing::field::Empty,
            channel = tracing::field::Empty,
            status = tracing::field::Empty,
            cache = tracing::field::Empty,
        );

        let result = self.dispatch(request).instrument(span.clone()).await;
        match &result {
            Ok(response) => {
                self.observability.record_success();
                span.record("status", response.status);
            }
            Err(err) => {
                self.observability.record_error(err.category());
                span.record("status", err.code());
                tracing::info!(parent: &span, code = err.code(), error = %err, "request rejected");
            }
        }
        result
    }

    async fn dispatch(
        &self,
        request: InboundRequest,
    ) -> std::result::Result<GatewayResponse, GatewayError> {
        let span = tracing::Span::current();
        let credential = extract_credential(&request.headers).ok_or(GatewayError::Unauthenticated)?;
        let (tenant, principal) = self.auth.authenticate(credential).await?;
        span.record("tenant_id", tenant.id.as_str());

        let mut ctx = RequestContext::new(
            request.request_id.clone(),
            tenant,
            principal,
            self.clock.now_millis(),
        );
        let mut settlement = Settlement::new(
            &ctx,
            self.accountant.clone(),
            self.observability.clone(),
            self.clock.clone(),
        );

        let target = self.resolver.target(&request);
        let requested_model = target.as_ref().map(|target| target.model.clone());
        let model_config = requested_model
            .as_deref()
            .and_then(|model| self.resolver.catalog().get(model));

        let authorization = self
            .policy
            .authorize(AuthorizeInput {
                tenant: ctx.tenant(),
                principal: ctx.principal(),
                model: model_config.as_ref(),
                client_ip: request.client_ip,
                estimated_tokens: request.estimated_tokens(),
            })
            .await;
        match authorization {
            Ok(authorization) => tracing::debug!(
                effective_rpm = ?authorization.effective_rpm,
                effective_tpm = ?authorization.effective_tpm,
                "authorized"
            ),
            Err(err) => {
                settlement.reject(&err, requested_model);
                return Err(err);
            }
        }

        let resolved = match self.resolver.resolve_target(target, &ctx) {
            Ok(resolved) => resolved,
            Err(err) => {
                settlement.reject(&err, requested_model);
                return Err(err);
            }
        };
        span.record("model", resolved.name.as_str());
        settlement.model = Some(resolved.name.clone());
        settlement.pricing = Some(resolved.pricing.clone());

        self.run_attempts(&request, &mut ctx, &resolved, settlement)
            .await
    }

    async fn run_attempts(
        &self,
        request: &InboundRequest,
        ctx: &mut RequestContext,
        resolved: &ResolvedModel,
        mut settlement: Settlement,
    ) -> std::result::Result<GatewayResponse, GatewayError> {
        let mut retry = RetryCoordinator::new(resolved.retry.clone());
        let client_stream = request.stream_requested();
        let mut reuse_channel = false;
        let mut last_error: Option<UpstreamError> = None;

        while retry.begin_attempt() {
            let channel = match self.selector.select(&resolved.name, ctx, reuse_channel) {
                Ok(channel) => channel,
                Err(err) => match last_error.take() {
                    Some(upstream) => {
                        settlement.fail(&upstream);
                        return Err(GatewayError::Upstream(upstream));
                    }
                    None => {
                        settlement.reject(&err, None);
                        return Err(err);
                    }
                },
            };

            let upstream_request = UpstreamRequest {
                method: request.method.clone(),
                path_and_query: request.path_and_query.clone(),
                headers: request.headers.clone(),
                body: body_for_channel(&channel, &resolved.name, &request.body),
                stream: client_stream,
            };
            let trace = Arc::new(AttemptTrace::default());
            settlement.attempt_started(&channel.id, trace.clone());
            tracing::debug!(
                channel = %channel.id,
                attempt = retry.attempts(),
                pinned = ctx.pin().is_some(),
                "dispatching attempt"
            );

            let result = {
                let attempt = Attempt {
                    request_id: ctx.request_id(),
                    channel: &channel,
                    model: resolved,
                    request: upstream_request,
                    client_stream,
                    trace: &trace,
                };
                self.pipeline.execute(&attempt).await
            };
            settlement.attempt_finished();

            match result {
                Ok(response) => {
                    retry.on_success();
                    ctx.record_attempt(AttemptRecord {
                        channel_id: channel.id.clone(),
                        trace: (*trace).clone(),
                        failure: None,
                    });
                    let finished = Finished {
                        channel: &channel,
                        trace: &trace,
                        response,
                    };
                    return Ok(self.complete(request, ctx, resolved, finished, settlement));
                }
                Err(err) => {
                    ctx.record_attempt(AttemptRecord {
                        channel_id: channel.id.clone(),
                        trace: (*trace).clone(),
                        failure: Some(err.kind.code()),
                    });
                    tracing::debug!(
                        channel = %channel.id,
                        kind = err.kind.code(),
                        status = ?err.status,
                        error = %err.message,
                        "attempt failed"
                    );
                    let decision = retry.on_failure(ctx, &channel.id, &err, |ctx| {
                        self.selector.has_alternative(&resolved.name, ctx)
                    });
                    last_error = Some(err);
                    match decision {
                        RetryDecision::Retry {
                            backoff,
                            reuse_channel: reuse,
                        } => {
                            self.observability.record_retry();
                            reuse_channel = reuse;
                            if !backoff.is_zero() {
                                tokio::time::sleep(backoff).await;
                            }
                        }
                        RetryDecision::Stop(state) => {
                            tracing::debug!(
                                state = ?state,
                                attempts = retry.attempts(),
                                "retries stopped"
                            );
                            break;
                        }
                    }
                }
            }
        }

        let err = last_error
            .unwrap_or_else(|| UpstreamError::connection("no attempt could be dispatched"));
        settlement.fail(&err);
        Err(GatewayError::Upstream(err))
    }

    fn complete(
        &self,
        request: &InboundRequest,
        ctx: &RequestContext,
        resolved: &ResolvedModel,
        finished: Finished<'_>,
        mut settlement: Settlement,
    ) -> GatewayResponse {
        let Finished {
            channel,
            trace,
            response,
        } = finished;
        let span = tracing::Span::current();
        let cache = trace.cache.get().copied();
        if let Some(cache) = cache {
            span.record("cache", cache_label(cache));
        }

        // A cache hit never reached the selected channel: no attribution, no affinity.
        let (outcome, channel_id) = if trace.cache_hit() {
            (Outcome::CacheHit, None)
        } else {
            span.record("channel", channel.id.as_str());
            (Outcome::Success, Some(channel.id.clone()))
        };

        if channel_id.is_some() && is_stored_response_path(request.path()) {
            if let Some(response_id) = response.full_body().and_then(stored_response_id) {
                self.affinity.record(&response_id, &channel.id, &resolved.name);
            }
        }

        let UpstreamResponse {
            status,
            headers,
            body,
            usage,
        } = response;
        settlement.usage = usage.unwrap_or_default();
        let body = match body {
            ResponseBody::Full(bytes) => {
                settlement.settle(outcome, channel_id.clone());
                ResponseBody::Full(bytes)
            }
            ResponseBody::Stream(stream) => ResponseBody::Stream(Box::pin(MeteredStream {
                inner: self
                    .channel_recorder
                    .watch_stream(stream, channel.id.clone()),
                scanner: SseUsageScanner::default(),
                outcome,
                channel_id: channel.id.clone(),
                settlement: Some(settlement),
            })),
        };

        GatewayResponse {
            request_id: ctx.request_id().to_string(),
            status,
            headers,
            body,
            channel_id,
            cache,
            attempts: ctx.attempt_count(),
        }
    }
}

/// The attempt that produced a response.
struct Finished<'a> {
    channel: &'a Channel,
    trace: &'a AttemptTrace,
    response: UpstreamResponse,
}

fn cache_label(status: CacheStatus) -> &'static str {
    match status {
        CacheStatus::Hit => "hit",
        CacheStatus::Miss => "miss",
        CacheStatus::Bypass => "bypass",
    }
}

fn stored_response_id(body: &Bytes) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    if value.get("object").and_then(|object| object.as_str()) != Some("response") {
        return None;
    }
    value
        .get("id")
        .and_then(|id| id.as_str())
        .map(str::to_string)
}

/// The client body, or a derived copy when the channel knows the model by another name.
fn body_for_channel(channel: &Channel, model: &str, body: &Bytes) -> Bytes {
    let upstream_model = channel.upstream_model(model);
    if upstream_model == model {
        return body.clone();
    }
    let Ok(serde_json::Value::Object(mut object)) = serde_json::from_slice(body) else {
        return body.clone();
    };
    if !object.contains_key("model") {
        return body.clone();
    }
    object.insert(
        "model".to_string(),
        serde_json::Value::String(upstream_model.to_string()),
    );
    match serde_json::to_vec(&object) {
        Ok(bytes) => Bytes::from(bytes),
        Err(_) => body.clone(),
    }
}

/// Owns the single [`ConsumptionEvent`] of a request. Dropping it unsettled after a
/// channel was contacted reports the request as cancelled.
struct Settlement {
    accountant: Arc<UsageAccountant>,
    observability: Arc<Observability>,
    clock: Arc<dyn Clock>,
    request_id: String,
    tenant_id: String,
    principal_id: String,
    model: Option<String>,
    pricing: Option<ModelPricing>,
    started: Instant,
    attempts: u32,
    in_flight: Option<(String, Arc<AttemptTrace>)>,
    last_channel: Option<String>,
    contacted: Option<String>,
    usage: TokenUsage,
    settled: bool,
}

impl Settlement {
    fn new(
        ctx: &RequestContext,
        accountant: Arc<UsageAccountant>,
        observability: Arc<Observability>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            accountant,
            observability,
            clock,
            request_id: ctx.request_id().to_string(),
            tenant_id: ctx.tenant().id.clone(),
            principal_id: ctx.principal().id.clone(),
            model: None,
            pricing: None,
            started: Instant::now(),
            attempts: 0,
            in_flight: None,
            last_channel: None,
            contacted: None,
            usage: TokenUsage::default(),
            settled: false,
        }
    }

    fn attempt_started(&mut self, channel_id: &str, trace: Arc<AttemptTrace>) {
        self.attempts = self.attempts.saturating_add(1);
        self.last_channel = Some(channel_id.to_string());
        self.in_flight = Some((channel_id.to_string(), trace));
    }

    fn attempt_finished(&mut self) {
        if let Some((channel_id, trace)) = self.in_flight.take() {
            if trace.contacted_upstream() {
                self.contacted = Some(channel_id);
            }
        }
    }

    fn reject(&mut self, err: &GatewayError, model: Option<String>) {
        if self.model.is_none() {
            self.model = model;
        }
        self.settle(
            Outcome::Rejected {
                reason: err.code().to_string(),
            },
            None,
        );
    }

    fn fail(&mut self, err: &UpstreamError) {
        let channel = self.contacted.clone().or_else(|| self.last_channel.clone());
        self.settle(
            Outcome::UpstreamFailure {
                kind: err.kind.code().to_string(),
                status: err.status,
            },
            channel,
        );
    }

    fn settle(&mut self, outcome: Outcome, channel_id: Option<String>) {
        if self.settled {
            return;
        }
        self.settled = true;
        let event = ConsumptionEvent {
            request_id: self.request_id.clone(),
            tenant_id: self.tenant_id.clone(),
            principal_id: self.principal_id.clone(),
            channel_id,
            model: self.model.clone(),
            usage: self.usage,
            pricing: self.pricing.clone(),
            outcome,
            attempts: self.attempts,
            latency_ms: u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX),
            timestamp_ms: self.clock.now_millis(),
        };
        self.accountant.record(event);
    }
}

impl Drop for Settlement {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.attempt_finished();
        let Some(channel_id) = self.contacted.clone() else {
            self.settled = true;
            return;
        };
        self.observability.record_cancelled();
        tracing::info!(
            request_id = %self.request_id,
            channel = %channel_id,
            "request cancelled after reaching a channel"
        );
        self.settle(Outcome::Cancelled, Some(channel_id));
    }
}

/// Passes a streamed body through while watching it for usage; settles the request
/// when the stream ends, fails, or is dropped by the client.
struct MeteredStream {
    inner: ByteStream,
    scanner: SseUsageScanner,
    outcome: Outcome,
    channel_id: String,
    settlement: Option<Settlement>,
}

impl Stream for MeteredStream {
    type Item = std::result::Result<Bytes, UpstreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let polled = this.inner.as_mut().poll_next(cx);
        match &polled {
            Poll::Ready(Some(Ok(chunk))) => {
                this.scanner.feed(chunk);
                if let (Some(usage), Some(settlement)) =
                    (this.scanner.usage(), this.settlement.as_mut())
                {
                    settlement.usage = usage;
                }
            }
            Poll::Ready(Some(Err(err))) => {
                if let Some(mut settlement) = this.settlement.take() {
                    tracing::warn!(
                        request_id = %settlement.request_id,
                        channel = %this.channel_id,
                        error = %err,
                        "stream ended early"
                    );
                    settlement.settle(Outcome::Cancelled, Some(this.channel_id.clone()));
                }
            }
            Poll::Ready(None) => {
                if let Some(mut settlement) = this.settlement.take() {
                    settlement.settle(this.outcome.clone(), Some(this.channel_id.clone()));
                }
            }
            Poll::Pending => {}
        }
        polled
    }
}
