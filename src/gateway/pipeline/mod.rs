//! Stages wrapped around the upstream call.
//!
//! A stage may answer from its pre-call hook (short-circuit) and/or wrap the rest
//! of the chain. Stages run in the order they were added; the upstream call sits
//! underneath the innermost stage.

mod cache;
mod monitor;
mod stream_adapt;
mod timeout;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::Clock;
use super::context::AttemptTrace;
use super::health::HealthRegistry;
use super::observability::Observability;
use super::types::{Channel, ResolvedModel};
use super::upstream::{Upstream, UpstreamError, UpstreamRequest, UpstreamResponse};

pub use cache::{CacheConfig, CacheStage, ResponseCache, cache_key};
pub use monitor::{ChannelRecorder, MonitorStage};
pub use stream_adapt::{StreamAdaptStage, StreamAdaptationConfig, synthesize_stream};
pub use timeout::{TimeoutConfig, TimeoutStage};

/// One try against one channel.
#[derive(Clone, Debug)]
pub struct Attempt<'a> {
    pub request_id: &'a str,
    pub channel: &'a Channel,
    pub model: &'a ResolvedModel,
    pub request: UpstreamRequest,
    /// What the client asked for, independent of what is sent upstream.
    pub client_stream: bool,
    pub trace: &'a AttemptTrace,
}

impl<'a> Attempt<'a> {
    pub fn with_request(&self, request: UpstreamRequest) -> Attempt<'a> {
        Attempt {
            request_id: self.request_id,
            channel: self.channel,
            model: self.model,
            request,
            client_stream: self.client_stream,
            trace: self.trace,
        }
    }
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Runs before any stage wraps the call. Returning a response skips the
    /// remaining hooks and the upstream call.
    async fn before(&self, _attempt: &Attempt<'_>) -> Option<UpstreamResponse> {
        None
    }

    async fn around(
        &self,
        attempt: &Attempt<'_>,
        next: Next<'_>,
    ) -> Result<UpstreamResponse, UpstreamError> {
        next.run(attempt).await
    }
}

/// The remainder of the chain below a stage.
pub struct Next<'a> {
    stages: &'a [Arc<dyn Stage>],
    upstream: &'a dyn Upstream,
}

impl Next<'_> {
    pub async fn run(self, attempt: &Attempt<'_>) -> Result<UpstreamResponse, UpstreamError> {
        match self.stages.split_first() {
            Some((stage, rest)) => {
                stage
                    .around(
                        attempt,
                        Next {
                            stages: rest,
                            upstream: self.upstream,
                        },
                    )
                    .await
            }
            None => {
                self.upstream
                    .send(attempt.channel, &attempt.request)
                    .await
            }
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub stream_adaptation: StreamAdaptationConfig,
}

pub struct ExecutionPipeline {
    stages: Vec<Arc<dyn Stage>>,
    upstream: Arc<dyn Upstream>,
}

impl ExecutionPipeline {
    pub fn builder(upstream: Arc<dyn Upstream>) -> PipelineBuilder {
        PipelineBuilder {
            stages: Vec::new(),
            upstream,
        }
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    pub async fn execute(&self, attempt: &Attempt<'_>) -> Result<UpstreamResponse, UpstreamError> {
        for stage in &self.stages {
            if let Some(response) = stage.before(attempt).await {
                tracing::debug!(
                    request_id = %attempt.request_id,
                    stage = stage.name(),
                    "pipeline short-circuited"
                );
                return Ok(response);
            }
        }
        Next {
            stages: &self.stages,
            upstream: self.upstream.as_ref(),
        }
        .run(attempt)
        .await
    }
}

pub struct PipelineBuilder {
    stages: Vec<Arc<dyn Stage>>,
    upstream: Arc<dyn Upstream>,
}

impl PipelineBuilder {
    pub fn stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    /// cache → timeout → stream adaptation → monitor.
    pub fn standard(
        self,
        config: &PipelineConfig,
        health: Arc<HealthRegistry>,
        observability: Arc<Observability>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut builder = self;
        if config.cache.enabled {
            builder = builder.stage(Arc::new(CacheStage::new(
                ResponseCache::new(config.cache.clone()),
                clock,
                observability.clone(),
            )));
        }
        builder = builder.stage(Arc::new(TimeoutStage::new(config.timeouts.clone())));
        if config.stream_adaptation.enabled {
            builder = builder.stage(Arc::new(StreamAdaptStage::new(
                config.stream_adaptation.clone(),
                observability.clone(),
            )));
        }
        builder.stage(Arc::new(MonitorStage::new(health, observability)))
    }

    pub fn build(self) -> ExecutionPipeline {
        ExecutionPipeline {
            stages: self.stages,
            upstream: self.upstream,
        }
    }
}
