use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt as _;
use tokio::time::Instant;

use super::{Attempt, Next, Stage};
use crate::gateway::health::{CallOutcome, HealthRegistry};
use crate::gateway::observability::Observability;
use crate::gateway::upstream::{ByteStream, UpstreamError, UpstreamErrorKind, UpstreamResponse};

/// Feeds call outcomes into channel health and counts the bans they trigger.
#[derive(Clone)]
pub struct ChannelRecorder {
    health: Arc<HealthRegistry>,
    observability: Arc<Observability>,
}

impl ChannelRecorder {
    pub fn new(health: Arc<HealthRegistry>, observability: Arc<Observability>) -> Self {
        Self {
            health,
            observability,
        }
    }

    pub fn record(&self, channel_id: &str, outcome: CallOutcome, message: Option<&str>) {
        if self.health.record(channel_id, outcome, message).is_some() {
            self.observability.record_channel_ban();
        }
    }

    /// A streamed body that ends in an error (idle timeout, dropped connection) counts
    /// as a failed call for the channel even though its headers arrived fine.
    pub fn watch_stream(&self, stream: ByteStream, channel_id: String) -> ByteStream {
        let recorder = self.clone();
        stream
            .inspect(move |item| {
                if let Err(err) = item {
                    tracing::debug!(
                        channel = %channel_id,
                        kind = err.kind.code(),
                        error = %err.message,
                        "streamed body failed"
                    );
                    recorder.record(
                        &channel_id,
                        CallOutcome::Failure(err.kind),
                        Some(&err.message),
                    );
                }
            })
            .boxed()
    }
}

/// Innermost stage: marks the attempt as having reached the upstream, times it and
/// feeds the outcome into channel health.
pub struct MonitorStage {
    recorder: ChannelRecorder,
    observability: Arc<Observability>,
}

impl MonitorStage {
    pub fn new(health: Arc<HealthRegistry>, observability: Arc<Observability>) -> Self {
        Self {
            recorder: ChannelRecorder::new(health, observability.clone()),
            observability,
        }
    }

    fn record(&self, channel_id: &str, outcome: CallOutcome, message: Option<&str>) {
        self.recorder.record(channel_id, outcome, message);
    }
}

/// Settles the attempt when the call future is dropped before finishing. A drop at
/// or past the deadline is a timeout against the channel; an earlier one is the
/// client going away and says nothing about the channel.
struct InFlight<'a> {
    stage: &'a MonitorStage,
    channel_id: &'a str,
    started: Instant,
    deadline: Option<Duration>,
    settled: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let elapsed = self.started.elapsed();
        match self.deadline {
            Some(deadline) if elapsed >= deadline => {
                self.stage.record(
                    self.channel_id,
                    CallOutcome::Failure(UpstreamErrorKind::Timeout),
                    Some("deadline exceeded"),
                );
            }
            _ => {
                tracing::debug!(
                    channel = %self.channel_id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "upstream call abandoned before completion"
                );
            }
        }
    }
}

#[async_trait]
impl Stage for MonitorStage {
    fn name(&self) -> &'static str {
        "monitor"
    }

    async fn around(
        &self,
        attempt: &Attempt<'_>,
        next: Next<'_>,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let _ = attempt.trace.upstream_contacted.set(true);
        self.observability.record_upstream_attempt();

        let mut in_flight = InFlight {
            stage: self,
            channel_id: &attempt.channel.id,
            started: Instant::now(),
            deadline: attempt.trace.deadline.get().copied(),
            settled: false,
        };
        let result = next.run(attempt).await;
        in_flight.settled = true;
        let latency = in_flight.started.elapsed();
        let _ = attempt.trace.latency.set(latency);

        match &result {
            Ok(_) => self.record(&attempt.channel.id, CallOutcome::Success, None),
            Err(err) => {
                tracing::debug!(
                    request_id = %attempt.request_id,
                    channel = %attempt.channel.id,
                    kind = err.kind.code(),
                    status = ?err.status,
                    latency_ms = latency.as_millis() as u64,
                    "upstream attempt failed"
                );
                self.record(
                    &attempt.channel.id,
                    CallOutcome::Failure(err.kind),
                    Some(&err.message),
                );
            }
        }
        result
    }
}
