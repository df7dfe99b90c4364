use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

use super::{Attempt, Next, Stage};
use crate::gateway::upstream::{ByteStream, ResponseBody, UpstreamError, UpstreamResponse};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Whole-call deadline for blocking requests. A channel's `timeout_seconds` overrides it.
    #[serde(default = "default_request_seconds")]
    pub request_seconds: u64,
    /// Deadline until a streamed response starts.
    #[serde(default = "default_stream_first_byte_seconds")]
    pub stream_first_byte_seconds: u64,
    /// Longest silence tolerated between two chunks of a running stream.
    #[serde(default = "default_stream_idle_seconds")]
    pub stream_idle_seconds: u64,
}

fn default_request_seconds() -> u64 {
    120
}

fn default_stream_first_byte_seconds() -> u64 {
    300
}

fn default_stream_idle_seconds() -> u64 {
    60
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_seconds: default_request_seconds(),
            stream_first_byte_seconds: default_stream_first_byte_seconds(),
            stream_idle_seconds: default_stream_idle_seconds(),
        }
    }
}

pub struct TimeoutStage {
    config: TimeoutConfig,
}

impl TimeoutStage {
    pub fn new(config: TimeoutConfig) -> Self {
        Self { config }
    }

    pub fn deadline_for(&self, attempt: &Attempt<'_>) -> Duration {
        let seconds = if attempt.client_stream {
            self.config.stream_first_byte_seconds
        } else {
            attempt
                .channel
                .timeout_seconds
                .unwrap_or(self.config.request_seconds)
        };
        Duration::from_secs(seconds.max(1))
    }
}

#[async_trait]
impl Stage for TimeoutStage {
    fn name(&self) -> &'static str {
        "timeout"
    }

    async fn around(
        &self,
        attempt: &Attempt<'_>,
        next: Next<'_>,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let deadline = self.deadline_for(attempt);
        let _ = attempt.trace.deadline.set(deadline);

        let mut response = match tokio::time::timeout(deadline, next.run(attempt)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(UpstreamError::timeout(format!(
                    "channel {} did not answer within {}s",
                    attempt.channel.id,
                    deadline.as_secs()
                )));
            }
        };

        if let ResponseBody::Stream(stream) = response.body {
            let idle = Duration::from_secs(self.config.stream_idle_seconds.max(1));
            response.body = ResponseBody::Stream(with_idle_timeout(stream, idle));
        }
        Ok(response)
    }
}

/// Ends the stream with a timeout error when no chunk arrives within `idle`.
pub fn with_idle_timeout(stream: ByteStream, idle: Duration) -> ByteStream {
    futures_util::stream::unfold(Some(stream), move |state| async move {
        let mut stream = state?;
        match tokio::time::timeout(idle, stream.next()).await {
            Ok(Some(item)) => Some((item, Some(stream))),
            Ok(None) => None,
            Err(_) => Some((
                Err(UpstreamError::timeout(format!(
                    "stream stalled for more than {}s",
                    idle.as_secs()
                ))),
                None,
            )),
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::http::{HeaderMap, Method};
    use bytes::Bytes;

    use super::*;
    use crate::gateway::context::AttemptTrace;
    use crate::gateway::pipeline::ExecutionPipeline;
    use crate::gateway::types::{Channel, ModelConfig, RetryPolicy};
    use crate::gateway::upstream::{Upstream, UpstreamErrorKind, UpstreamRequest};

    struct Hang;

    #[async_trait]
    impl Upstream for Hang {
        async fn send(
            &self,
            _channel: &Channel,
            _request: &UpstreamRequest,
        ) -> Result<UpstreamResponse, UpstreamError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hung_call_times_out_at_the_channel_deadline() {
        let pipeline = ExecutionPipeline::builder(Arc::new(Hang))
            .stage(Arc::new(TimeoutStage::new(TimeoutConfig::default())))
            .build();
        let mut channel = Channel::new("slow", "http://slow");
        channel.timeout_seconds = Some(3);
        let model = ModelConfig::new("m").merged_for("t", &RetryPolicy::default());
        let trace = AttemptTrace::default();
        let attempt = Attempt {
            request_id: "r",
            channel: &channel,
            model: &model,
            request: UpstreamRequest {
                method: Method::POST,
                path_and_query: "/v1/chat/completions".to_string(),
                headers: HeaderMap::new(),
                body: Bytes::from_static(b"{}"),
                stream: false,
            },
            client_stream: false,
            trace: &trace,
        };

        let started = tokio::time::Instant::now();
        let err = pipeline.execute(&attempt).await.unwrap_err();
        assert_eq!(err.kind, UpstreamErrorKind::Timeout);
        assert_eq!(started.elapsed(), Duration::from_secs(3));
        assert_eq!(trace.deadline.get(), Some(&Duration::from_secs(3)));
    }

    #[test]
    fn streaming_requests_get_the_stream_deadline() {
        let stage = TimeoutStage::new(TimeoutConfig {
            request_seconds: 10,
            stream_first_byte_seconds: 90,
            stream_idle_seconds: 5,
        });
        let channel = Channel::new("c", "http://c");
        let model = ModelConfig::new("m").merged_for("t", &RetryPolicy::default());
        let trace = AttemptTrace::default();
        let attempt = Attempt {
            request_id: "r",
            channel: &channel,
            model: &model,
            request: UpstreamRequest {
                method: Method::POST,
                path_and_query: "/".to_string(),
                headers: HeaderMap::new(),
                body: Bytes::new(),
                stream: true,
            },
            client_stream: true,
            trace: &trace,
        };
        assert_eq!(stage.deadline_for(&attempt), Duration::from_secs(90));
        let blocking = Attempt {
            client_stream: false,
            ..attempt.clone()
        };
        assert_eq!(stage.deadline_for(&blocking), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_stream_is_cut_after_idle_timeout() {
        let chunks = futures_util::stream::iter(vec![Ok(Bytes::from_static(b"data: a\n\n"))])
            .chain(futures_util::stream::pending())
            .boxed();
        let mut stream = with_idle_timeout(chunks, Duration::from_secs(5));
        assert!(stream.next().await.unwrap().is_ok());
        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind, UpstreamErrorKind::Timeout);
        assert!(stream.next().await.is_none());
    }
}
