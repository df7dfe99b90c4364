use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use super::ErrorCategory;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservabilitySnapshot {
    pub requests: u64,
    pub succeeded: u64,
    pub rejected_auth: u64,
    pub rejected_policy: u64,
    pub rejected_resolution: u64,
    pub rejected_dispatch: u64,
    pub upstream_failures: u64,
    pub internal_errors: u64,
    pub cache_hits: u64,
    pub upstream_attempts: u64,
    pub retries: u64,
    pub channel_bans: u64,
    pub stream_adaptations: u64,
    pub cancelled: u64,
}

/// Process-wide counters, shared by reference across request tasks.
#[derive(Debug, Default)]
pub struct Observability {
    requests: AtomicU64,
    succeeded: AtomicU64,
    rejected_auth: AtomicU64,
    rejected_policy: AtomicU64,
    rejected_resolution: AtomicU64,
    rejected_dispatch: AtomicU64,
    upstream_failures: AtomicU64,
    internal_errors: AtomicU64,
    cache_hits: AtomicU64,
    upstream_attempts: AtomicU64,
    retries: AtomicU64,
    channel_bans: AtomicU64,
    stream_adaptations: AtomicU64,
    cancelled: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Observability {
    pub fn record_request(&self) {
        bump(&self.requests);
    }

    pub fn record_success(&self) {
        bump(&self.succeeded);
    }

    pub fn record_error(&self, category: ErrorCategory) {
        bump(match category {
            ErrorCategory::Auth => &self.rejected_auth,
            ErrorCategory::Policy => &self.rejected_policy,
            ErrorCategory::Resolution => &self.rejected_resolution,
            ErrorCategory::Dispatch => &self.rejected_dispatch,
            ErrorCategory::Upstream => &self.upstream_failures,
            ErrorCategory::Internal => &self.internal_errors,
        });
    }

    pub fn record_cache_hit(&self) {
        bump(&self.cache_hits);
    }

    pub fn record_upstream_attempt(&self) {
        bump(&self.upstream_attempts);
    }

    pub fn record_retry(&self) {
        bump(&self.retries);
    }

    pub fn record_channel_ban(&self) {
        bump(&self.channel_bans);
    }

    pub fn record_stream_adaptation(&self) {
        bump(&self.stream_adaptations);
    }

    pub fn record_cancelled(&self) {
        bump(&self.cancelled);
    }

    pub fn snapshot(&self) -> ObservabilitySnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        ObservabilitySnapshot {
            requests: load(&self.requests),
            succeeded: load(&self.succeeded),
            rejected_auth: load(&self.rejected_auth),
            rejected_policy: load(&self.rejected_policy),
            rejected_resolution: load(&self.rejected_resolution),
            rejected_dispatch: load(&self.rejected_dispatch),
            upstream_failures: load(&self.upstream_failures),
            internal_errors: load(&self.internal_errors),
            cache_hits: load(&self.cache_hits),
            upstream_attempts: load(&self.upstream_attempts),
            retries: load(&self.retries),
            channel_bans: load(&self.channel_bans),
            stream_adaptations: load(&self.stream_adaptations),
            cancelled: load(&self.cancelled),
        }
    }
}
