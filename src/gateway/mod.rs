//! Multi-tenant request distribution and execution engine.
//!
//! Request flow: [`PolicyGate`] → [`ModelResolver`] → ([`ChannelSelector`] →
//! [`ExecutionPipeline`]) repeated under a [`RetryCoordinator`] → [`UsageAccountant`].

pub mod accounting;
pub mod affinity;
pub mod config;
pub mod context;
pub mod costing;
pub mod engine;
pub mod health;
pub mod http;
pub mod limits;
pub mod observability;
pub mod pipeline;
pub mod policy;
#[cfg(feature = "gateway-store-redis")]
pub mod redis_store;
pub mod resolver;
pub mod retry;
pub mod router;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod upstream;

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use thiserror::Error;

pub use accounting::{AccountingConfig, AccountingStats, UsageAccountant, UsageRecord, UsageSink};
pub use affinity::AffinityTable;
pub use config::{GatewayConfig, RoutingConfig};
pub use context::{AttemptTrace, CacheStatus, ChannelPin, InboundRequest, PinSource, RequestContext};
pub use costing::{ModelPricing, PricingTable};
pub use engine::{Gateway, GatewayBuilder, GatewayResponse, GatewayStatus, generate_request_id};
pub use health::{HealthConfig, HealthRegistry, HealthSnapshot};
pub use http::GatewayHttpState;
pub use limits::{CounterStore, CounterStoreError, FallbackCounterStore, MemoryCounterStore};
pub use observability::{Observability, ObservabilitySnapshot};
pub use pipeline::{Attempt, ExecutionPipeline, PipelineBuilder, PipelineConfig, Stage};
pub use policy::{
    AlertNotifier, AuthorizeInput, Authorization, BalanceAlert, ConsumeLevelPolicy, ConsumeTier,
    PolicyConfig, PolicyGate, TieredConsumeLevels,
};
#[cfg(feature = "gateway-store-redis")]
pub use redis_store::RedisCounterStore;
pub use resolver::{ModelCatalog, ModelResolver, ModelTarget};
pub use retry::{RetryCoordinator, RetryDecision, RetryState};
pub use router::{ChannelSelector, RandomSource, RoutingTable, SeededRandom, SystemRandom};
pub use store::{
    AuthProvider, CachedStore, MemoryStore, PersistentStore, StoreAuthProvider, StoreError,
    extract_credential,
};
pub use telemetry::{TelemetryGuard, TelemetryOptions, init_tracing};
pub use types::{
    Channel, ConsumptionEvent, ModelConfig, Outcome, Principal, PrincipalLimits, PrincipalQuota,
    ResolvedModel, RetryPolicy, Tenant, TenantStatus, TokenUsage,
};
pub use upstream::{HttpUpstream, Upstream, UpstreamError, UpstreamErrorKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAxis {
    Requests,
    Tokens,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RateLimitInfo {
    pub axis: RateLimitAxis,
    /// `tenant` or `principal`.
    pub scope: &'static str,
    pub limit: u64,
    pub remaining: u64,
    pub reset_epoch_seconds: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Auth,
    Policy,
    Resolution,
    Dispatch,
    Upstream,
    Internal,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Auth => "auth",
            ErrorCategory::Policy => "policy",
            ErrorCategory::Resolution => "resolution",
            ErrorCategory::Dispatch => "dispatch",
            ErrorCategory::Upstream => "upstream",
            ErrorCategory::Internal => "internal",
        }
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("missing or invalid credential")]
    Unauthenticated,
    #[error("{subject} is disabled")]
    Disabled { subject: &'static str },
    #[error("client address {ip} is not allowed for this key")]
    IpNotAllowed { ip: String },
    #[error("insufficient balance: balance_usd_micros={balance_usd_micros}")]
    InsufficientBalance { balance_usd_micros: i64 },
    #[error("{scope} quota exceeded: limit_usd_micros={limit} used_usd_micros={used}")]
    QuotaExceeded {
        scope: &'static str,
        limit: u64,
        used: u64,
    },
    #[error("rate limit exceeded: {}>{}", rate_limit_axis_name(.0.axis), .0.limit)]
    RateLimited(RateLimitInfo),
    #[error("request does not name a model")]
    MissingModel,
    #[error("unknown model: {model}")]
    UnknownModel { model: String },
    #[error("model not allowed for this key: {model}")]
    ForbiddenModel { model: String },
    #[error("no available channel for {model}")]
    NoAvailableChannel { model: String },
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
    #[error("internal error: {message}")]
    Internal { message: String },
}

fn rate_limit_axis_name(axis: RateLimitAxis) -> &'static str {
    match axis {
        RateLimitAxis::Requests => "rpm",
        RateLimitAxis::Tokens => "tpm",
    }
}

impl GatewayError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            GatewayError::Unauthenticated
            | GatewayError::Disabled { .. }
            | GatewayError::IpNotAllowed { .. } => ErrorCategory::Auth,
            GatewayError::InsufficientBalance { .. }
            | GatewayError::QuotaExceeded { .. }
            | GatewayError::RateLimited(_) => ErrorCategory::Policy,
            GatewayError::MissingModel
            | GatewayError::UnknownModel { .. }
            | GatewayError::ForbiddenModel { .. }
            | GatewayError::InvalidRequest { .. } => ErrorCategory::Resolution,
            GatewayError::NoAvailableChannel { .. } => ErrorCategory::Dispatch,
            GatewayError::Upstream(_) => ErrorCategory::Upstream,
            GatewayError::Internal { .. } => ErrorCategory::Internal,
        }
    }

    /// Short machine-readable reason, used as the `code` of error bodies and in usage events.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Unauthenticated => "invalid_api_key",
            GatewayError::Disabled { .. } => "account_disabled",
            GatewayError::IpNotAllowed { .. } => "ip_not_allowed",
            GatewayError::InsufficientBalance { .. } => "insufficient_balance",
            GatewayError::QuotaExceeded { .. } => "quota_exceeded",
            GatewayError::RateLimited(_) => "rate_limited",
            GatewayError::MissingModel => "model_required",
            GatewayError::UnknownModel { .. } => "model_not_found",
            GatewayError::ForbiddenModel { .. } => "model_not_allowed",
            GatewayError::NoAvailableChannel { .. } => "no_available_channel",
            GatewayError::Upstream(err) => err.kind.code(),
            GatewayError::InvalidRequest { .. } => "invalid_request",
            GatewayError::Internal { .. } => "internal_error",
        }
    }
}

pub trait Clock: Send + Sync {
    fn now_epoch_seconds(&self) -> u64;

    fn now_millis(&self) -> u64 {
        self.now_epoch_seconds().saturating_mul(1000)
    }
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_seconds(&self) -> u64 {
        self.now_millis() / 1000
    }

    fn now_millis(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|duration| duration.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Settable clock for tests and replay tooling.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    pub fn new(epoch_seconds: u64) -> Self {
        Self {
            millis: AtomicU64::new(epoch_seconds.saturating_mul(1000)),
        }
    }

    pub fn set(&self, epoch_seconds: u64) {
        self.millis
            .store(epoch_seconds.saturating_mul(1000), Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: u64) {
        self.millis
            .fetch_add(seconds.saturating_mul(1000), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_epoch_seconds(&self) -> u64 {
        self.now_millis() / 1000
    }

    fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_follow_the_error_taxonomy() {
        assert_eq!(
            GatewayError::Disabled { subject: "tenant" }.category(),
            ErrorCategory::Auth
        );
        assert_eq!(
            GatewayError::InsufficientBalance {
                balance_usd_micros: 0
            }
            .category(),
            ErrorCategory::Policy
        );
        assert_eq!(
            GatewayError::ForbiddenModel {
                model: "m".to_string()
            }
            .category(),
            ErrorCategory::Resolution
        );
        assert_eq!(
            GatewayError::NoAvailableChannel {
                model: "m".to_string()
            }
            .category(),
            ErrorCategory::Dispatch
        );
        assert_eq!(
            GatewayError::from(UpstreamError::timeout("slow")).category(),
            ErrorCategory::Upstream
        );
    }

    #[test]
    fn rate_limited_message_names_the_axis() {
        let err = GatewayError::RateLimited(RateLimitInfo {
            axis: RateLimitAxis::Requests,
            scope: "tenant",
            limit: 10,
            remaining: 0,
            reset_epoch_seconds: 60,
        });
        assert_eq!(err.to_string(), "rate limit exceeded: rpm>10");
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(100);
        clock.advance(5);
        assert_eq!(clock.now_epoch_seconds(), 105);
        assert_eq!(clock.now_millis(), 105_000);
    }
}
