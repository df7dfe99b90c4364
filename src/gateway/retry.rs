use std::time::Duration;

use serde::Serialize;

use super::context::RequestContext;
use super::types::RetryPolicy;
use super::upstream::UpstreamError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryState {
    Pending,
    Retrying,
    Success,
    ExhaustedRetries,
    NonRetryableError,
}

impl RetryState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RetryState::Success | RetryState::ExhaustedRetries | RetryState::NonRetryableError
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again. `reuse_channel` is set when no alternative was left and the policy
    /// permits hitting the same channel again after `backoff`.
    Retry {
        backoff: Duration,
        reuse_channel: bool,
    },
    Stop(RetryState),
}

/// Per-request retry state machine. Attempts are strictly sequential.
#[derive(Debug)]
pub struct RetryCoordinator {
    policy: RetryPolicy,
    state: RetryState,
    attempts: u32,
    same_channel_retries: u32,
}

impl RetryCoordinator {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: RetryState::Pending,
            attempts: 0,
            same_channel_retries: 0,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn state(&self) -> RetryState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.policy.max_retries.saturating_add(1)
    }

    /// Call right before dispatching. Returns `false` once the attempt budget is spent.
    pub fn begin_attempt(&mut self) -> bool {
        if self.state.is_terminal() || self.attempts >= self.max_attempts() {
            return false;
        }
        self.attempts += 1;
        true
    }

    pub fn on_success(&mut self) -> RetryState {
        self.state = RetryState::Success;
        self.state
    }

    /// Classifies a failed attempt. The failed channel is excluded from the request
    /// before `has_alternative` is asked whether anything else is eligible.
    pub fn on_failure(
        &mut self,
        ctx: &mut RequestContext,
        channel_id: &str,
        error: &UpstreamError,
        has_alternative: impl FnOnce(&RequestContext) -> bool,
    ) -> RetryDecision {
        ctx.exclude(channel_id);

        if !error.is_retryable() {
            self.state = RetryState::NonRetryableError;
            return RetryDecision::Stop(self.state);
        }
        if self.attempts >= self.max_attempts() {
            self.state = RetryState::ExhaustedRetries;
            return RetryDecision::Stop(self.state);
        }

        if has_alternative(ctx) {
            self.state = RetryState::Retrying;
            return RetryDecision::Retry {
                backoff: Duration::ZERO,
                reuse_channel: false,
            };
        }
        if self.policy.allow_same_channel {
            let backoff = self.backoff(self.same_channel_retries);
            self.same_channel_retries = self.same_channel_retries.saturating_add(1);
            self.state = RetryState::Retrying;
            return RetryDecision::Retry {
                backoff,
                reuse_channel: true,
            };
        }

        self.state = RetryState::ExhaustedRetries;
        RetryDecision::Stop(self.state)
    }

    /// `base · 2^n`, capped at the policy maximum.
    pub fn backoff(&self, n: u32) -> Duration {
        let factor = 1u64.checked_shl(n.min(32)).unwrap_or(u64::MAX);
        let millis = self
            .policy
            .backoff_base_ms
            .saturating_mul(factor)
            .min(self.policy.backoff_max_ms);
        Duration::from_millis(millis)
    }
}
