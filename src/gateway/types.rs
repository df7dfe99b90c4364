use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use super::costing::ModelPricing;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    #[default]
    Enabled,
    Disabled,
    Internal,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    #[serde(default)]
    pub status: TenantStatus,
    /// Remaining prepaid balance. May go negative when usage lands after dispatch.
    #[serde(default)]
    pub balance_usd_micros: i64,
    #[serde(default = "default_ratio")]
    pub rpm_ratio: f64,
    #[serde(default = "default_ratio")]
    pub tpm_ratio: f64,
    /// Model patterns (`gpt-4o`, `gpt-*`, `*`) this tenant may call.
    #[serde(default)]
    pub allowed_models: BTreeSet<String>,
    #[serde(default)]
    pub usage: UsageCounters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance_alert_threshold_usd_micros: Option<i64>,
}

fn default_ratio() -> f64 {
    1.0
}

impl Tenant {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: TenantStatus::Enabled,
            balance_usd_micros: 0,
            rpm_ratio: 1.0,
            tpm_ratio: 1.0,
            allowed_models: BTreeSet::new(),
            usage: UsageCounters::default(),
            balance_alert_threshold_usd_micros: None,
        }
    }

    pub fn is_internal(&self) -> bool {
        self.status == TenantStatus::Internal
    }

    pub fn cumulative_spend_usd_micros(&self) -> u64 {
        self.usage.total_cost_usd_micros
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrincipalQuota {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_usd_micros: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub periodic_usd_micros: Option<u64>,
    /// Length of the periodic window; windows start at multiples of this value since the epoch.
    #[serde(default = "default_quota_window_seconds")]
    pub window_seconds: u64,
}

fn default_quota_window_seconds() -> u64 {
    24 * 60 * 60
}

impl Default for PrincipalQuota {
    fn default() -> Self {
        Self {
            total_usd_micros: None,
            periodic_usd_micros: None,
            window_seconds: default_quota_window_seconds(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PrincipalLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpm: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tpm: Option<u32>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub tenant_id: String,
    pub secret: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Explicit grants on top of the tenant's allowed models.
    #[serde(default)]
    pub allowed_models: BTreeSet<String>,
    /// CIDR entries (`10.0.0.0/8`, `2001:db8::/32`) or bare addresses. Empty allows any address.
    #[serde(default)]
    pub allowed_subnets: Vec<String>,
    #[serde(default)]
    pub quota: PrincipalQuota,
    #[serde(default)]
    pub limits: PrincipalLimits,
    #[serde(default)]
    pub usage: UsageCounters,
}

fn default_enabled() -> bool {
    true
}

impl std::fmt::Debug for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Principal")
            .field("id", &self.id)
            .field("tenant_id", &self.tenant_id)
            .field("secret", &"<redacted>")
            .field("enabled", &self.enabled)
            .field("allowed_models", &self.allowed_models)
            .field("allowed_subnets", &self.allowed_subnets)
            .field("quota", &self.quota)
            .field("limits", &self.limits)
            .field("usage", &self.usage)
            .finish()
    }
}

impl Principal {
    pub fn new(
        id: impl Into<String>,
        tenant_id: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            tenant_id: tenant_id.into(),
            secret: secret.into(),
            enabled: true,
            allowed_models: BTreeSet::new(),
            allowed_subnets: Vec::new(),
            quota: PrincipalQuota::default(),
            limits: PrincipalLimits::default(),
            usage: UsageCounters::default(),
        }
    }
}

/// Cumulative and periodic usage. Counters only grow inside a window; the periodic
/// part resets when an update lands in a later window.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounters {
    #[serde(default)]
    pub total_requests: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub total_cost_usd_micros: u64,
    #[serde(default)]
    pub period_start_epoch_seconds: u64,
    #[serde(default)]
    pub period_requests: u64,
    #[serde(default)]
    pub period_tokens: u64,
    #[serde(default)]
    pub period_cost_usd_micros: u64,
}

impl UsageCounters {
    pub fn window_start(now_epoch_seconds: u64, window_seconds: u64) -> u64 {
        let window_seconds = window_seconds.max(1);
        now_epoch_seconds - now_epoch_seconds % window_seconds
    }

    /// Periodic cost as seen at `now`: zero once the stored window has elapsed.
    pub fn period_cost_at(&self, now_epoch_seconds: u64, window_seconds: u64) -> u64 {
        if Self::window_start(now_epoch_seconds, window_seconds) == self.period_start_epoch_seconds
        {
            self.period_cost_usd_micros
        } else {
            0
        }
    }

    pub fn apply(
        &mut self,
        tokens: u64,
        cost_usd_micros: u64,
        at_epoch_seconds: u64,
        window_seconds: u64,
    ) {
        let window = Self::window_start(at_epoch_seconds, window_seconds);
        if window > self.period_start_epoch_seconds {
            self.period_start_epoch_seconds = window;
            self.period_requests = 0;
            self.period_tokens = 0;
            self.period_cost_usd_micros = 0;
        }

        self.total_requests = self.total_requests.saturating_add(1);
        self.total_tokens = self.total_tokens.saturating_add(tokens);
        self.total_cost_usd_micros = self.total_cost_usd_micros.saturating_add(cost_usd_micros);

        // A late event from an already closed window still counts toward the totals
        // but never toward (or backwards into) the current period.
        if window == self.period_start_epoch_seconds {
            self.period_requests = self.period_requests.saturating_add(1);
            self.period_tokens = self.period_tokens.saturating_add(tokens);
            self.period_cost_usd_micros =
                self.period_cost_usd_micros.saturating_add(cost_usd_micros);
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Re-attempt on an already excluded channel when nothing else is eligible.
    #[serde(default)]
    pub allow_same_channel: bool,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_max_retries() -> u32 {
    2
}

fn default_backoff_base_ms() -> u64 {
    100
}

fn default_backoff_max_ms() -> u64 {
    2_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            allow_same_channel: false,
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ModelOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpm_multiplier: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tpm_multiplier: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pricing: Option<ModelPricing>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cacheable: Option<bool>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpm: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tpm: Option<u32>,
    #[serde(default)]
    pub pricing: ModelPricing,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub cacheable: bool,
    /// Keyed by tenant id.
    #[serde(default)]
    pub tenant_overrides: HashMap<String, ModelOverride>,
}

impl ModelConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            rpm: None,
            tpm: None,
            pricing: ModelPricing::default(),
            retry: None,
            cacheable: false,
            tenant_overrides: HashMap::new(),
        }
    }

    /// Global config merged with the tenant's override layer.
    pub fn merged_for(&self, tenant_id: &str, default_retry: &RetryPolicy) -> ResolvedModel {
        let layer = self.tenant_overrides.get(tenant_id);
        let rpm_multiplier = layer.and_then(|layer| layer.rpm_multiplier).unwrap_or(1.0);
        let tpm_multiplier = layer.and_then(|layer| layer.tpm_multiplier).unwrap_or(1.0);
        ResolvedModel {
            name: self.name.clone(),
            rpm: self.rpm.map(|rpm| f64::from(rpm) * rpm_multiplier),
            tpm: self.tpm.map(|tpm| f64::from(tpm) * tpm_multiplier),
            pricing: layer
                .and_then(|layer| layer.pricing.clone())
                .unwrap_or_else(|| self.pricing.clone()),
            retry: layer
                .and_then(|layer| layer.retry.clone())
                .or_else(|| self.retry.clone())
                .unwrap_or_else(|| default_retry.clone()),
            cacheable: layer
                .and_then(|layer| layer.cacheable)
                .unwrap_or(self.cacheable),
        }
    }
}

/// The merged view every stage after resolution reads.
#[derive(Clone, Debug, Serialize)]
pub struct ResolvedModel {
    pub name: String,
    /// Base limit already scaled by the tenant override.
    pub rpm: Option<f64>,
    pub tpm: Option<f64>,
    pub pricing: ModelPricing,
    pub retry: RetryPolicy,
    pub cacheable: bool,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub models: BTreeSet<String>,
    /// Ancillary capabilities (`embeddings`, `images`, `moderations`, ...).
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default = "default_priority_weight")]
    pub priority_weight: u32,
    #[serde(default = "default_enabled")]
    pub supports_streaming: bool,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Client-facing model name to upstream model name.
    #[serde(default)]
    pub model_map: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

fn default_priority_weight() -> u32 {
    1
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("base_url", &self.base_url)
            .field("enabled", &self.enabled)
            .field("models", &self.models)
            .field("capabilities", &self.capabilities)
            .field("priority_weight", &self.priority_weight)
            .field("supports_streaming", &self.supports_streaming)
            .field("headers", &"<redacted>")
            .field("model_map", &self.model_map)
            .field("timeout_seconds", &self.timeout_seconds)
            .finish()
    }
}

impl Channel {
    pub fn new(id: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            base_url: base_url.into(),
            enabled: true,
            models: BTreeSet::new(),
            capabilities: BTreeSet::new(),
            priority_weight: 1,
            supports_streaming: true,
            headers: BTreeMap::new(),
            model_map: BTreeMap::new(),
            timeout_seconds: None,
        }
    }

    pub fn with_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.models = models.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.priority_weight = weight;
        self
    }

    pub fn supports_model(&self, model: &str) -> bool {
        self.models
            .iter()
            .any(|pattern| model_pattern_matches(pattern, model))
    }

    pub fn supports_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    pub fn upstream_model<'a>(&'a self, model: &'a str) -> &'a str {
        self.model_map
            .get(model)
            .map(String::as_str)
            .unwrap_or(model)
    }
}

/// `*` matches anything, a trailing `*` matches by prefix, anything else matches exactly.
pub fn model_pattern_matches(pattern: &str, model: &str) -> bool {
    let pattern = pattern.trim();
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => model.starts_with(prefix),
        None => pattern == model,
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        u64::from(self.input_tokens) + u64::from(self.output_tokens)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    CacheHit,
    Rejected { reason: String },
    UpstreamFailure { kind: String, status: Option<u16> },
    Cancelled,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsumptionEvent {
    pub request_id: String,
    pub tenant_id: String,
    pub principal_id: String,
    /// `None` when the request never reached a channel.
    pub channel_id: Option<String>,
    pub model: Option<String>,
    pub usage: TokenUsage,
    /// Pricing captured at dispatch time; the accountant computes the cost from it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pricing: Option<ModelPricing>,
    pub outcome: Outcome,
    pub attempts: u32,
    pub latency_ms: u64,
    pub timestamp_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_counters_reset_exactly_at_window_boundary() {
        let mut usage = UsageCounters::default();
        usage.apply(10, 100, 3_599, 3_600);
        usage.apply(5, 50, 3_599, 3_600);
        assert_eq!(usage.period_cost_usd_micros, 150);
        assert_eq!(usage.period_cost_at(3_599, 3_600), 150);
        assert_eq!(usage.period_cost_at(3_600, 3_600), 0);

        usage.apply(1, 7, 3_600, 3_600);
        assert_eq!(usage.period_start_epoch_seconds, 3_600);
        assert_eq!(usage.period_cost_usd_micros, 7);
        assert_eq!(usage.period_requests, 1);
        assert_eq!(usage.total_cost_usd_micros, 157);
        assert_eq!(usage.total_requests, 3);
    }

    #[test]
    fn late_events_do_not_rewind_the_period() {
        let mut usage = UsageCounters::default();
        usage.apply(1, 10, 7_200, 3_600);
        usage.apply(1, 20, 3_700, 3_600);
        assert_eq!(usage.period_start_epoch_seconds, 7_200);
        assert_eq!(usage.period_cost_usd_micros, 10);
        assert_eq!(usage.total_cost_usd_micros, 30);
    }

    #[test]
    fn merged_config_applies_tenant_layer() {
        let mut model = ModelConfig::new("gpt-4o");
        model.rpm = Some(100);
        model.tpm = Some(1_000);
        model.tenant_overrides.insert(
            "t1".to_string(),
            ModelOverride {
                rpm_multiplier: Some(0.5),
                cacheable: Some(true),
                ..ModelOverride::default()
            },
        );

        let merged = model.merged_for("t1", &RetryPolicy::default());
        assert_eq!(merged.rpm, Some(50.0));
        assert_eq!(merged.tpm, Some(1_000.0));
        assert!(merged.cacheable);

        let other = model.merged_for("t2", &RetryPolicy::default());
        assert_eq!(other.rpm, Some(100.0));
        assert!(!other.cacheable);
    }

    #[test]
    fn model_patterns_match_exact_prefix_and_wildcard() {
        assert!(model_pattern_matches("*", "anything"));
        assert!(model_pattern_matches("gpt-*", "gpt-4o-mini"));
        assert!(!model_pattern_matches("gpt-*", "claude-3"));
        assert!(model_pattern_matches("gpt-4o", "gpt-4o"));
        assert!(!model_pattern_matches("gpt-4o", "gpt-4o-mini"));
    }

    #[test]
    fn every_outcome_survives_json() {
        let outcomes = [
            Outcome::Success,
            Outcome::CacheHit,
            Outcome::Rejected {
                reason: "rate_limited".to_string(),
            },
            Outcome::UpstreamFailure {
                kind: "timeout".to_string(),
                status: None,
            },
            Outcome::UpstreamFailure {
                kind: "upstream_error".to_string(),
                status: Some(502),
            },
            Outcome::Cancelled,
        ];
        for outcome in outcomes {
            let json = serde_json::to_value(&outcome).unwrap();
            assert!(json["type"].is_string(), "{json}");
            let back: Outcome = serde_json::from_value(json).unwrap();
            assert_eq!(back, outcome);
        }

        let failure = serde_json::to_value(Outcome::UpstreamFailure {
            kind: "timeout".to_string(),
            status: Some(504),
        })
        .unwrap();
        assert_eq!(
            failure,
            serde_json::json!({"type": "upstream_failure", "kind": "timeout", "status": 504})
        );
    }

    #[test]
    fn consumption_event_serializes_without_pricing() {
        let event = ConsumptionEvent {
            request_id: "r1".to_string(),
            tenant_id: "t".to_string(),
            principal_id: "p".to_string(),
            channel_id: None,
            model: Some("gpt-4o".to_string()),
            usage: TokenUsage {
                input_tokens: 3,
                output_tokens: 4,
            },
            pricing: None,
            outcome: Outcome::CacheHit,
            attempts: 0,
            latency_ms: 1,
            timestamp_ms: 2,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("pricing").is_none());
        assert_eq!(json["outcome"]["type"], "cache_hit");
        let back: ConsumptionEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back.outcome, Outcome::CacheHit);
        assert_eq!(back.usage.total(), 7);
    }
}
