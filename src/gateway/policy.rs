use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::limits::{CounterStore, WindowCheck, WindowDecision};
use super::resolver::model_allowed;
use super::types::{ModelConfig, Principal, Tenant, TenantStatus, UsageCounters};
use super::{Clock, GatewayError, RateLimitAxis, RateLimitInfo};
use crate::utils::net::ip_allowed;

/// Maps a tenant's cumulative spend to a throughput multiplier in `(0, 1]`.
pub trait ConsumeLevelPolicy: Send + Sync {
    fn multiplier(&self, cumulative_spend_usd_micros: u64) -> f64;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConsumeTier {
    pub min_spend_usd_micros: u64,
    pub multiplier: f64,
}

/// Step function over spend tiers. Tiers are sorted by threshold and must move
/// in a single direction; spend below the first tier gets the first tier's multiplier.
#[derive(Clone, Debug)]
pub struct TieredConsumeLevels {
    tiers: Vec<ConsumeTier>,
}

impl TieredConsumeLevels {
    pub fn new(mut tiers: Vec<ConsumeTier>) -> Result<Self, String> {
        tiers.sort_by_key(|tier| tier.min_spend_usd_micros);
        for tier in &tiers {
            if !(tier.multiplier > 0.0 && tier.multiplier <= 1.0) {
                return Err(format!(
                    "consume level multiplier must be in (0, 1], got {}",
                    tier.multiplier
                ));
            }
        }
        let rising = tiers
            .windows(2)
            .all(|pair| pair[0].multiplier <= pair[1].multiplier);
        let falling = tiers
            .windows(2)
            .all(|pair| pair[0].multiplier >= pair[1].multiplier);
        if !rising && !falling {
            return Err("consume level multipliers must be monotonic".to_string());
        }
        Ok(Self { tiers })
    }

    pub fn identity() -> Self {
        Self { tiers: Vec::new() }
    }
}

impl ConsumeLevelPolicy for TieredConsumeLevels {
    fn multiplier(&self, cumulative_spend_usd_micros: u64) -> f64 {
        let Some(first) = self.tiers.first() else {
            return 1.0;
        };
        self.tiers
            .iter()
            .rev()
            .find(|tier| cumulative_spend_usd_micros >= tier.min_spend_usd_micros)
            .unwrap_or(first)
            .multiplier
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BalanceAlert {
    pub tenant_id: String,
    pub balance_usd_micros: i64,
    pub threshold_usd_micros: i64,
}

#[async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn notify(&self, alert: BalanceAlert);
}

#[derive(Debug, Default)]
pub struct TracingAlertNotifier;

#[async_trait]
impl AlertNotifier for TracingAlertNotifier {
    async fn notify(&self, alert: BalanceAlert) {
        tracing::warn!(
            tenant_id = %alert.tenant_id,
            balance_usd_micros = alert.balance_usd_micros,
            threshold_usd_micros = alert.threshold_usd_micros,
            "tenant balance below alert threshold"
        );
    }
}

/// At most one alert per tenant per cooldown.
#[derive(Debug)]
pub struct AlertThrottle {
    cooldown_seconds: u64,
    last_sent: Mutex<HashMap<String, u64>>,
}

impl AlertThrottle {
    pub fn new(cooldown_seconds: u64) -> Self {
        Self {
            cooldown_seconds,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    pub fn should_send(&self, tenant_id: &str, now_epoch_seconds: u64) -> bool {
        let Ok(mut last_sent) = self.last_sent.lock() else {
            return false;
        };
        match last_sent.get(tenant_id) {
            Some(sent) if now_epoch_seconds < sent.saturating_add(self.cooldown_seconds) => false,
            _ => {
                last_sent.insert(tenant_id.to_string(), now_epoch_seconds);
                true
            }
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
    #[serde(default = "default_alert_cooldown_seconds")]
    pub alert_cooldown_seconds: u64,
    #[serde(default)]
    pub consume_levels: Vec<ConsumeTier>,
}

fn default_window_seconds() -> u64 {
    60
}

fn default_alert_cooldown_seconds() -> u64 {
    60 * 60
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            window_seconds: default_window_seconds(),
            alert_cooldown_seconds: default_alert_cooldown_seconds(),
            consume_levels: Vec::new(),
        }
    }
}

/// What the caller knows about the request at authorization time.
#[derive(Clone, Copy, Debug)]
pub struct AuthorizeInput<'a> {
    pub tenant: &'a Tenant,
    pub principal: &'a Principal,
    /// `None` when the model is unknown; resolution rejects it afterwards.
    pub model: Option<&'a ModelConfig>,
    pub client_ip: Option<IpAddr>,
    pub estimated_tokens: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Authorization {
    pub effective_rpm: Option<u64>,
    pub effective_tpm: Option<u64>,
}

pub struct PolicyGate {
    counters: Arc<dyn CounterStore>,
    consume_levels: Arc<dyn ConsumeLevelPolicy>,
    notifier: Arc<dyn AlertNotifier>,
    alerts: AlertThrottle,
    clock: Arc<dyn Clock>,
    window_seconds: u64,
}

impl PolicyGate {
    pub fn new(counters: Arc<dyn CounterStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            counters,
            consume_levels: Arc::new(TieredConsumeLevels::identity()),
            notifier: Arc::new(TracingAlertNotifier),
            alerts: AlertThrottle::new(default_alert_cooldown_seconds()),
            clock,
            window_seconds: default_window_seconds(),
        }
    }

    pub fn from_config(
        config: &PolicyConfig,
        counters: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, String> {
        let levels = TieredConsumeLevels::new(config.consume_levels.clone())?;
        Ok(Self::new(counters, clock)
            .with_consume_levels(Arc::new(levels))
            .with_alert_cooldown(config.alert_cooldown_seconds)
            .with_window_seconds(config.window_seconds))
    }

    pub fn with_consume_levels(mut self, levels: Arc<dyn ConsumeLevelPolicy>) -> Self {
        self.consume_levels = levels;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn AlertNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_alert_cooldown(mut self, cooldown_seconds: u64) -> Self {
        self.alerts = AlertThrottle::new(cooldown_seconds);
        self
    }

    pub fn with_window_seconds(mut self, window_seconds: u64) -> Self {
        self.window_seconds = window_seconds.max(1);
        self
    }

    pub async fn authorize(
        &self,
        input: AuthorizeInput<'_>,
    ) -> Result<Authorization, GatewayError> {
        let AuthorizeInput {
            tenant,
            principal,
            model,
            client_ip,
            estimated_tokens,
        } = input;

        if tenant.status == TenantStatus::Disabled {
            return Err(GatewayError::Disabled { subject: "tenant" });
        }
        if !principal.enabled {
            return Err(GatewayError::Disabled {
                subject: "principal",
            });
        }
        if principal.tenant_id != tenant.id {
            return Err(GatewayError::Unauthenticated);
        }

        if !principal.allowed_subnets.is_empty() {
            match client_ip {
                Some(ip) if ip_allowed(&principal.allowed_subnets, ip) => {}
                Some(ip) => {
                    return Err(GatewayError::IpNotAllowed { ip: ip.to_string() });
                }
                None => {
                    return Err(GatewayError::IpNotAllowed {
                        ip: "unknown".to_string(),
                    });
                }
            }
        }

        let now = self.clock.now_epoch_seconds();
        check_principal_quota(principal, now)?;

        let internal = tenant.is_internal();
        if !internal {
            if tenant.balance_usd_micros <= 0 {
                return Err(GatewayError::InsufficientBalance {
                    balance_usd_micros: tenant.balance_usd_micros,
                });
            }
            self.maybe_alert(tenant, now);
        }

        let Some(model) = model else {
            return Ok(Authorization::default());
        };
        // Before any counter moves: a forbidden model must not consume quota.
        if !model_allowed(tenant, principal, &model.name) {
            return Err(GatewayError::ForbiddenModel {
                model: model.name.clone(),
            });
        }

        let layer = model.tenant_overrides.get(&tenant.id);
        let spend_multiplier = self
            .consume_levels
            .multiplier(tenant.cumulative_spend_usd_micros());
        let effective_rpm = (!internal)
            .then_some(model.rpm)
            .flatten()
            .map(|base| {
                scale_limit(
                    f64::from(base)
                        * layer.and_then(|layer| layer.rpm_multiplier).unwrap_or(1.0)
                        * tenant.rpm_ratio
                        * spend_multiplier,
                )
            });
        let effective_tpm = (!internal)
            .then_some(model.tpm)
            .flatten()
            .map(|base| {
                scale_limit(
                    f64::from(base)
                        * layer.and_then(|layer| layer.tpm_multiplier).unwrap_or(1.0)
                        * tenant.tpm_ratio
                        * spend_multiplier,
                )
            });

        let principal_rpm = narrower(effective_rpm, principal.limits.rpm.map(u64::from));
        let principal_tpm = narrower(effective_tpm, principal.limits.tpm.map(u64::from));

        let mut checks = Vec::with_capacity(4);
        let mut axes = Vec::with_capacity(4);
        let tenant_scope = format!("{}:{}", tenant.id, model.name);
        let principal_scope = format!("{}:{}:{}", tenant.id, principal.id, model.name);
        for (scope_name, scope_key, rpm, tpm) in [
            ("tenant", &tenant_scope, effective_rpm, effective_tpm),
            ("principal", &principal_scope, principal_rpm, principal_tpm),
        ] {
            if let Some(limit) = rpm {
                checks.push(WindowCheck {
                    key: format!("req:{scope_key}"),
                    limit,
                    amount: 1,
                });
                axes.push((RateLimitAxis::Requests, scope_name));
            }
            if let Some(limit) = tpm {
                checks.push(WindowCheck {
                    key: format!("tok:{scope_key}"),
                    limit,
                    amount: estimated_tokens,
                });
                axes.push((RateLimitAxis::Tokens, scope_name));
            }
        }

        let authorization = Authorization {
            effective_rpm,
            effective_tpm,
        };
        if checks.is_empty() {
            return Ok(authorization);
        }

        let window_start = UsageCounters::window_start(now, self.window_seconds);
        let decision = self
            .counters
            .check_and_increment(window_start, self.window_seconds, &checks)
            .await
            .map_err(|err| {
                tracing::error!(error = %err, "rate limit check failed; rejecting");
                GatewayError::Internal {
                    message: "rate limit state unavailable".to_string(),
                }
            })?;

        match decision {
            WindowDecision::Allowed => Ok(authorization),
            WindowDecision::Limited { index, .. } => {
                let (Some(check), Some((axis, scope))) = (checks.get(index), axes.get(index))
                else {
                    return Err(GatewayError::Internal {
                        message: format!("rate limit check index out of range: {index}"),
                    });
                };
                Err(GatewayError::RateLimited(RateLimitInfo {
                    axis: *axis,
                    scope: *scope,
                    limit: check.limit,
                    remaining: 0,
                    reset_epoch_seconds: window_start.saturating_add(self.window_seconds),
                }))
            }
        }
    }

    fn maybe_alert(&self, tenant: &Tenant, now: u64) {
        let Some(threshold) = tenant.balance_alert_threshold_usd_micros else {
            return;
        };
        if tenant.balance_usd_micros >= threshold || !self.alerts.should_send(&tenant.id, now) {
            return;
        }
        let alert = BalanceAlert {
            tenant_id: tenant.id.clone(),
            balance_usd_micros: tenant.balance_usd_micros,
            threshold_usd_micros: threshold,
        };
        let notifier = self.notifier.clone();
        tokio::spawn(async move { notifier.notify(alert).await });
    }
}

fn check_principal_quota(principal: &Principal, now: u64) -> Result<(), GatewayError> {
    if let Some(limit) = principal.quota.total_usd_micros {
        let used = principal.usage.total_cost_usd_micros;
        if used >= limit {
            return Err(GatewayError::QuotaExceeded {
                scope: "principal_total",
                limit,
                used,
            });
        }
    }
    if let Some(limit) = principal.quota.periodic_usd_micros {
        let used = principal
            .usage
            .period_cost_at(now, principal.quota.window_seconds);
        if used >= limit {
            return Err(GatewayError::QuotaExceeded {
                scope: "principal_period",
                limit,
                used,
            });
        }
    }
    Ok(())
}

/// Floors the scaled limit but never turns a configured positive limit into zero.
fn scale_limit(value: f64) -> u64 {
    if !value.is_finite() || value <= 0.0 {
        return 0;
    }
    (value.floor() as u64).max(1)
}

fn narrower(left: Option<u64>, right: Option<u64>) -> Option<u64> {
    match (left, right) {
        (Some(left), Some(right)) => Some(left.min(right)),
        (left, right) => left.or(right),
    }
}
