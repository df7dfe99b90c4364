use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{ConduitError, Result};

use super::accounting::AccountingConfig;
use super::costing::PricingTable;
use super::health::HealthConfig;
use super::pipeline::PipelineConfig;
use super::policy::PolicyConfig;
use super::types::{Channel, ModelConfig, Principal, RetryPolicy, Tenant};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// How often the routing table, model catalog and health snapshot are republished.
    #[serde(default = "default_refresh_interval_seconds")]
    pub refresh_interval_seconds: u64,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default = "default_affinity_ttl_seconds")]
    pub affinity_ttl_seconds: u64,
    #[serde(default = "default_affinity_capacity")]
    pub affinity_capacity: usize,
}

fn default_refresh_interval_seconds() -> u64 {
    5
}

fn default_affinity_ttl_seconds() -> u64 {
    24 * 60 * 60
}

fn default_affinity_capacity() -> usize {
    100_000
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            refresh_interval_seconds: default_refresh_interval_seconds(),
            health: HealthConfig::default(),
            affinity_ttl_seconds: default_affinity_ttl_seconds(),
            affinity_capacity: default_affinity_capacity(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Largest client request body accepted, in bytes.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Retry policy for models that do not carry their own.
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub accounting: AccountingConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis_prefix: Option<String>,
    /// litellm-style price list used for models configured without pricing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pricing_file: Option<PathBuf>,

    #[serde(default)]
    pub tenants: Vec<Tenant>,
    #[serde(default)]
    pub principals: Vec<Principal>,
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_max_body_bytes() -> usize {
    8 * 1024 * 1024
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_body_bytes: default_max_body_bytes(),
            policy: PolicyConfig::default(),
            routing: RoutingConfig::default(),
            pipeline: PipelineConfig::default(),
            retry: RetryPolicy::default(),
            accounting: AccountingConfig::default(),
            redis_url: None,
            redis_prefix: None,
            pricing_file: None,
            tenants: Vec::new(),
            principals: Vec::new(),
            channels: Vec::new(),
            models: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Loads `.json`, `.toml` or (with `gateway-config-yaml`) `.yaml`/`.yml`, applies the
    /// optional price list and validates the result.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let mut config: GatewayConfig = match extension.as_str() {
            "json" => serde_json::from_str(&raw)?,
            "toml" => toml::from_str(&raw)?,
            "yaml" | "yml" => parse_yaml(&raw)?,
            other => {
                return Err(ConduitError::Config(format!(
                    "unsupported config extension {other:?} for {}",
                    path.display()
                )));
            }
        };

        if let Some(pricing_file) = config.pricing_file.clone() {
            let pricing_path = if pricing_file.is_relative() {
                path.parent()
                    .map(|dir| dir.join(&pricing_file))
                    .unwrap_or(pricing_file)
            } else {
                pricing_file
            };
            let raw = std::fs::read_to_string(&pricing_path)?;
            let table = PricingTable::from_litellm_json_str(&raw)
                .map_err(|err| ConduitError::Config(format!("pricing file: {err}")))?;
            config.apply_pricing(&table);
        }

        config.validate()?;
        Ok(config)
    }

    /// Fills in prices for models that were configured without any.
    pub fn apply_pricing(&mut self, table: &PricingTable) {
        let unpriced = super::costing::ModelPricing::default();
        for model in &mut self.models {
            if model.pricing != unpriced {
                continue;
            }
            if let Some(pricing) = table.model_pricing(&model.name) {
                model.pricing = pricing.clone();
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut tenants = HashSet::new();
        for tenant in &self.tenants {
            if tenant.id.trim().is_empty() {
                return Err(ConduitError::Config("tenant id must not be empty".into()));
            }
            if !tenants.insert(tenant.id.as_str()) {
                return Err(ConduitError::Config(format!(
                    "duplicate tenant id: {}",
                    tenant.id
                )));
            }
            if !(tenant.rpm_ratio.is_finite() && tenant.rpm_ratio >= 0.0)
                || !(tenant.tpm_ratio.is_finite() && tenant.tpm_ratio >= 0.0)
            {
                return Err(ConduitError::Config(format!(
                    "tenant {} has an invalid rpm/tpm ratio",
                    tenant.id
                )));
            }
        }

        let mut principals = HashSet::new();
        for principal in &self.principals {
            if !principals.insert(principal.id.as_str()) {
                return Err(ConduitError::Config(format!(
                    "duplicate principal id: {}",
                    principal.id
                )));
            }
            if !tenants.contains(principal.tenant_id.as_str()) {
                return Err(ConduitError::Config(format!(
                    "principal {} references unknown tenant {}",
                    principal.id, principal.tenant_id
                )));
            }
            for entry in &principal.allowed_subnets {
                if crate::utils::net::Subnet::parse(entry).is_none() {
                    return Err(ConduitError::Config(format!(
                        "principal {} has an invalid subnet entry {entry:?}",
                        principal.id
                    )));
                }
            }
        }

        let mut channels = HashSet::new();
        for channel in &self.channels {
            if !channels.insert(channel.id.as_str()) {
                return Err(ConduitError::Config(format!(
                    "duplicate channel id: {}",
                    channel.id
                )));
            }
            if channel.base_url.trim().is_empty() {
                return Err(ConduitError::Config(format!(
                    "channel {} missing base_url",
                    channel.id
                )));
            }
        }

        let mut models = HashSet::new();
        for model in &self.models {
            if !models.insert(model.name.as_str()) {
                return Err(ConduitError::Config(format!(
                    "duplicate model: {}",
                    model.name
                )));
            }
        }

        if self.policy.window_seconds == 0 {
            return Err(ConduitError::Config(
                "policy.window_seconds must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(feature = "gateway-config-yaml")]
fn parse_yaml(raw: &str) -> Result<GatewayConfig> {
    Ok(serde_yaml::from_str(raw)?)
}

#[cfg(not(feature = "gateway-config-yaml"))]
fn parse_yaml(_raw: &str) -> Result<GatewayConfig> {
    Err(ConduitError::Config(
        "yaml config requires `--features gateway-config-yaml`".into(),
    ))
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    #[test]
    fn toml_config_loads_with_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
listen = "0.0.0.0:9000"

[[tenants]]
id = "acme"
balance_usd_micros = 1000000

[[principals]]
id = "k1"
tenant_id = "acme"
secret = "sk-acme"
allowed_subnets = ["10.0.0.0/8"]

[[channels]]
id = "primary"
base_url = "https://api.example.com"
models = ["gpt-*"]

[[models]]
name = "gpt-4o-mini"
rpm = 60
"#
        )
        .unwrap();

        let config = GatewayConfig::from_path(file.path()).unwrap();
        assert_eq!(config.listen, "0.0.0.0:9000");
        assert_eq!(config.policy.window_seconds, 60);
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.tenants[0].rpm_ratio, 1.0);
        assert_eq!(config.models[0].rpm, Some(60));
        assert_eq!(config.channels[0].priority_weight, 1);
    }

    #[test]
    fn json_pricing_file_fills_unpriced_models() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("prices.json"),
            r#"{"gpt-4o-mini": {"input_cost_per_token": 0.000002, "output_cost_per_token": 0.000008}}"#,
        )
        .unwrap();
        let config_path = dir.path().join("gateway.json");
        std::fs::write(
            &config_path,
            r#"{"pricing_file": "prices.json", "models": [{"name": "gpt-4o-mini"}]}"#,
        )
        .unwrap();

        let config = GatewayConfig::from_path(&config_path).unwrap();
        assert_eq!(config.models[0].pricing.input_usd_micros_per_token, 2);
        assert_eq!(config.models[0].pricing.output_usd_micros_per_token, 8);
    }

    #[test]
    fn unknown_tenant_reference_is_rejected() {
        let config = GatewayConfig {
            principals: vec![Principal::new("k", "ghost", "sk")],
            ..GatewayConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConduitError::Config(_))));
    }

    #[test]
    fn unsupported_extension_is_an_error() {
        let file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        assert!(GatewayConfig::from_path(file.path()).is_err());
    }
}
