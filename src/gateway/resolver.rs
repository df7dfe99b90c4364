use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::GatewayError;
use super::affinity::{AffinityTable, response_id_from_path};
use super::context::{ChannelPin, InboundRequest, PinSource, RequestContext};
use super::types::{
    ModelConfig, Principal, ResolvedModel, RetryPolicy, Tenant, model_pattern_matches,
};

/// Enabled and disabled model configs, replaced wholesale on refresh.
#[derive(Default)]
pub struct ModelCatalog {
    models: RwLock<Arc<HashMap<String, ModelConfig>>>,
}

impl ModelCatalog {
    pub fn new(models: impl IntoIterator<Item = ModelConfig>) -> Self {
        let catalog = Self::default();
        catalog.replace(models);
        catalog
    }

    pub fn replace(&self, models: impl IntoIterator<Item = ModelConfig>) {
        let models: HashMap<String, ModelConfig> = models
            .into_iter()
            .map(|model| (model.name.clone(), model))
            .collect();
        let models = Arc::new(models);
        match self.models.write() {
            Ok(mut guard) => *guard = models,
            Err(poisoned) => *poisoned.into_inner() = models,
        }
    }

    pub fn snapshot(&self) -> Arc<HashMap<String, ModelConfig>> {
        match self.models.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Globally enabled models only.
    pub fn get(&self, name: &str) -> Option<ModelConfig> {
        self.snapshot()
            .get(name)
            .filter(|model| model.enabled)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The model a request is aimed at, plus any channel pin found along the way.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelTarget {
    pub model: String,
    pub pin: Option<ChannelPin>,
}

pub struct ModelResolver {
    catalog: Arc<ModelCatalog>,
    affinity: Arc<AffinityTable>,
    default_retry: RetryPolicy,
}

impl ModelResolver {
    pub fn new(
        catalog: Arc<ModelCatalog>,
        affinity: Arc<AffinityTable>,
        default_retry: RetryPolicy,
    ) -> Self {
        Self {
            catalog,
            affinity,
            default_retry,
        }
    }

    pub fn catalog(&self) -> &Arc<ModelCatalog> {
        &self.catalog
    }

    /// Body `model`, then a model named in the path, then the model of a referenced
    /// stored response. An explicit header pin outranks a stored-response pin.
    pub fn target(&self, request: &InboundRequest) -> Option<ModelTarget> {
        let header_pin = request.pinned_channel_header().map(|channel_id| ChannelPin {
            channel_id: channel_id.to_string(),
            source: PinSource::Header,
        });

        let stored = request
            .body_str_field("previous_response_id")
            .or_else(|| response_id_from_path(request.path()))
            .and_then(|response_id| self.affinity.lookup(response_id));

        let model = request
            .body_str_field("model")
            .map(str::to_string)
            .or_else(|| model_from_path(request.path()).map(str::to_string))
            .or_else(|| stored.as_ref().map(|affinity| affinity.model.clone()))?;

        let pin = header_pin.or_else(|| {
            stored.map(|affinity| ChannelPin {
                channel_id: affinity.channel_id,
                source: PinSource::StoreAffinity,
            })
        });
        Some(ModelTarget { model, pin })
    }

    pub fn resolve(
        &self,
        request: &InboundRequest,
        ctx: &RequestContext,
    ) -> Result<ResolvedModel, GatewayError> {
        self.resolve_target(self.target(request), ctx)
    }

    /// Checks existence and permission, then writes the merged config (and pin) into `ctx`.
    pub fn resolve_target(
        &self,
        target: Option<ModelTarget>,
        ctx: &RequestContext,
    ) -> Result<ResolvedModel, GatewayError> {
        let Some(target) = target else {
            return Err(GatewayError::MissingModel);
        };
        let Some(config) = self.catalog.get(&target.model) else {
            return Err(GatewayError::UnknownModel {
                model: target.model,
            });
        };
        if !model_allowed(ctx.tenant(), ctx.principal(), &config.name) {
            return Err(GatewayError::ForbiddenModel {
                model: target.model,
            });
        }

        let merged = config.merged_for(&ctx.tenant().id, &self.default_retry);
        ctx.set_model(merged.clone())?;
        if let Some(pin) = target.pin {
            ctx.set_pin(pin)?;
        }
        Ok(merged)
    }
}

pub fn model_allowed(tenant: &Tenant, principal: &Principal, model: &str) -> bool {
    tenant
        .allowed_models
        .iter()
        .chain(principal.allowed_models.iter())
        .any(|pattern| model_pattern_matches(pattern, model))
}

/// `/v1beta/models/{model}:generateContent`, `/v1/models/{model}`, `/v1/engines/{model}/...`.
fn model_from_path(path: &str) -> Option<&str> {
    let mut segments = path.split('/');
    while let Some(segment) = segments.next() {
        if segment == "models" || segment == "engines" {
            let raw = segments.next()?;
            let model = raw.split_once(':').map(|(model, _)| model).unwrap_or(raw);
            let model = model.trim();
            return (!model.is_empty()).then_some(model);
        }
    }
    None
}
