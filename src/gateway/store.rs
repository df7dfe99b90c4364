//! Entity storage behind the gateway: the persistent source of truth, a read-mostly
//! mirror in front of it, and credential resolution on top of the mirror.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use axum::http::HeaderMap;
use thiserror::Error;

use super::GatewayError;
use super::accounting::{UsageRecord, UsageSink};
use super::types::{Channel, ModelConfig, Principal, Tenant};

const APPLIED_USAGE_MEMORY: usize = 65_536;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("invalid record: {0}")]
    Invalid(String),
}

#[async_trait]
pub trait PersistentStore: Send + Sync {
    async fn get_tenant(&self, id: &str) -> Result<Option<Tenant>, StoreError>;
    async fn put_tenant(&self, tenant: Tenant) -> Result<(), StoreError>;
    async fn delete_tenant(&self, id: &str) -> Result<bool, StoreError>;

    async fn get_principal(&self, id: &str) -> Result<Option<Principal>, StoreError>;
    async fn find_principal_by_secret(&self, secret: &str)
    -> Result<Option<Principal>, StoreError>;
    async fn put_principal(&self, principal: Principal) -> Result<(), StoreError>;
    async fn delete_principal(&self, id: &str) -> Result<bool, StoreError>;

    async fn list_channels(&self) -> Result<Vec<Channel>, StoreError>;
    async fn put_channel(&self, channel: Channel) -> Result<(), StoreError>;
    async fn delete_channel(&self, id: &str) -> Result<bool, StoreError>;

    async fn list_models(&self) -> Result<Vec<ModelConfig>, StoreError>;
    async fn put_model(&self, model: ModelConfig) -> Result<(), StoreError>;
    async fn delete_model(&self, name: &str) -> Result<bool, StoreError>;

    /// Folds one priced usage record into the tenant and principal counters and
    /// deducts the cost from a non-internal tenant's balance. Records are keyed by
    /// request id; applying the same record twice has no further effect.
    async fn apply_usage(&self, record: &UsageRecord) -> Result<(), StoreError>;
}

#[derive(Default)]
struct MemoryState {
    tenants: HashMap<String, Tenant>,
    principals: HashMap<String, Principal>,
    secrets: HashMap<String, String>,
    channels: Vec<Channel>,
    models: Vec<ModelConfig>,
}

#[derive(Default)]
struct AppliedUsage {
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl AppliedUsage {
    /// Returns `false` when the request id was already applied.
    fn remember(&mut self, request_id: &str) -> bool {
        if self.seen.contains(request_id) {
            return false;
        }
        if self.order.len() >= APPLIED_USAGE_MEMORY {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(request_id.to_string());
        self.order.push_back(request_id.to_string());
        true
    }
}

/// In-process store, seeded from configuration.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    applied: Mutex<AppliedUsage>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seeded(
        tenants: impl IntoIterator<Item = Tenant>,
        principals: impl IntoIterator<Item = Principal>,
        channels: impl IntoIterator<Item = Channel>,
        models: impl IntoIterator<Item = ModelConfig>,
    ) -> Result<Self, StoreError> {
        let store = Self::new();
        {
            let mut state = store.write_state();
            for tenant in tenants {
                state.tenants.insert(tenant.id.clone(), tenant);
            }
            for principal in principals {
                insert_principal(&mut state, principal)?;
            }
            state.channels = channels.into_iter().collect();
            state.models = models.into_iter().collect();
        }
        Ok(store)
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, MemoryState> {
        match self.state.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, MemoryState> {
        match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn insert_principal(state: &mut MemoryState, principal: Principal) -> Result<(), StoreError> {
    if principal.secret.trim().is_empty() {
        return Err(StoreError::Invalid(format!(
            "principal {} has an empty secret",
            principal.id
        )));
    }
    if let Some(owner) = state.secrets.get(&principal.secret) {
        if owner != &principal.id {
            return Err(StoreError::Invalid(format!(
                "principal {} reuses the secret of {owner}",
                principal.id
            )));
        }
    }
    if let Some(previous) = state.principals.get(&principal.id) {
        let previous_secret = previous.secret.clone();
        state.secrets.remove(&previous_secret);
    }
    state
        .secrets
        .insert(principal.secret.clone(), principal.id.clone());
    state.principals.insert(principal.id.clone(), principal);
    Ok(())
}

#[async_trait]
impl PersistentStore for MemoryStore {
    async fn get_tenant(&self, id: &str) -> Result<Option<Tenant>, StoreError> {
        Ok(self.read_state().tenants.get(id).cloned())
    }

    async fn put_tenant(&self, tenant: Tenant) -> Result<(), StoreError> {
        self.write_state().tenants.insert(tenant.id.clone(), tenant);
        Ok(())
    }

    async fn delete_tenant(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.write_state().tenants.remove(id).is_some())
    }

    async fn get_principal(&self, id: &str) -> Result<Option<Principal>, StoreError> {
        Ok(self.read_state().principals.get(id).cloned())
    }

    async fn find_principal_by_secret(
        &self,
        secret: &str,
    ) -> Result<Option<Principal>, StoreError> {
        let state = self.read_state();
        Ok(state
            .secrets
            .get(secret)
            .and_then(|id| state.principals.get(id))
            .cloned())
    }

    async fn put_principal(&self, principal: Principal) -> Result<(), StoreError> {
        insert_principal(&mut self.write_state(), principal)
    }

    async fn delete_principal(&self, id: &str) -> Result<bool, StoreError> {
        let mut state = self.write_state();
        let Some(principal) = state.principals.remove(id) else {
            return Ok(false);
        };
        state.secrets.remove(&principal.secret);
        Ok(true)
    }

    async fn list_channels(&self) -> Result<Vec<Channel>, StoreError> {
        Ok(self.read_state().channels.clone())
    }

    async fn put_channel(&self, channel: Channel) -> Result<(), StoreError> {
        let mut state = self.write_state();
        match state.channels.iter_mut().find(|existing| existing.id == channel.id) {
            Some(existing) => *existing = channel,
            None => state.channels.push(channel),
        }
        Ok(())
    }

    async fn delete_channel(&self, id: &str) -> Result<bool, StoreError> {
        let mut state = self.write_state();
        let before = state.channels.len();
        state.channels.retain(|channel| channel.id != id);
        Ok(state.channels.len() != before)
    }

    async fn list_models(&self) -> Result<Vec<ModelConfig>, StoreError> {
        Ok(self.read_state().models.clone())
    }

    async fn put_model(&self, model: ModelConfig) -> Result<(), StoreError> {
        let mut state = self.write_state();
        match state.models.iter_mut().find(|existing| existing.name == model.name) {
            Some(existing) => *existing = model,
            None => state.models.push(model),
        }
        Ok(())
    }

    async fn delete_model(&self, name: &str) -> Result<bool, StoreError> {
        let mut state = self.write_state();
        let before = state.models.len();
        state.models.retain(|model| model.name != name);
        Ok(state.models.len() != before)
    }

    async fn apply_usage(&self, record: &UsageRecord) -> Result<(), StoreError> {
        let mut applied = match self.applied.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut state = self.write_state();
        if !state.tenants.contains_key(&record.tenant_id) {
            return Err(StoreError::NotFound {
                kind: "tenant",
                id: record.tenant_id.clone(),
            });
        }
        if !applied.remember(&record.request_id) {
            return Ok(());
        }

        if let Some(tenant) = state.tenants.get_mut(&record.tenant_id) {
            tenant.usage.apply(
                record.tokens,
                record.cost_usd_micros,
                record.at_epoch_seconds,
                record.tenant_window_seconds,
            );
            if !tenant.is_internal() {
                let cost = i64::try_from(record.cost_usd_micros).unwrap_or(i64::MAX);
                tenant.balance_usd_micros = tenant.balance_usd_micros.saturating_sub(cost);
            }
        }
        if let Some(principal) = state.principals.get_mut(&record.principal_id) {
            let window = principal.quota.window_seconds;
            principal.usage.apply(
                record.tokens,
                record.cost_usd_micros,
                record.at_epoch_seconds,
                window,
            );
        }
        Ok(())
    }
}

#[async_trait]
impl UsageSink for MemoryStore {
    async fn apply(&self, record: &UsageRecord) -> Result<(), StoreError> {
        self.apply_usage(record).await
    }
}

/// Ticket taken on a cache miss. The loaded value is only kept when no write touched
/// the key (or cleared the mirror) while the load was in flight.
#[derive(Clone, Copy, Debug)]
struct LoadTicket {
    epoch: u64,
    generation: u64,
}

struct MirrorState<T> {
    entries: HashMap<String, Arc<T>>,
    generations: HashMap<String, u64>,
    epoch: u64,
}

struct Mirror<T> {
    state: Mutex<MirrorState<T>>,
}

impl<T> Mirror<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(MirrorState {
                entries: HashMap::new(),
                generations: HashMap::new(),
                epoch: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MirrorState<T>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lookup(&self, key: &str) -> Result<Arc<T>, LoadTicket> {
        let state = self.lock();
        match state.entries.get(key) {
            Some(value) => Ok(value.clone()),
            None => Err(LoadTicket {
                epoch: state.epoch,
                generation: state.generations.get(key).copied().unwrap_or(0),
            }),
        }
    }

    fn fill(&self, key: &str, value: Arc<T>, ticket: LoadTicket) {
        let mut state = self.lock();
        let generation = state.generations.get(key).copied().unwrap_or(0);
        if state.epoch == ticket.epoch && generation == ticket.generation {
            state.entries.insert(key.to_string(), value);
        }
    }

    fn invalidate(&self, key: &str) {
        let mut state = self.lock();
        state.entries.remove(key);
        *state.generations.entry(key.to_string()).or_insert(0) += 1;
    }

    fn invalidate_matching(&self, matches: impl Fn(&T) -> bool) {
        let mut state = self.lock();
        let stale: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, value)| matches(value))
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            state.entries.remove(&key);
            *state.generations.entry(key).or_insert(0) += 1;
        }
    }

    fn invalidate_all(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.epoch += 1;
    }
}

const ALL: &str = "*";

/// Read-mostly mirror of a [`PersistentStore`]. Reads are served from memory after
/// the first load; every write goes through to the store and then invalidates the
/// affected entries.
pub struct CachedStore {
    inner: Arc<dyn PersistentStore>,
    tenants: Mirror<Tenant>,
    principals: Mirror<Principal>,
    by_secret: Mirror<Principal>,
    channels: Mirror<Vec<Channel>>,
    models: Mirror<Vec<ModelConfig>>,
}

impl CachedStore {
    pub fn new(inner: Arc<dyn PersistentStore>) -> Self {
        Self {
            inner,
            tenants: Mirror::new(),
            principals: Mirror::new(),
            by_secret: Mirror::new(),
            channels: Mirror::new(),
            models: Mirror::new(),
        }
    }

    pub fn inner(&self) -> &Arc<dyn PersistentStore> {
        &self.inner
    }

    pub async fn tenant(&self, id: &str) -> Result<Option<Arc<Tenant>>, StoreError> {
        let ticket = match self.tenants.lookup(id) {
            Ok(hit) => return Ok(Some(hit)),
            Err(ticket) => ticket,
        };
        let Some(tenant) = self.inner.get_tenant(id).await? else {
            return Ok(None);
        };
        let tenant = Arc::new(tenant);
        self.tenants.fill(id, tenant.clone(), ticket);
        Ok(Some(tenant))
    }

    pub async fn principal(&self, id: &str) -> Result<Option<Arc<Principal>>, StoreError> {
        let ticket = match self.principals.lookup(id) {
            Ok(hit) => return Ok(Some(hit)),
            Err(ticket) => ticket,
        };
        let Some(principal) = self.inner.get_principal(id).await? else {
            return Ok(None);
        };
        let principal = Arc::new(principal);
        self.principals.fill(id, principal.clone(), ticket);
        Ok(Some(principal))
    }

    pub async fn principal_by_secret(
        &self,
        secret: &str,
    ) -> Result<Option<Arc<Principal>>, StoreError> {
        let ticket = match self.by_secret.lookup(secret) {
            Ok(hit) => return Ok(Some(hit)),
            Err(ticket) => ticket,
        };
        let Some(principal) = self.inner.find_principal_by_secret(secret).await? else {
            return Ok(None);
        };
        let principal = Arc::new(principal);
        self.by_secret.fill(secret, principal.clone(), ticket);
        Ok(Some(principal))
    }

    pub async fn channels(&self) -> Result<Arc<Vec<Channel>>, StoreError> {
        let ticket = match self.channels.lookup(ALL) {
            Ok(hit) => return Ok(hit),
            Err(ticket) => ticket,
        };
        let channels = Arc::new(self.inner.list_channels().await?);
        self.channels.fill(ALL, channels.clone(), ticket);
        Ok(channels)
    }

    pub async fn models(&self) -> Result<Arc<Vec<ModelConfig>>, StoreError> {
        let ticket = match self.models.lookup(ALL) {
            Ok(hit) => return Ok(hit),
            Err(ticket) => ticket,
        };
        let models = Arc::new(self.inner.list_models().await?);
        self.models.fill(ALL, models.clone(), ticket);
        Ok(models)
    }

    /// Drops every mirrored entry, forcing the next reads to hit the store.
    pub fn invalidate_all(&self) {
        self.tenants.invalidate_all();
        self.principals.invalidate_all();
        self.by_secret.invalidate_all();
        self.channels.invalidate_all();
        self.models.invalidate_all();
    }

    fn invalidate_principal(&self, id: &str) {
        self.principals.invalidate(id);
        // The old secret is unknown here.
        self.by_secret.invalidate_all();
    }

    /// Usage never changes a secret, so only the entries for this principal go.
    fn invalidate_principal_usage(&self, id: &str) {
        self.principals.invalidate(id);
        self.by_secret.invalidate_matching(|principal| principal.id == id);
    }
}

#[async_trait]
impl PersistentStore for CachedStore {
    async fn get_tenant(&self, id: &str) -> Result<Option<Tenant>, StoreError> {
        Ok(self.tenant(id).await?.map(|tenant| tenant.as_ref().clone()))
    }

    async fn put_tenant(&self, tenant: Tenant) -> Result<(), StoreError> {
        let id = tenant.id.clone();
        let result = self.inner.put_tenant(tenant).await;
        self.tenants.invalidate(&id);
        result
    }

    async fn delete_tenant(&self, id: &str) -> Result<bool, StoreError> {
        let result = self.inner.delete_tenant(id).await;
        self.tenants.invalidate(id);
        result
    }

    async fn get_principal(&self, id: &str) -> Result<Option<Principal>, StoreError> {
        Ok(self
            .principal(id)
            .await?
            .map(|principal| principal.as_ref().clone()))
    }

    async fn find_principal_by_secret(
        &self,
        secret: &str,
    ) -> Result<Option<Principal>, StoreError> {
        Ok(self
            .principal_by_secret(secret)
            .await?
            .map(|principal| principal.as_ref().clone()))
    }

    async fn put_principal(&self, principal: Principal) -> Result<(), StoreError> {
        let id = principal.id.clone();
        let result = self.inner.put_principal(principal).await;
        self.invalidate_principal(&id);
        result
    }

    async fn delete_principal(&self, id: &str) -> Result<bool, StoreError> {
        let result = self.inner.delete_principal(id).await;
        self.invalidate_principal(id);
        result
    }

    async fn list_channels(&self) -> Result<Vec<Channel>, StoreError> {
        Ok(self.channels().await?.as_ref().clone())
    }

    async fn put_channel(&self, channel: Channel) -> Result<(), StoreError> {
        let result = self.inner.put_channel(channel).await;
        self.channels.invalidate(ALL);
        result
    }

    async fn delete_channel(&self, id: &str) -> Result<bool, StoreError> {
        let result = self.inner.delete_channel(id).await;
        self.channels.invalidate(ALL);
        result
    }

    async fn list_models(&self) -> Result<Vec<ModelConfig>, StoreError> {
        Ok(self.models().await?.as_ref().clone())
    }

    async fn put_model(&self, model: ModelConfig) -> Result<(), StoreError> {
        let result = self.inner.put_model(model).await;
        self.models.invalidate(ALL);
        result
    }

    async fn delete_model(&self, name: &str) -> Result<bool, StoreError> {
        let result = self.inner.delete_model(name).await;
        self.models.invalidate(ALL);
        result
    }

    async fn apply_usage(&self, record: &UsageRecord) -> Result<(), StoreError> {
        let result = self.inner.apply_usage(record).await;
        self.tenants.invalidate(&record.tenant_id);
        self.invalidate_principal_usage(&record.principal_id);
        result
    }
}

#[async_trait]
impl UsageSink for CachedStore {
    async fn apply(&self, record: &UsageRecord) -> Result<(), StoreError> {
        self.apply_usage(record).await
    }
}

/// Resolves a presented credential to the identity it belongs to.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn authenticate(
        &self,
        credential: &str,
    ) -> Result<(Arc<Tenant>, Arc<Principal>), GatewayError>;
}

/// Looks the secret up through the store mirror. Status checks happen later, in the
/// policy gate, so disabled identities still resolve here.
pub struct StoreAuthProvider {
    store: Arc<CachedStore>,
}

impl StoreAuthProvider {
    pub fn new(store: Arc<CachedStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl AuthProvider for StoreAuthProvider {
    async fn authenticate(
        &self,
        credential: &str,
    ) -> Result<(Arc<Tenant>, Arc<Principal>), GatewayError> {
        let lookup_failed = |err: StoreError| {
            tracing::warn!(error = %err, "credential lookup failed");
            GatewayError::Internal {
                message: "credential lookup failed".to_string(),
            }
        };
        let principal = self
            .store
            .principal_by_secret(credential)
            .await
            .map_err(lookup_failed)?
            .ok_or(GatewayError::Unauthenticated)?;
        let tenant = self
            .store
            .tenant(&principal.tenant_id)
            .await
            .map_err(lookup_failed)?
            .ok_or(GatewayError::Unauthenticated)?;
        Ok((tenant, principal))
    }
}

fn extract_header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    let auth = extract_header(headers, "authorization")?;
    let rest = auth
        .strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))?;
    let token = rest.trim();
    (!token.is_empty()).then_some(token)
}

/// `Authorization: Bearer <secret>` or `x-api-key: <secret>`.
pub fn extract_credential(headers: &HeaderMap) -> Option<&str> {
    extract_bearer(headers).or_else(|| extract_header(headers, "x-api-key"))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::http::HeaderValue;

    use super::*;
    use crate::gateway::types::TenantStatus;

    fn record(request_id: &str, cost: u64) -> UsageRecord {
        UsageRecord {
            request_id: request_id.to_string(),
            tenant_id: "t".to_string(),
            principal_id: "p".to_string(),
            tokens: 10,
            cost_usd_micros: cost,
            at_epoch_seconds: 1_000,
            tenant_window_seconds: 3_600,
        }
    }

    fn seeded() -> MemoryStore {
        let mut tenant = Tenant::new("t");
        tenant.balance_usd_micros = 1_000;
        MemoryStore::seeded(
            [tenant],
            [Principal::new("p", "t", "sk-test")],
            [Channel::new("c", "http://c")],
            [ModelConfig::new("m")],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn usage_is_applied_once_per_request() {
        let store = seeded();
        store.apply_usage(&record("r1", 300)).await.unwrap();
        store.apply_usage(&record("r1", 300)).await.unwrap();
        store.apply_usage(&record("r2", 200)).await.unwrap();

        let tenant = store.get_tenant("t").await.unwrap().unwrap();
        assert_eq!(tenant.balance_usd_micros, 500);
        assert_eq!(tenant.usage.total_requests, 2);
        let principal = store.get_principal("p").await.unwrap().unwrap();
        assert_eq!(principal.usage.total_cost_usd_micros, 500);
    }

    #[tokio::test]
    async fn internal_tenants_keep_their_balance() {
        let store = seeded();
        let mut tenant = store.get_tenant("t").await.unwrap().unwrap();
        tenant.status = TenantStatus::Internal;
        store.put_tenant(tenant).await.unwrap();
        store.apply_usage(&record("r1", 300)).await.unwrap();
        let tenant = store.get_tenant("t").await.unwrap().unwrap();
        assert_eq!(tenant.balance_usd_micros, 1_000);
        assert_eq!(tenant.usage.total_cost_usd_micros, 300);
    }

    #[test]
    fn duplicate_secrets_are_rejected() {
        let result = MemoryStore::seeded(
            [Tenant::new("t")],
            [Principal::new("a", "t", "same"), Principal::new("b", "t", "same")],
            Vec::<Channel>::new(),
            Vec::<ModelConfig>::new(),
        );
        assert!(matches!(result, Err(StoreError::Invalid(_))));
    }

    #[tokio::test]
    async fn writes_invalidate_the_mirror() {
        let cached = CachedStore::new(Arc::new(seeded()));
        let first = cached.tenant("t").await.unwrap().unwrap();
        assert_eq!(first.balance_usd_micros, 1_000);

        let mut updated = first.as_ref().clone();
        updated.balance_usd_micros = 5;
        cached.put_tenant(updated).await.unwrap();
        assert_eq!(
            cached.tenant("t").await.unwrap().unwrap().balance_usd_micros,
            5
        );

        cached.apply_usage(&record("r1", 2)).await.unwrap();
        assert_eq!(
            cached.tenant("t").await.unwrap().unwrap().balance_usd_micros,
            3
        );
    }

    #[test]
    fn stale_load_is_not_reinserted_after_a_write() {
        let mirror: Mirror<u32> = Mirror::new();
        let ticket = mirror.lookup("k").unwrap_err();
        mirror.invalidate("k");
        mirror.fill("k", Arc::new(1), ticket);
        assert!(mirror.lookup("k").is_err());

        let ticket = mirror.lookup("k").unwrap_err();
        mirror.fill("k", Arc::new(2), ticket);
        assert_eq!(*mirror.lookup("k").unwrap(), 2);
    }

    struct CountingStore {
        inner: MemoryStore,
        secret_lookups: AtomicUsize,
    }

    #[async_trait]
    impl PersistentStore for CountingStore {
        async fn get_tenant(&self, id: &str) -> Result<Option<Tenant>, StoreError> {
            self.inner.get_tenant(id).await
        }
        async fn put_tenant(&self, tenant: Tenant) -> Result<(), StoreError> {
            self.inner.put_tenant(tenant).await
        }
        async fn delete_tenant(&self, id: &str) -> Result<bool, StoreError> {
            self.inner.delete_tenant(id).await
        }
        async fn get_principal(&self, id: &str) -> Result<Option<Principal>, StoreError> {
            self.inner.get_principal(id).await
        }
        async fn find_principal_by_secret(
            &self,
            secret: &str,
        ) -> Result<Option<Principal>, StoreError> {
            self.secret_lookups.fetch_add(1, Ordering::SeqCst);
            self.inner.find_principal_by_secret(secret).await
        }
        async fn put_principal(&self, principal: Principal) -> Result<(), StoreError> {
            self.inner.put_principal(principal).await
        }
        async fn delete_principal(&self, id: &str) -> Result<bool, StoreError> {
            self.inner.delete_principal(id).await
        }
        async fn list_channels(&self) -> Result<Vec<Channel>, StoreError> {
            self.inner.list_channels().await
        }
        async fn put_channel(&self, channel: Channel) -> Result<(), StoreError> {
            self.inner.put_channel(channel).await
        }
        async fn delete_channel(&self, id: &str) -> Result<bool, StoreError> {
            self.inner.delete_channel(id).await
        }
        async fn list_models(&self) -> Result<Vec<ModelConfig>, StoreError> {
            self.inner.list_models().await
        }
        async fn put_model(&self, model: ModelConfig) -> Result<(), StoreError> {
            self.inner.put_model(model).await
        }
        async fn delete_model(&self, name: &str) -> Result<bool, StoreError> {
            self.inner.delete_model(name).await
        }
        async fn apply_usage(&self, record: &UsageRecord) -> Result<(), StoreError> {
            self.inner.apply_usage(record).await
        }
    }

    #[tokio::test]
    async fn usage_writes_keep_other_credentials_mirrored() {
        let mut tenant = Tenant::new("t");
        tenant.balance_usd_micros = 1_000;
        let inner = MemoryStore::seeded(
            [tenant],
            [
                Principal::new("p", "t", "sk-test"),
                Principal::new("q", "t", "sk-other"),
            ],
            Vec::<Channel>::new(),
            Vec::<ModelConfig>::new(),
        )
        .unwrap();
        let counting = Arc::new(CountingStore {
            inner,
            secret_lookups: AtomicUsize::new(0),
        });
        let cached = CachedStore::new(counting.clone());

        cached.principal_by_secret("sk-test").await.unwrap().unwrap();
        cached.principal_by_secret("sk-other").await.unwrap().unwrap();
        assert_eq!(counting.secret_lookups.load(Ordering::SeqCst), 2);

        for n in 0..5 {
            cached
                .apply_usage(&record(&format!("r{n}"), 10))
                .await
                .unwrap();
            cached.principal_by_secret("sk-other").await.unwrap().unwrap();
        }
        assert_eq!(counting.secret_lookups.load(Ordering::SeqCst), 2);

        // The charged principal is reloaded with its new usage.
        let charged = cached.principal_by_secret("sk-test").await.unwrap().unwrap();
        assert_eq!(charged.usage.total_cost_usd_micros, 50);
        assert_eq!(counting.secret_lookups.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn rotated_secret_stops_authenticating() {
        let cached = Arc::new(CachedStore::new(Arc::new(seeded())));
        let auth = StoreAuthProvider::new(cached.clone());
        let (tenant, principal) = auth.authenticate("sk-test").await.unwrap();
        assert_eq!(tenant.id, "t");
        assert_eq!(principal.id, "p");

        let mut rotated = principal.as_ref().clone();
        rotated.secret = "sk-new".to_string();
        cached.put_principal(rotated).await.unwrap();
        assert!(matches!(
            auth.authenticate("sk-test").await,
            Err(GatewayError::Unauthenticated)
        ));
        assert!(auth.authenticate("sk-new").await.is_ok());
    }

    #[test]
    fn credentials_come_from_bearer_or_api_key() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_credential(&headers), None);
        headers.insert("x-api-key", HeaderValue::from_static(" sk-a "));
        assert_eq!(extract_credential(&headers), Some("sk-a"));
        headers.insert("authorization", HeaderValue::from_static("Bearer sk-b"));
        assert_eq!(extract_credential(&headers), Some("sk-b"));
    }
}
