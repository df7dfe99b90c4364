use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use super::context::RequestContext;
use super::health::{HealthRegistry, HealthSnapshot};
use super::types::Channel;
use super::{Clock, GatewayError};

pub trait RandomSource: Send + Sync {
    fn next_u64(&self) -> u64;

    /// Uniform in `[0, 1)`.
    fn next_f64(&self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }
}

/// splitmix64 over an atomic counter: reproducible for a given seed.
#[derive(Debug)]
pub struct SeededRandom {
    state: AtomicU64,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            state: AtomicU64::new(seed),
        }
    }
}

impl RandomSource for SeededRandom {
    fn next_u64(&self) -> u64 {
        let mut z = self
            .state
            .fetch_add(0x9e37_79b9_7f4a_7c15, Ordering::Relaxed)
            .wrapping_add(0x9e37_79b9_7f4a_7c15);
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^ (z >> 31)
    }
}

/// OS randomness, with a time-seeded generator if the OS source fails.
#[derive(Debug)]
pub struct SystemRandom {
    fallback: SeededRandom,
}

impl Default for SystemRandom {
    fn default() -> Self {
        let seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|duration| duration.as_nanos() as u64)
            .unwrap_or(0);
        Self {
            fallback: SeededRandom::new(seed),
        }
    }
}

impl RandomSource for SystemRandom {
    fn next_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        if getrandom::fill(&mut bytes).is_err() {
            return self.fallback.next_u64();
        }
        u64::from_le_bytes(bytes)
    }
}

/// The channel set request tasks route over. Replaced wholesale on refresh.
#[derive(Clone, Debug, Default)]
pub struct RoutingTable {
    channels: Vec<Arc<Channel>>,
}

impl RoutingTable {
    pub fn new(channels: impl IntoIterator<Item = Channel>) -> Self {
        Self {
            channels: channels.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn channels(&self) -> &[Arc<Channel>] {
        &self.channels
    }

    pub fn get(&self, channel_id: &str) -> Option<&Arc<Channel>> {
        self.channels.iter().find(|channel| channel.id == channel_id)
    }
}

pub struct ChannelSelector {
    table: RwLock<Arc<RoutingTable>>,
    health: Arc<HealthRegistry>,
    random: Arc<dyn RandomSource>,
    clock: Arc<dyn Clock>,
}

impl ChannelSelector {
    pub fn new(
        table: RoutingTable,
        health: Arc<HealthRegistry>,
        random: Arc<dyn RandomSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            table: RwLock::new(Arc::new(table)),
            health,
            random,
            clock,
        }
    }

    pub fn table(&self) -> Arc<RoutingTable> {
        match self.table.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn replace_table(&self, table: RoutingTable) {
        let table = Arc::new(table);
        match self.table.write() {
            Ok(mut guard) => *guard = table,
            Err(poisoned) => *poisoned.into_inner() = table,
        }
    }

    pub fn health(&self) -> &Arc<HealthRegistry> {
        &self.health
    }

    /// Picks a channel for `model`. Excluded channels are only reused when `allow_reuse`
    /// is set and nothing else is eligible.
    pub fn select(
        &self,
        model: &str,
        ctx: &RequestContext,
        allow_reuse: bool,
    ) -> Result<Arc<Channel>, GatewayError> {
        self.select_where(|channel| channel.supports_model(model), ctx, allow_reuse)
            .ok_or_else(|| GatewayError::NoAvailableChannel {
                model: model.to_string(),
            })
    }

    /// Same algorithm for ancillary capabilities (`embeddings`, `images`, ...).
    pub fn select_for_capability(
        &self,
        capability: &str,
        ctx: &RequestContext,
    ) -> Result<Arc<Channel>, GatewayError> {
        self.select_where(
            |channel| channel.supports_capability(capability),
            ctx,
            false,
        )
        .ok_or_else(|| GatewayError::NoAvailableChannel {
            model: capability.to_string(),
        })
    }

    /// `true` while at least one unexcluded, unbanned channel supports `model`.
    pub fn has_alternative(&self, model: &str, ctx: &RequestContext) -> bool {
        let table = self.table();
        let health = self.health.snapshot();
        let now = self.clock.now_epoch_seconds();
        table.channels().iter().any(|channel| {
            is_candidate(channel, &health, now, |channel| channel.supports_model(model))
                && !ctx.is_excluded(&channel.id)
        })
    }

    fn select_where(
        &self,
        supports: impl Fn(&Channel) -> bool,
        ctx: &RequestContext,
        allow_reuse: bool,
    ) -> Option<Arc<Channel>> {
        let table = self.table();
        let health = self.health.snapshot();
        let now = self.clock.now_epoch_seconds();

        let candidates: Vec<&Arc<Channel>> = table
            .channels()
            .iter()
            .filter(|channel| is_candidate(channel, &health, now, &supports))
            .collect();
        let eligible: Vec<&Arc<Channel>> = candidates
            .iter()
            .copied()
            .filter(|channel| !ctx.is_excluded(&channel.id))
            .collect();

        if let Some(pin) = ctx.pin() {
            if let Some(pinned) = eligible.iter().find(|channel| channel.id == pin.channel_id) {
                return Some(Arc::clone(pinned));
            }
        }

        let pool = if !eligible.is_empty() {
            eligible
        } else if allow_reuse {
            candidates
        } else {
            return None;
        };
        pick_weighted(&pool, &health, self.random.as_ref()).cloned()
    }
}

fn is_candidate(
    channel: &Channel,
    health: &HealthSnapshot,
    now: u64,
    supports: impl Fn(&Channel) -> bool,
) -> bool {
    channel.enabled
        && channel.priority_weight > 0
        && supports(channel)
        && !health.is_banned(&channel.id, now)
}

/// `weight = priority_weight * health_factor`, sampled proportionally.
pub fn pick_weighted<'a>(
    pool: &[&'a Arc<Channel>],
    health: &HealthSnapshot,
    random: &dyn RandomSource,
) -> Option<&'a Arc<Channel>> {
    let weights: Vec<f64> = pool
        .iter()
        .map(|channel| f64::from(channel.priority_weight) * health.health_factor(&channel.id))
        .collect();
    let total: f64 = weights.iter().sum();
    if pool.is_empty() || !(total > 0.0) {
        return pool.first().copied();
    }

    let mut pick = random.next_f64() * total;
    for (channel, weight) in pool.iter().copied().zip(&weights) {
        if pick < *weight {
            return Some(channel);
        }
        pick -= weight;
    }
    // Float rounding can leave `pick` a hair above the last bucket.
    pool.last().copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ManualClock;
    use crate::gateway::context::{ChannelPin, PinSource};
    use crate::gateway::health::{CallOutcome, HealthConfig};
    use crate::gateway::types::{Principal, Tenant};
    use crate::gateway::upstream::UpstreamErrorKind;

    fn ctx() -> RequestContext {
        RequestContext::new(
            "r",
            Arc::new(Tenant::new("t")),
            Arc::new(Principal::new("p", "t", "sk")),
            0,
        )
    }

    fn selector(channels: Vec<Channel>, seed: u64) -> ChannelSelector {
        let clock = Arc::new(ManualClock::new(1_000));
        let health = Arc::new(HealthRegistry::new(HealthConfig::default(), clock.clone()));
        ChannelSelector::new(
            RoutingTable::new(channels),
            health,
            Arc::new(SeededRandom::new(seed)),
            clock,
        )
    }

    #[test]
    fn never_returns_unsupported_or_excluded_channels() {
        let selector = selector(
            vec![
                Channel::new("a", "http://a").with_models(["gpt-4o"]),
                Channel::new("b", "http://b").with_models(["claude-*"]),
                Channel::new("c", "http://c").with_models(["gpt-*"]),
            ],
            7,
        );
        let mut ctx = ctx();
        ctx.exclude("a");
        for _ in 0..200 {
            let channel = selector.select("gpt-4o", &ctx, false).unwrap();
            assert_eq!(channel.id, "c");
        }
        ctx.exclude("c");
        assert!(matches!(
            selector.select("gpt-4o", &ctx, false),
            Err(GatewayError::NoAvailableChannel { .. })
        ));
        assert!(!selector.has_alternative("gpt-4o", &ctx));
        let reused = selector.select("gpt-4o", &ctx, true).unwrap();
        assert!(reused.id == "a" || reused.id == "c");
    }

    #[test]
    fn banned_channels_are_skipped() {
        let selector = selector(
            vec![
                Channel::new("a", "http://a").with_models(["m"]),
                Channel::new("b", "http://b").with_models(["m"]),
            ],
            1,
        );
        for _ in 0..5 {
            selector.health().record(
                "a",
                CallOutcome::Failure(UpstreamErrorKind::Timeout),
                None,
            );
        }
        let ctx = ctx();
        for _ in 0..100 {
            assert_eq!(selector.select("m", &ctx, true).unwrap().id, "b");
        }
    }

    #[test]
    fn eligible_pin_wins_and_ineligible_pin_is_ignored() {
        let selector = selector(
            vec![
                Channel::new("a", "http://a").with_models(["m"]),
                Channel::new("b", "http://b").with_models(["m"]).with_weight(1_000),
            ],
            3,
        );
        let mut ctx = ctx();
        ctx.set_pin(ChannelPin {
            channel_id: "a".to_string(),
            source: PinSource::Header,
        })
        .unwrap();
        assert_eq!(selector.select("m", &ctx, false).unwrap().id, "a");
        ctx.exclude("a");
        assert_eq!(selector.select("m", &ctx, false).unwrap().id, "b");
    }

    #[test]
    fn capability_selection_uses_the_capability_filter() {
        let mut images = Channel::new("img", "http://img");
        images.capabilities.insert("images".to_string());
        let selector = selector(
            vec![Channel::new("chat", "http://chat").with_models(["*"]), images],
            5,
        );
        let ctx = ctx();
        assert_eq!(
            selector.select_for_capability("images", &ctx).unwrap().id,
            "img"
        );
        assert!(selector.select_for_capability("audio", &ctx).is_err());
    }

    #[test]
    fn zero_weight_and_disabled_channels_never_win() {
        let mut disabled = Channel::new("off", "http://off").with_models(["m"]);
        disabled.enabled = false;
        let selector = selector(
            vec![
                disabled,
                Channel::new("zero", "http://zero").with_models(["m"]).with_weight(0),
                Channel::new("on", "http://on").with_models(["m"]),
            ],
            11,
        );
        let ctx = ctx();
        for _ in 0..50 {
            assert_eq!(selector.select("m", &ctx, false).unwrap().id, "on");
        }
    }

    #[test]
    fn seeded_random_is_reproducible_and_in_range() {
        let left = SeededRandom::new(42);
        let right = SeededRandom::new(42);
        for _ in 0..100 {
            let value = left.next_f64();
            assert!((0.0..1.0).contains(&value));
            assert_eq!(value, right.next_f64());
        }
    }
}
