use std::collections::HashMap;
use std::hash::{BuildHasher, RandomState};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

/// One counter touched by a rate check: `amount` is added to `key` unless that would
/// push it past `limit`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WindowCheck {
    pub key: String,
    pub limit: u64,
    pub amount: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WindowDecision {
    Allowed,
    /// `index` points into the submitted checks; `current` is the count before this request.
    Limited { index: usize, current: u64 },
}

#[derive(Debug, Error)]
pub enum CounterStoreError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
    #[error("counter store returned an unexpected result: {0}")]
    Malformed(String),
}

/// Fixed-window counters shared by every gateway instance.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// All-or-nothing: either every counter is incremented or none is. A zero limit
    /// always rejects.
    async fn check_and_increment(
        &self,
        window_start: u64,
        window_seconds: u64,
        checks: &[WindowCheck],
    ) -> Result<WindowDecision, CounterStoreError>;

    fn name(&self) -> &'static str;
}

const DEFAULT_SHARDS: usize = 16;

/// Process-local counters, sharded by key so unrelated tenants do not contend on
/// one lock.
#[derive(Debug)]
pub struct MemoryCounterStore {
    shards: Vec<Mutex<HashMap<String, WindowCount>>>,
    hasher: RandomState,
    last_gc_window: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
struct WindowCount {
    window_start: u64,
    count: u64,
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shards(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1))
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
            hasher: RandomState::new(),
            last_gc_window: AtomicU64::new(0),
        }
    }

    fn shard_of(&self, key: &str) -> usize {
        (self.hasher.hash_one(key) % self.shards.len() as u64) as usize
    }

    /// Runs once per forward rollover. A late caller still holding an older window
    /// never sweeps.
    async fn sweep_if_rolled_over(&self, window_start: u64) {
        let previous = self.last_gc_window.fetch_max(window_start, Ordering::Relaxed);
        if window_start <= previous {
            return;
        }
        for shard in &self.shards {
            shard
                .lock()
                .await
                .retain(|_, slot| slot.window_start >= window_start);
        }
    }

    #[cfg(test)]
    async fn tracked_keys(&self) -> usize {
        let mut total = 0;
        for shard in &self.shards {
            total += shard.lock().await.len();
        }
        total
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn check_and_increment(
        &self,
        window_start: u64,
        _window_seconds: u64,
        checks: &[WindowCheck],
    ) -> Result<WindowDecision, CounterStoreError> {
        self.sweep_if_rolled_over(window_start).await;

        let placement: Vec<usize> = checks
            .iter()
            .map(|check| self.shard_of(&check.key))
            .collect();
        let mut order = placement.clone();
        order.sort_unstable();
        order.dedup();

        // Ascending shard order keeps concurrent multi-key checks deadlock free.
        let mut guards = Vec::with_capacity(order.len());
        for index in &order {
            guards.push(self.shards[*index].lock().await);
        }
        let guard_of = |shard: usize| order.binary_search(&shard).unwrap_or_default();

        for (index, check) in checks.iter().enumerate() {
            // A request stamped with an older window than the key has already seen
            // is charged against the newer one.
            let current = guards[guard_of(placement[index])]
                .get(&check.key)
                .filter(|slot| slot.window_start >= window_start)
                .map(|slot| slot.count)
                .unwrap_or(0);
            if check.limit == 0 || current.saturating_add(check.amount) > check.limit {
                return Ok(WindowDecision::Limited { index, current });
            }
        }

        for (index, check) in checks.iter().enumerate() {
            let slot = guards[guard_of(placement[index])]
                .entry(check.key.clone())
                .or_insert(WindowCount {
                    window_start,
                    count: 0,
                });
            if slot.window_start < window_start {
                slot.window_start = window_start;
                slot.count = 0;
            }
            slot.count = slot.count.saturating_add(check.amount);
        }
        Ok(WindowDecision::Allowed)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Shared store first, process-local counters while it is unreachable. Limits then
/// hold per instance rather than cluster-wide. Malformed answers are not masked.
pub struct FallbackCounterStore {
    primary: Arc<dyn CounterStore>,
    local: MemoryCounterStore,
    degraded: AtomicBool,
}

impl FallbackCounterStore {
    pub fn new(primary: Arc<dyn CounterStore>) -> Self {
        Self {
            primary,
            local: MemoryCounterStore::new(),
            degraded: AtomicBool::new(false),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl CounterStore for FallbackCounterStore {
    async fn check_and_increment(
        &self,
        window_start: u64,
        window_seconds: u64,
        checks: &[WindowCheck],
    ) -> Result<WindowDecision, CounterStoreError> {
        match self
            .primary
            .check_and_increment(window_start, window_seconds, checks)
            .await
        {
            Ok(decision) => {
                if self.degraded.swap(false, Ordering::Relaxed) {
                    tracing::info!(store = self.primary.name(), "counter store recovered");
                }
                Ok(decision)
            }
            Err(CounterStoreError::Unavailable(message)) => {
                if !self.degraded.swap(true, Ordering::Relaxed) {
                    tracing::warn!(
                        store = self.primary.name(),
                        error = %message,
                        "counter store unavailable; enforcing limits with local counters"
                    );
                }
                self.local
                    .check_and_increment(window_start, window_seconds, checks)
                    .await
            }
            Err(err) => Err(err),
        }
    }

    fn name(&self) -> &'static str {
        "fallback"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(key: &str, limit: u64, amount: u64) -> WindowCheck {
        WindowCheck {
            key: key.to_string(),
            limit,
            amount,
        }
    }

    #[tokio::test]
    async fn rejects_past_limit_without_partial_increments() {
        let store = MemoryCounterStore::new();
        for _ in 0..2 {
            assert_eq!(
                store
                    .check_and_increment(0, 60, &[check("a", 2, 1), check("b", 10, 1)])
                    .await
                    .unwrap(),
                WindowDecision::Allowed
            );
        }
        assert_eq!(
            store
                .check_and_increment(0, 60, &[check("b", 10, 1), check("a", 2, 1)])
                .await
                .unwrap(),
            WindowDecision::Limited {
                index: 1,
                current: 2
            }
        );
        // "b" was not bumped by the rejected call.
        assert_eq!(
            store
                .check_and_increment(0, 60, &[check("b", 3, 1)])
                .await
                .unwrap(),
            WindowDecision::Allowed
        );
        assert_eq!(
            store
                .check_and_increment(0, 60, &[check("b", 3, 1)])
                .await
                .unwrap(),
            WindowDecision::Limited {
                index: 0,
                current: 3
            }
        );
    }

    #[tokio::test]
    async fn zero_limit_always_rejects() {
        let store = MemoryCounterStore::new();
        assert!(matches!(
            store
                .check_and_increment(0, 60, &[check("a", 0, 0)])
                .await
                .unwrap(),
            WindowDecision::Limited { .. }
        ));
    }

    #[tokio::test]
    async fn new_window_starts_from_zero_and_drops_old_keys() {
        let store = MemoryCounterStore::new();
        store
            .check_and_increment(0, 60, &[check("a", 1, 1), check("old", 5, 1)])
            .await
            .unwrap();
        assert!(matches!(
            store
                .check_and_increment(0, 60, &[check("a", 1, 1)])
                .await
                .unwrap(),
            WindowDecision::Limited { .. }
        ));
        assert_eq!(
            store
                .check_and_increment(60, 60, &[check("a", 1, 1)])
                .await
                .unwrap(),
            WindowDecision::Allowed
        );
        assert_eq!(store.tracked_keys().await, 1);
    }

    #[tokio::test]
    async fn late_request_from_older_window_keeps_current_counts() {
        let store = MemoryCounterStore::new();
        for _ in 0..2 {
            store
                .check_and_increment(120, 60, &[check("a", 2, 1)])
                .await
                .unwrap();
        }
        // Read the clock before the boundary, reached the store after it.
        assert_eq!(
            store
                .check_and_increment(60, 60, &[check("b", 2, 1)])
                .await
                .unwrap(),
            WindowDecision::Allowed
        );
        assert_eq!(
            store
                .check_and_increment(60, 60, &[check("a", 2, 1)])
                .await
                .unwrap(),
            WindowDecision::Limited {
                index: 0,
                current: 2
            }
        );
        assert_eq!(
            store
                .check_and_increment(120, 60, &[check("a", 2, 1)])
                .await
                .unwrap(),
            WindowDecision::Limited {
                index: 0,
                current: 2
            }
        );
    }

    #[tokio::test]
    async fn checks_spanning_shards_stay_all_or_nothing() {
        let store = MemoryCounterStore::with_shards(4);
        let keys: Vec<String> = (0..8).map(|n| format!("key-{n}")).collect();
        let mut checks: Vec<WindowCheck> = keys.iter().map(|key| check(key, 5, 1)).collect();
        checks.push(check("tight", 1, 1));
        assert_eq!(
            store.check_and_increment(0, 60, &checks).await.unwrap(),
            WindowDecision::Allowed
        );
        assert!(matches!(
            store.check_and_increment(0, 60, &checks).await.unwrap(),
            WindowDecision::Limited { index: 8, current: 1 }
        ));
        for key in &keys {
            assert_eq!(
                store
                    .check_and_increment(0, 60, &[check(key, 2, 1)])
                    .await
                    .unwrap(),
                WindowDecision::Allowed
            );
        }
    }

    #[tokio::test]
    async fn concurrent_tenants_do_not_lose_increments() {
        let store = Arc::new(MemoryCounterStore::new());
        let mut tasks = Vec::new();
        for tenant in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let key = format!("req:t{tenant}");
                for _ in 0..25 {
                    let checks = [check(&key, 100, 1), check("global", 1000, 1)];
                    store.check_and_increment(0, 60, &checks).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(
            store
                .check_and_increment(0, 60, &[check("global", 200, 1)])
                .await
                .unwrap(),
            WindowDecision::Limited {
                index: 0,
                current: 200
            }
        );
    }

    struct DownStore;

    #[async_trait]
    impl CounterStore for DownStore {
        async fn check_and_increment(
            &self,
            _window_start: u64,
            _window_seconds: u64,
            _checks: &[WindowCheck],
        ) -> Result<WindowDecision, CounterStoreError> {
            Err(CounterStoreError::Unavailable("connection refused".to_string()))
        }

        fn name(&self) -> &'static str {
            "down"
        }
    }

    struct GarbageStore;

    #[async_trait]
    impl CounterStore for GarbageStore {
        async fn check_and_increment(
            &self,
            _window_start: u64,
            _window_seconds: u64,
            _checks: &[WindowCheck],
        ) -> Result<WindowDecision, CounterStoreError> {
            Err(CounterStoreError::Malformed("-1".to_string()))
        }

        fn name(&self) -> &'static str {
            "garbage"
        }
    }

    #[tokio::test]
    async fn fallback_enforces_locally_when_primary_is_down() {
        let store = FallbackCounterStore::new(Arc::new(DownStore));
        assert_eq!(
            store
                .check_and_increment(0, 60, &[check("a", 1, 1)])
                .await
                .unwrap(),
            WindowDecision::Allowed
        );
        assert!(store.is_degraded());
        assert!(matches!(
            store
                .check_and_increment(0, 60, &[check("a", 1, 1)])
                .await
                .unwrap(),
            WindowDecision::Limited { .. }
        ));
    }

    #[tokio::test]
    async fn fallback_does_not_mask_malformed_results() {
        let store = FallbackCounterStore::new(Arc::new(GarbageStore));
        assert!(matches!(
            store.check_and_increment(0, 60, &[check("a", 1, 1)]).await,
            Err(CounterStoreError::Malformed(_))
        ));
    }
}
