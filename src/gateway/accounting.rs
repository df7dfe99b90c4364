//! Off-request-path usage accounting.
//!
//! Request tasks hand a [`ConsumptionEvent`] to [`UsageAccountant::record`], which never
//! blocks. A small worker pool prices each event and folds it into the store. While
//! the store is unavailable a worker keeps failed records in a bounded backlog and
//! retries with capped exponential backoff. Anything that has to be dropped is
//! logged with `data_loss = true`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;

use super::store::StoreError;
use super::types::{ConsumptionEvent, Outcome};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccountingConfig {
    /// Events queued per worker before new ones are dropped.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Records a worker holds for retry while the store is unavailable.
    #[serde(default = "default_retry_buffer")]
    pub retry_buffer: usize,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
    /// Periodic window applied to tenant usage counters.
    #[serde(default = "default_tenant_window_seconds")]
    pub tenant_window_seconds: u64,
}

fn default_queue_capacity() -> usize {
    4096
}

fn default_workers() -> usize {
    2
}

fn default_retry_buffer() -> usize {
    8192
}

fn default_retry_base_ms() -> u64 {
    200
}

fn default_retry_max_ms() -> u64 {
    30_000
}

fn default_tenant_window_seconds() -> u64 {
    24 * 60 * 60
}

impl Default for AccountingConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            workers: default_workers(),
            retry_buffer: default_retry_buffer(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            tenant_window_seconds: default_tenant_window_seconds(),
        }
    }
}

/// A priced consumption, ready to be folded into tenant and principal counters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub request_id: String,
    pub tenant_id: String,
    pub principal_id: String,
    pub tokens: u64,
    pub cost_usd_micros: u64,
    pub at_epoch_seconds: u64,
    pub tenant_window_seconds: u64,
}

impl UsageRecord {
    /// `None` for events that consumed nothing billable: rejections, upstream
    /// failures, and cancellations before any token was produced.
    pub fn from_event(event: &ConsumptionEvent, tenant_window_seconds: u64) -> Option<Self> {
        let cost_usd_micros = match &event.outcome {
            Outcome::Success => event
                .pricing
                .as_ref()
                .map(|pricing| pricing.cost_usd_micros(event.usage))
                .unwrap_or(0),
            Outcome::CacheHit => 0,
            Outcome::Cancelled if event.usage.total() > 0 => event
                .pricing
                .as_ref()
                .map(|pricing| pricing.cost_usd_micros(event.usage))
                .unwrap_or(0),
            Outcome::Cancelled | Outcome::Rejected { .. } | Outcome::UpstreamFailure { .. } => {
                return None;
            }
        };
        Some(Self {
            request_id: event.request_id.clone(),
            tenant_id: event.tenant_id.clone(),
            principal_id: event.principal_id.clone(),
            tokens: event.usage.total(),
            cost_usd_micros,
            at_epoch_seconds: event.timestamp_ms / 1000,
            tenant_window_seconds,
        })
    }
}

#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn apply(&self, record: &UsageRecord) -> Result<(), StoreError>;

    /// Sees every event a worker takes off its queue, billable or not.
    fn observe(&self, _event: &ConsumptionEvent) {}
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountingStats {
    pub enqueued: u64,
    pub applied: u64,
    /// Events that carried nothing billable.
    pub unbilled: u64,
    pub retries: u64,
    pub dropped: u64,
    pub pending: u64,
}

#[derive(Default)]
struct Shared {
    enqueued: AtomicU64,
    applied: AtomicU64,
    unbilled: AtomicU64,
    retries: AtomicU64,
    dropped: AtomicU64,
    pending: AtomicU64,
    idle: Notify,
}

impl Shared {
    fn settle(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pending| {
                Some(pending.saturating_sub(1))
            });
        self.idle.notify_waiters();
    }
}

pub struct UsageAccountant {
    senders: RwLock<Vec<mpsc::Sender<ConsumptionEvent>>>,
    next_sender: AtomicUsize,
    shared: Arc<Shared>,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl UsageAccountant {
    /// Spawns the worker pool on the current runtime.
    pub fn start(config: AccountingConfig, sink: Arc<dyn UsageSink>) -> Self {
        let workers = config.workers.max(1);
        let capacity = config.queue_capacity.max(1);
        let backlog_capacity = (config.retry_buffer / workers).max(1);
        let shared = Arc::new(Shared::default());

        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let (tx, rx) = mpsc::channel(capacity);
            let worker = Worker {
                index,
                rx,
                sink: sink.clone(),
                shared: shared.clone(),
                config: config.clone(),
                backlog: VecDeque::new(),
                backlog_capacity,
                failures: 0,
                retry_at: None,
            };
            senders.push(tx);
            handles.push(tokio::spawn(worker.run()));
        }

        Self {
            senders: RwLock::new(senders),
            next_sender: AtomicUsize::new(0),
            shared,
            workers: Mutex::new(handles),
        }
    }

    /// Hands the event to a worker without waiting. Drops it, loudly, when every
    /// worker queue is full or the accountant has been drained.
    pub fn record(&self, event: ConsumptionEvent) {
        let senders = match self.senders.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if senders.is_empty() {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                data_loss = true,
                request_id = %event.request_id,
                tenant_id = %event.tenant_id,
                "usage accountant is shut down; dropping consumption event"
            );
            return;
        }

        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        let start = self.next_sender.fetch_add(1, Ordering::Relaxed);
        let mut event = event;
        for offset in 0..senders.len() {
            let sender = &senders[(start + offset) % senders.len()];
            match sender.try_send(event) {
                Ok(()) => {
                    self.shared.enqueued.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(mpsc::error::TrySendError::Full(returned))
                | Err(mpsc::error::TrySendError::Closed(returned)) => event = returned,
            }
        }

        tracing::error!(
            data_loss = true,
            request_id = %event.request_id,
            tenant_id = %event.tenant_id,
            "usage queue full; dropping consumption event"
        );
        self.shared.settle(&self.shared.dropped);
    }

    pub fn stats(&self) -> AccountingStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        AccountingStats {
            enqueued: load(&self.shared.enqueued),
            applied: load(&self.shared.applied),
            unbilled: load(&self.shared.unbilled),
            retries: load(&self.shared.retries),
            dropped: load(&self.shared.dropped),
            pending: self.shared.pending.load(Ordering::Acquire),
        }
    }

    /// Waits until every accepted event has been applied or dropped. Returns `false`
    /// when `timeout` passes first.
    pub async fn flush(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.shared.idle.notified();
                if self.shared.pending.load(Ordering::Acquire) == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    /// Stops accepting events, lets the workers finish their queues and backlogs,
    /// and waits for them up to `timeout`. Workers still busy after that are
    /// aborted and their pending events reported as lost.
    pub async fn drain(&self, timeout: Duration) -> bool {
        match self.senders.write() {
            Ok(mut guard) => guard.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
        let handles = match self.workers.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        let aborts: Vec<_> = handles.iter().map(|handle| handle.abort_handle()).collect();

        let finished = tokio::time::timeout(timeout, futures_util::future::join_all(handles))
            .await
            .is_ok();
        if !finished {
            for abort in aborts {
                abort.abort();
            }
            let lost = self.shared.pending.swap(0, Ordering::AcqRel);
            self.shared.dropped.fetch_add(lost, Ordering::Relaxed);
            tracing::error!(
                data_loss = true,
                lost_events = lost,
                timeout_ms = timeout.as_millis() as u64,
                "usage accountant drain timed out"
            );
        } else {
            tracing::info!("usage accountant drained");
        }
        finished
    }
}

struct Worker {
    index: usize,
    rx: mpsc::Receiver<ConsumptionEvent>,
    sink: Arc<dyn UsageSink>,
    shared: Arc<Shared>,
    config: AccountingConfig,
    backlog: VecDeque<UsageRecord>,
    backlog_capacity: usize,
    failures: u32,
    retry_at: Option<Instant>,
}

enum Applied {
    Done,
    Retry,
}

impl Worker {
    async fn run(mut self) {
        let mut open = true;
        loop {
            if !open && self.backlog.is_empty() {
                break;
            }
            let retry_at = self.retry_at.unwrap_or_else(Instant::now);
            tokio::select! {
                received = self.rx.recv(), if open => match received {
                    Some(event) => self.accept(event).await,
                    None => open = false,
                },
                _ = tokio::time::sleep_until(retry_at), if !self.backlog.is_empty() => {
                    self.retry_front().await;
                }
            }
        }
        tracing::debug!(worker = self.index, "usage worker stopped");
    }

    async fn accept(&mut self, event: ConsumptionEvent) {
        self.sink.observe(&event);
        let Some(record) = UsageRecord::from_event(&event, self.config.tenant_window_seconds)
        else {
            tracing::debug!(
                request_id = %event.request_id,
                tenant_id = %event.tenant_id,
                outcome = ?event.outcome,
                "unbilled consumption event"
            );
            self.shared.settle(&self.shared.unbilled);
            return;
        };

        // Keep order behind records already waiting for the store.
        if !self.backlog.is_empty() {
            self.push_backlog(record);
            return;
        }
        if let Applied::Retry = self.apply(&record).await {
            self.push_backlog(record);
        }
    }

    async fn retry_front(&mut self) {
        let Some(record) = self.backlog.pop_front() else {
            return;
        };
        self.shared.retries.fetch_add(1, Ordering::Relaxed);
        if let Applied::Retry = self.apply(&record).await {
            self.backlog.push_front(record);
        }
    }

    async fn apply(&mut self, record: &UsageRecord) -> Applied {
        match self.sink.apply(record).await {
            Ok(()) => {
                if self.failures > 0 {
                    tracing::info!(
                        worker = self.index,
                        backlog = self.backlog.len(),
                        "usage store reachable again"
                    );
                }
                self.failures = 0;
                self.retry_at = None;
                self.shared.settle(&self.shared.applied);
                Applied::Done
            }
            Err(StoreError::Unavailable(message)) => {
                self.failures = self.failures.saturating_add(1);
                let backoff = self.backoff();
                self.retry_at = Some(Instant::now() + backoff);
                tracing::warn!(
                    worker = self.index,
                    request_id = %record.request_id,
                    error = %message,
                    backoff_ms = backoff.as_millis() as u64,
                    "usage store unavailable; will retry"
                );
                Applied::Retry
            }
            Err(err) => {
                tracing::error!(
                    data_loss = true,
                    request_id = %record.request_id,
                    tenant_id = %record.tenant_id,
                    error = %err,
                    "usage record rejected by store; dropping"
                );
                self.shared.settle(&self.shared.dropped);
                Applied::Done
            }
        }
    }

    fn push_backlog(&mut self, record: UsageRecord) {
        if self.backlog.len() >= self.backlog_capacity {
            if let Some(oldest) = self.backlog.pop_front() {
                tracing::error!(
                    data_loss = true,
                    request_id = %oldest.request_id,
                    tenant_id = %oldest.tenant_id,
                    cost_usd_micros = oldest.cost_usd_micros,
                    "usage retry buffer full; dropping oldest record"
                );
                self.shared.settle(&self.shared.dropped);
            }
        }
        self.backlog.push_back(record);
    }

    fn backoff(&self) -> Duration {
        let exponent = self.failures.saturating_sub(1).min(32);
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        Duration::from_millis(
            self.config
                .retry_base_ms
                .saturating_mul(factor)
                .min(self.config.retry_max_ms),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;
    use crate::gateway::costing::ModelPricing;
    use crate::gateway::store::{MemoryStore, PersistentStore};
    use crate::gateway::types::{Principal, Tenant, TokenUsage};

    fn event(request_id: &str, outcome: Outcome) -> ConsumptionEvent {
        ConsumptionEvent {
            request_id: request_id.to_string(),
            tenant_id: "t".to_string(),
            principal_id: "p".to_string(),
            channel_id: Some("c".to_string()),
            model: Some("m".to_string()),
            usage: TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
            },
            pricing: Some(ModelPricing {
                input_usd_micros_per_token: 2,
                output_usd_micros_per_token: 4,
                per_request_usd_micros: 0,
            }),
            outcome,
            attempts: 1,
            latency_ms: 12,
            timestamp_ms: 1_000_000,
        }
    }

    fn store() -> Arc<MemoryStore> {
        let mut tenant = Tenant::new("t");
        tenant.balance_usd_micros = 1_000;
        Arc::new(
            MemoryStore::seeded(
                [tenant],
                [Principal::new("p", "t", "sk")],
                Vec::new(),
                Vec::new(),
            )
            .unwrap(),
        )
    }

    fn config() -> AccountingConfig {
        AccountingConfig {
            workers: 1,
            retry_base_ms: 1,
            retry_max_ms: 5,
            ..AccountingConfig::default()
        }
    }

    #[test]
    fn only_consumption_is_billed() {
        let success = UsageRecord::from_event(&event("a", Outcome::Success), 60).unwrap();
        assert_eq!(success.cost_usd_micros, 40);
        assert_eq!(success.tokens, 15);

        let hit = UsageRecord::from_event(&event("b", Outcome::CacheHit), 60).unwrap();
        assert_eq!(hit.cost_usd_micros, 0);
        assert_eq!(hit.tokens, 15);

        let rejected = event(
            "c",
            Outcome::Rejected {
                reason: "rate_limited".to_string(),
            },
        );
        assert!(UsageRecord::from_event(&rejected, 60).is_none());

        let mut cancelled = event("d", Outcome::Cancelled);
        cancelled.usage = TokenUsage::default();
        assert!(UsageRecord::from_event(&cancelled, 60).is_none());
    }

    #[tokio::test]
    async fn events_reach_the_store() {
        let store = store();
        let accountant = UsageAccountant::start(config(), store.clone());
        accountant.record(event("a", Outcome::Success));
        accountant.record(event("b", Outcome::CacheHit));
        accountant.record(event(
            "c",
            Outcome::Rejected {
                reason: "disabled".to_string(),
            },
        ));
        assert!(accountant.flush(Duration::from_secs(5)).await);

        let tenant = store.get_tenant("t").await.unwrap().unwrap();
        assert_eq!(tenant.balance_usd_micros, 960);
        assert_eq!(tenant.usage.total_requests, 2);
        let stats = accountant.stats();
        assert_eq!(stats.applied, 2);
        assert_eq!(stats.unbilled, 1);
        assert_eq!(stats.pending, 0);
    }

    struct Flaky {
        inner: Arc<MemoryStore>,
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl UsageSink for Flaky {
        async fn apply(&self, record: &UsageRecord) -> Result<(), StoreError> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::Unavailable("connection refused".to_string()));
            }
            self.inner.apply_usage(record).await
        }
    }

    #[tokio::test]
    async fn unavailable_store_is_retried_in_order() {
        let store = store();
        let sink = Arc::new(Flaky {
            inner: store.clone(),
            failures_left: AtomicU32::new(3),
        });
        let accountant = UsageAccountant::start(config(), sink);
        accountant.record(event("a", Outcome::Success));
        accountant.record(event("b", Outcome::Success));
        assert!(accountant.flush(Duration::from_secs(5)).await);

        let tenant = store.get_tenant("t").await.unwrap().unwrap();
        assert_eq!(tenant.balance_usd_micros, 920);
        let stats = accountant.stats();
        assert_eq!(stats.applied, 2);
        assert!(stats.retries >= 3);
        assert_eq!(stats.dropped, 0);
    }

    struct Gate(Notify);

    #[async_trait]
    impl UsageSink for Gate {
        async fn apply(&self, _record: &UsageRecord) -> Result<(), StoreError> {
            self.0.notified().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn full_queue_drops_and_counts() {
        let gate = Arc::new(Gate(Notify::new()));
        let accountant = UsageAccountant::start(
            AccountingConfig {
                queue_capacity: 1,
                ..config()
            },
            gate.clone(),
        );
        for index in 0..5 {
            accountant.record(event(&format!("r{index}"), Outcome::Success));
        }
        // One event in the worker at most, one in the queue.
        assert!(accountant.stats().dropped >= 3);

        let stats = accountant.stats();
        assert_eq!(stats.enqueued + stats.dropped, 5);
    }

    #[tokio::test]
    async fn drain_stops_intake() {
        let accountant = UsageAccountant::start(config(), store());
        accountant.record(event("a", Outcome::Success));
        assert!(accountant.drain(Duration::from_secs(5)).await);
        assert_eq!(accountant.stats().applied, 1);

        accountant.record(event("b", Outcome::Success));
        assert_eq!(accountant.stats().dropped, 1);
    }

    #[tokio::test]
    async fn drain_gives_up_after_timeout() {
        let gate = Arc::new(Gate(Notify::new()));
        let accountant = UsageAccountant::start(config(), gate);
        accountant.record(event("a", Outcome::Success));
        assert!(!accountant.drain(Duration::from_millis(50)).await);
        let stats = accountant.stats();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.dropped, 1);
    }
}
