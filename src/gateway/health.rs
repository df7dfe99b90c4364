use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};

use super::Clock;
use super::upstream::UpstreamErrorKind;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Rolling window over which the error rate is computed.
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
    /// No ban decision is taken on fewer samples than this.
    #[serde(default = "default_min_samples")]
    pub min_samples: u32,
    #[serde(default = "default_error_threshold")]
    pub error_threshold: f64,
    #[serde(default = "default_ban_base_seconds")]
    pub ban_base_seconds: u64,
    #[serde(default = "default_ban_max_seconds")]
    pub ban_max_seconds: u64,
    /// Offense count resets after this long without a new ban.
    #[serde(default = "default_offense_decay_seconds")]
    pub offense_decay_seconds: u64,
    /// `health_factor = 1 / (1 + sensitivity * error_rate)`.
    #[serde(default = "default_sensitivity")]
    pub sensitivity: f64,
}

fn default_window_seconds() -> u64 {
    60
}

fn default_min_samples() -> u32 {
    5
}

fn default_error_threshold() -> f64 {
    0.5
}

fn default_ban_base_seconds() -> u64 {
    30
}

fn default_ban_max_seconds() -> u64 {
    30 * 60
}

fn default_offense_decay_seconds() -> u64 {
    60 * 60
}

fn default_sensitivity() -> f64 {
    9.0
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window_seconds: default_window_seconds(),
            min_samples: default_min_samples(),
            error_threshold: default_error_threshold(),
            ban_base_seconds: default_ban_base_seconds(),
            ban_max_seconds: default_ban_max_seconds(),
            offense_decay_seconds: default_offense_decay_seconds(),
            sensitivity: default_sensitivity(),
        }
    }
}

impl HealthConfig {
    /// `base * 2^(offense-1)`, capped.
    pub fn ban_duration(&self, offense: u32) -> u64 {
        let shift = offense.saturating_sub(1).min(32);
        self.ban_base_seconds
            .saturating_mul(1u64 << shift)
            .min(self.ban_max_seconds)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failure(UpstreamErrorKind),
}

#[derive(Clone, Debug, Default)]
struct ChannelHealth {
    /// `(epoch_seconds, failed)`.
    samples: VecDeque<(u64, bool)>,
    banned_until: Option<u64>,
    offenses: u32,
    last_offense_at: Option<u64>,
    last_error: Option<String>,
    last_failure_ts_ms: Option<u64>,
}

impl ChannelHealth {
    fn prune(&mut self, now: u64, window_seconds: u64) {
        let cutoff = now.saturating_sub(window_seconds);
        while self
            .samples
            .front()
            .is_some_and(|(at, _)| *at < cutoff)
        {
            self.samples.pop_front();
        }
    }

    fn error_rate(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let failures = self.samples.iter().filter(|(_, failed)| *failed).count();
        failures as f64 / self.samples.len() as f64
    }

    fn is_banned(&self, now: u64) -> bool {
        self.banned_until.is_some_and(|until| now < until)
    }

    /// Returns the new ban deadline when this sample triggered one.
    fn record(&mut self, now: u64, failed: bool, config: &HealthConfig) -> Option<u64> {
        self.prune(now, config.window_seconds);
        self.samples.push_back((now, failed));
        if self.is_banned(now) || self.samples.len() < config.min_samples as usize {
            return None;
        }
        if self.error_rate() < config.error_threshold {
            return None;
        }

        if self
            .last_offense_at
            .is_some_and(|at| now.saturating_sub(at) > config.offense_decay_seconds)
        {
            self.offenses = 0;
        }
        self.offenses = self.offenses.saturating_add(1);
        self.last_offense_at = Some(now);
        let until = now.saturating_add(config.ban_duration(self.offenses));
        self.banned_until = Some(until);
        // A channel coming back from a ban starts with a clean window.
        self.samples.clear();
        Some(until)
    }

    fn view(&self, now: u64) -> ChannelHealthView {
        ChannelHealthView {
            error_rate: self.error_rate(),
            samples: u32::try_from(self.samples.len()).unwrap_or(u32::MAX),
            banned_until: self.banned_until.filter(|until| now < *until),
            offenses: self.offenses,
            last_error: self.last_error.clone(),
            last_failure_ts_ms: self.last_failure_ts_ms,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ChannelHealthView {
    pub error_rate: f64,
    pub samples: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub banned_until: Option<u64>,
    pub offenses: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_ts_ms: Option<u64>,
}

/// Immutable view published to request tasks.
#[derive(Clone, Debug, Default, Serialize)]
pub struct HealthSnapshot {
    pub taken_at: u64,
    pub sensitivity: f64,
    pub channels: HashMap<String, ChannelHealthView>,
}

impl HealthSnapshot {
    pub fn is_banned(&self, channel_id: &str, now: u64) -> bool {
        self.channels
            .get(channel_id)
            .and_then(|view| view.banned_until)
            .is_some_and(|until| now < until)
    }

    pub fn error_rate(&self, channel_id: &str) -> f64 {
        self.channels
            .get(channel_id)
            .map(|view| view.error_rate)
            .unwrap_or(0.0)
    }

    /// Strictly decreasing in the error rate; 1.0 for an unknown or clean channel.
    pub fn health_factor(&self, channel_id: &str) -> f64 {
        let sensitivity = if self.sensitivity.is_finite() && self.sensitivity > 0.0 {
            self.sensitivity
        } else {
            default_sensitivity()
        };
        1.0 / (1.0 + sensitivity * self.error_rate(channel_id).clamp(0.0, 1.0))
    }
}

/// Live per-channel health plus the snapshot request tasks read. Writers update the
/// live map; the snapshot is swapped on refresh and whenever a ban starts.
pub struct HealthRegistry {
    config: HealthConfig,
    clock: Arc<dyn Clock>,
    live: Mutex<HashMap<String, ChannelHealth>>,
    snapshot: RwLock<Arc<HealthSnapshot>>,
}

impl HealthRegistry {
    pub fn new(config: HealthConfig, clock: Arc<dyn Clock>) -> Self {
        let snapshot = HealthSnapshot {
            taken_at: clock.now_epoch_seconds(),
            sensitivity: config.sensitivity,
            channels: HashMap::new(),
        };
        Self {
            config,
            clock,
            live: Mutex::new(HashMap::new()),
            snapshot: RwLock::new(Arc::new(snapshot)),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    pub fn snapshot(&self) -> Arc<HealthSnapshot> {
        match self.snapshot.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Feeds one classified upstream outcome. Caller-caused failures are not counted.
    /// Returns the ban deadline when this outcome banned the channel.
    pub fn record(
        &self,
        channel_id: &str,
        outcome: CallOutcome,
        message: Option<&str>,
    ) -> Option<u64> {
        let failed = match outcome {
            CallOutcome::Success => false,
            CallOutcome::Failure(kind) if kind.counts_against_channel() => true,
            CallOutcome::Failure(_) => return None,
        };
        let now = self.clock.now_epoch_seconds();
        let banned = {
            let Ok(mut live) = self.live.lock() else {
                return None;
            };
            let health = live.entry(channel_id.to_string()).or_default();
            if failed {
                health.last_error = message.map(str::to_string);
                health.last_failure_ts_ms = Some(self.clock.now_millis());
            }
            health.record(now, failed, &self.config)
        };

        if let Some(until) = banned {
            tracing::warn!(
                channel = %channel_id,
                banned_until = until,
                "channel auto-banned after error rate crossed threshold"
            );
            self.refresh();
        }
        banned
    }

    /// Rebuilds and publishes the snapshot.
    pub fn refresh(&self) {
        let now = self.clock.now_epoch_seconds();
        let channels = {
            let Ok(mut live) = self.live.lock() else {
                return;
            };
            live.iter_mut()
                .map(|(id, health)| {
                    health.prune(now, self.config.window_seconds);
                    (id.clone(), health.view(now))
                })
                .collect()
        };
        let snapshot = Arc::new(HealthSnapshot {
            taken_at: now,
            sensitivity: self.config.sensitivity,
            channels,
        });
        match self.snapshot.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }

    /// Drops state for channels that no longer exist.
    pub fn retain_channels(&self, keep: &dyn Fn(&str) -> bool) {
        if let Ok(mut live) = self.live.lock() {
            live.retain(|id, _| keep(id));
        }
    }
}
