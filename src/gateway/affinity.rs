use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use super::Clock;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Affinity {
    pub channel_id: String,
    pub model: String,
}

#[derive(Debug)]
struct Entry {
    affinity: Affinity,
    expires_at: u64,
}

/// Remembers which channel produced a stored response so follow-up steps of a
/// multi-step job land on the same provider. Bounded; oldest entries are evicted first.
pub struct AffinityTable {
    clock: Arc<dyn Clock>,
    ttl_seconds: u64,
    capacity: usize,
    inner: Mutex<AffinityInner>,
}

#[derive(Debug, Default)]
struct AffinityInner {
    entries: HashMap<String, Entry>,
    order: VecDeque<String>,
}

impl AffinityTable {
    pub fn new(clock: Arc<dyn Clock>, ttl_seconds: u64, capacity: usize) -> Self {
        Self {
            clock,
            ttl_seconds,
            capacity: capacity.max(1),
            inner: Mutex::new(AffinityInner::default()),
        }
    }

    pub fn record(&self, response_id: &str, channel_id: &str, model: &str) {
        let expires_at = self
            .clock
            .now_epoch_seconds()
            .saturating_add(self.ttl_seconds);
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        let previous = inner.entries.insert(
            response_id.to_string(),
            Entry {
                affinity: Affinity {
                    channel_id: channel_id.to_string(),
                    model: model.to_string(),
                },
                expires_at,
            },
        );
        if previous.is_none() {
            inner.order.push_back(response_id.to_string());
        }
        while inner.entries.len() > self.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.entries.remove(&oldest);
        }
    }

    pub fn lookup(&self, response_id: &str) -> Option<Affinity> {
        let now = self.clock.now_epoch_seconds();
        let Ok(mut inner) = self.inner.lock() else {
            return None;
        };
        match inner.entries.get(response_id) {
            Some(entry) if now < entry.expires_at => Some(entry.affinity.clone()),
            Some(_) => {
                inner.entries.remove(response_id);
                inner.order.retain(|id| id != response_id);
                None
            }
            None => None,
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.entries.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Paths whose responses carry an id that later requests can reference.
pub fn is_stored_response_path(path: &str) -> bool {
    path == "/v1/responses" || path.starts_with("/v1/responses/")
}

/// `/v1/responses/{id}` and `/v1/responses/{id}/...` reference a stored response.
pub fn response_id_from_path(path: &str) -> Option<&str> {
    let rest = path.strip_prefix("/v1/responses/")?;
    let id = rest.split('/').next()?.trim();
    (!id.is_empty()).then_some(id)
}
