//! Bounded per-destination ring of recent delivery outcomes.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

/// Default ring capacity per destination.
pub const DEFAULT_CAPACITY: usize = 100;

/// One cached outcome: either the stored object or the error that stopped it.
#[derive(Debug, Clone, Serialize)]
pub struct CachedEvent {
    pub event_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

/// Observability ring of the most recent per-destination outcomes.
///
/// The cache is advisory: it never blocks delivery and holds at most
/// `capacity` entries per destination, evicting the oldest.
#[derive(Debug)]
pub struct EventsCache {
    capacity: usize,
    inner: Mutex<HashMap<String, VecDeque<CachedEvent>>>,
}

impl EventsCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Records a successful delivery.
    pub fn succeed(&self, destination_id: &str, event_id: &str, payload: Value, table: &str) {
        self.push(
            destination_id,
            CachedEvent {
                event_id: event_id.to_owned(),
                table: Some(table.to_owned()),
                payload: Some(payload),
                error: None,
                at: Utc::now(),
            },
        );
    }

    /// Records a failed delivery.
    pub fn error(&self, destination_id: &str, event_id: &str, error: impl ToString) {
        self.push(
            destination_id,
            CachedEvent {
                event_id: event_id.to_owned(),
                table: None,
                payload: None,
                error: Some(error.to_string()),
                at: Utc::now(),
            },
        );
    }

    /// Most recent `n` outcomes for a destination, newest first.
    pub fn get_n(&self, destination_id: &str, n: usize) -> Vec<CachedEvent> {
        let inner = self.inner.lock();
        inner
            .get(destination_id)
            .map(|ring| ring.iter().rev().take(n).cloned().collect())
            .unwrap_or_default()
    }

    fn push(&self, destination_id: &str, entry: CachedEvent) {
        let mut inner = self.inner.lock();
        let ring = inner.entry(destination_id.to_owned()).or_default();
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(entry);
    }
}

impl Default for EventsCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ring_is_bounded_and_newest_first() {
        let cache = EventsCache::new(2);
        cache.succeed("dst", "1", json!({"v": 1}), "events");
        cache.error("dst", "2", "boom");
        cache.succeed("dst", "3", json!({"v": 3}), "events");

        let recent = cache.get_n("dst", 10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].event_id, "3");
        assert_eq!(recent[1].event_id, "2");
        assert_eq!(recent[1].error.as_deref(), Some("boom"));
    }

    #[test]
    fn destinations_are_isolated() {
        let cache = EventsCache::default();
        cache.error("a", "1", "err");
        assert!(cache.get_n("b", 5).is_empty());
    }
}
