//! Last-known-value cache.
//!
//! The cache keeps only the most recent telemetry event per topic, together
//! with the sequence high-water mark used to reject duplicates and
//! out-of-order events. Every entry belongs to a session epoch; resetting the
//! cache bumps the epoch so that events still in flight from the previous
//! session are refused.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::model::TelemetryEvent;
use crate::topic::TopicPattern;

/// Outcome of offering an event to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accept {
    /// New value; it is now the cached value for its topic.
    Fresh,
    /// Sequence number at or below the last accepted one for the topic.
    Duplicate { last_seq: u64 },
    /// Event belongs to a session that is no longer active.
    WrongEpoch,
}

/// A cached value with its age at lookup time.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue {
    pub event: TelemetryEvent,
    pub age: Duration,
    /// Older than the auto-stale interval configured for its topic.
    pub stale: bool,
}

#[derive(Debug, Clone)]
struct Entry {
    event: TelemetryEvent,
    last_seq: u64,
}

/// Per-topic cache of the most recent telemetry event.
#[derive(Debug, Clone, Default)]
pub struct LastValueCache {
    epoch: u64,
    entries: HashMap<String, Entry>,
    /// Auto-stale intervals; first matching pattern wins.
    autostale: Vec<(TopicPattern, Duration)>,
}

impl LastValueCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark values on topics matching `pattern` stale after `after`.
    pub fn with_autostale(mut self, pattern: TopicPattern, after: Duration) -> Self {
        self.autostale.push((pattern, after));
        self
    }

    /// Current session epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Drop every cached value and start a new epoch.
    pub fn reset(&mut self) -> u64 {
        self.epoch += 1;
        self.entries.clear();
        self.epoch
    }

    /// Offer an event received during `epoch`.
    pub fn accept(&mut self, epoch: u64, event: &TelemetryEvent) -> Accept {
        if epoch != self.epoch {
            return Accept::WrongEpoch;
        }

        if let Some(entry) = self.entries.get_mut(&event.topic) {
            if event.seq <= entry.last_seq {
                return Accept::Duplicate {
                    last_seq: entry.last_seq,
                };
            }
            entry.last_seq = event.seq;
            entry.event = event.clone();
        } else {
            self.entries.insert(
                event.topic.clone(),
                Entry {
                    event: event.clone(),
                    last_seq: event.seq,
                },
            );
        }

        Accept::Fresh
    }

    /// Cached value for an exact topic.
    pub fn get(&self, topic: &str, now: DateTime<Utc>) -> Option<CachedValue> {
        self.entries.get(topic).map(|e| self.describe(e, now))
    }

    /// Cached values for every topic matching `pattern`, ordered by topic.
    pub fn matching(&self, pattern: &TopicPattern, now: DateTime<Utc>) -> Vec<CachedValue> {
        let mut values: Vec<CachedValue> = self
            .entries
            .values()
            .filter(|e| pattern.matches(&e.event.topic))
            .map(|e| self.describe(e, now))
            .collect();
        values.sort_by(|a, b| a.event.topic.cmp(&b.event.topic));
        values
    }

    /// Last accepted sequence number for a topic.
    pub fn last_seq(&self, topic: &str) -> Option<u64> {
        self.entries.get(topic).map(|e| e.last_seq)
    }

    /// Sequence high-water marks of all topics.
    pub fn high_water_marks(&self) -> BTreeMap<String, u64> {
        self.entries
            .iter()
            .map(|(topic, e)| (topic.clone(), e.last_seq))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn describe(&self, entry: &Entry, now: DateTime<Utc>) -> CachedValue {
        let age = (now - entry.event.received_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let stale = self
            .autostale
            .iter()
            .find(|(pattern, _)| pattern.matches(&entry.event.topic))
            .map(|(_, after)| age > *after)
            .unwrap_or(false);

        CachedValue {
            event: entry.event.clone(),
            age,
            stale,
        }
    }
}
