//! (function, idempotency key) -> execution id mapping with a TTL, so a
//! caller retrying with the same key reuses the original execution instead
//! of starting a second one.

use std::time::{Duration, Instant};

use dashmap::DashMap;

struct Entry {
    execution_id: String,
    created_at: Instant,
}

pub struct IdempotencyStore {
    entries: DashMap<String, Entry>,
    ttl: Duration,
}

impl IdempotencyStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    fn key(function_name: &str, idempotency_key: &str) -> String {
        format!("{function_name}\u{1f}{idempotency_key}")
    }

    /// Maps the key to `execution_id` unless a live mapping exists, in which
    /// case the existing execution id is returned. Expired mappings are
    /// replaced in place.
    pub fn put_if_absent(
        &self,
        function_name: &str,
        idempotency_key: &str,
        execution_id: &str,
    ) -> Option<String> {
        let now = Instant::now();
        let mut current = self
            .entries
            .entry(Self::key(function_name, idempotency_key))
            .or_insert_with(|| Entry {
                execution_id: execution_id.to_string(),
                created_at: now,
            });
        if current.execution_id == execution_id {
            return None;
        }
        if now.saturating_duration_since(current.created_at) >= self.ttl {
            current.execution_id = execution_id.to_string();
            current.created_at = now;
            return None;
        }
        Some(current.execution_id.clone())
    }

    /// Overwrites the mapping, refreshing its TTL. Used when a stale mapping
    /// points at an evicted execution.
    pub fn put(&self, function_name: &str, idempotency_key: &str, execution_id: &str) {
        self.entries.insert(
            Self::key(function_name, idempotency_key),
            Entry {
                execution_id: execution_id.to_string(),
                created_at: Instant::now(),
            },
        );
    }

    pub fn evict_expired(&self, now: Instant) {
        self.entries
            .retain(|_, entry| now.saturating_duration_since(entry.created_at) < self.ttl);
    }
}

impl Default for IdempotencyStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(600))
    }
}
