//! Zonebot Cache
//!
//! Time-bounded memoization of store lookups and derived values. Entries
//! expire passively on read and are swept periodically; correctness never
//! depends on a hit, a miss always falls back to the store.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

struct Entry {
    value: serde_json::Value,
    inserted: Instant,
    ttl: Duration,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted) >= self.ttl
    }
}

#[derive(Default)]
pub struct TtlCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl TtlCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a value if present and not past its TTL. Expired entries are
    /// removed on the spot.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let mut entries = self.entries.lock().ok()?;
        let now = Instant::now();
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }

    /// Insert or silently overwrite.
    pub fn set(&self, key: &str, value: serde_json::Value, ttl_secs: u64) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(
                key.to_string(),
                Entry {
                    value,
                    inserted: Instant::now(),
                    ttl: Duration::from_secs(ttl_secs),
                },
            );
        }
    }

    pub fn delete(&self, key: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(key);
        }
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key)
            .and_then(|value| serde_json::from_value(value).ok())
    }

    pub fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl_secs: u64) {
        if let Ok(value) = serde_json::to_value(value) {
            self.set(key, value, ttl_secs);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let Ok(mut entries) = self.entries.lock() else {
            return 0;
        };
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    /// Background sweeper; runs until the process exits.
    pub async fn run_sweeper(self: Arc<Self>, interval_secs: u64) {
        loop {
            tokio::time::sleep(Duration::from_secs(interval_secs)).await;
            let removed = self.sweep();
            if removed > 0 {
                debug!("Cache sweep removed {} expired entries", removed);
            }
        }
    }
}

/// Key helpers shared across components, kept in one place so invalidation
/// sites cannot drift from lookup sites.
pub mod keys {
    pub fn trigger(chat_id: i64, kind: &str) -> String {
        format!("trigger:{}:{}", chat_id, kind)
    }

    pub fn triggers_listing(chat_id: i64) -> String {
        format!("triggers:{}", chat_id)
    }

    pub fn release(user_id: i64) -> String {
        format!("release:{}", user_id)
    }

    pub fn admin(chat_id: i64, user_id: i64) -> String {
        format!("admin:{}:{}", chat_id, user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_returns_value() {
        let cache = TtlCache::new();
        cache.set("k", serde_json::json!({"delay": 45}), 60);
        let value = cache.get("k").expect("hit");
        assert_eq!(value["delay"], 45);
    }

    #[test]
    fn expired_entry_is_never_served() {
        let cache = TtlCache::new();
        cache.set("k", serde_json::json!(true), 0);
        assert!(cache.get("k").is_none());
        assert!(cache.is_empty(), "expired entry removed on read");
    }

    #[test]
    fn set_overwrites_silently() {
        let cache = TtlCache::new();
        cache.set("k", serde_json::json!(1), 60);
        cache.set("k", serde_json::json!(2), 60);
        assert_eq!(cache.get("k"), Some(serde_json::json!(2)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn delete_removes_entry() {
        let cache = TtlCache::new();
        cache.set("k", serde_json::json!(1), 60);
        cache.delete("k");
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn sweep_drops_only_expired_entries() {
        let cache = TtlCache::new();
        cache.set("dead", serde_json::json!(1), 0);
        cache.set("live", serde_json::json!(2), 600);
        let removed = cache.sweep();
        assert_eq!(removed, 1);
        assert_eq!(cache.get("live"), Some(serde_json::json!(2)));
    }

    #[test]
    fn typed_round_trip() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Cached {
            delay: i64,
            message: String,
        }

        let cache = TtlCache::new();
        let value = Cached {
            delay: 45,
            message: "Welcome!".to_string(),
        };
        cache.set_json("trigger:1:enter", &value, 60);
        let back: Cached = cache.get_json("trigger:1:enter").expect("hit");
        assert_eq!(back, value);
    }

    #[test]
    fn key_helpers_have_stable_shapes() {
        assert_eq!(keys::trigger(-100, "enter"), "trigger:-100:enter");
        assert_eq!(keys::triggers_listing(-100), "triggers:-100");
        assert_eq!(keys::release(7), "release:7");
        assert_eq!(keys::admin(-100, 7), "admin:-100:7");
    }
}
