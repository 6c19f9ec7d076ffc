//! In-process backend for [`KvStore`], used by tests and single-node development.
//!
//! Expiry is measured on the tokio clock so paused-time tests can advance it.
//! Each operation runs under the owning shard's lock, which makes
//! `incr_window` and `take` atomic with respect to concurrent callers.

use super::{KvStore, StoreError, WindowCount};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Reported by operations stalled with [`MemoryStore::set_stalled`].
const STALL_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    slots: DashMap<String, Slot>,
    offline: AtomicBool,
    stalled: DashSet<&'static str>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the store becoming unreachable (or reachable again).
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Remaining TTL of a live key, `None` if absent or persistent.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.slots
            .get(key)
            .filter(|slot| slot.is_live(now))
            .and_then(|slot| slot.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    /// Make one operation (by its `KvStore` method name) time out, or stop
    /// doing so. Everything else keeps working.
    pub fn set_stalled(&self, op: &'static str, stalled: bool) {
        if stalled {
            self.stalled.insert(op);
        } else {
            self.stalled.remove(op);
        }
    }

    fn check_online(&self, op: &'static str) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        if self.stalled.contains(op) {
            return Err(StoreError::Timeout(STALL_TIMEOUT));
        }
        Ok(())
    }

    /// Live entry for `key`, dropping it first if it has expired.
    fn live_entry(&self, key: &str) -> Entry<'_, String, Slot> {
        let now = Instant::now();
        match self.slots.entry(key.to_string()) {
            Entry::Occupied(occupied) if !occupied.get().is_live(now) => {
                occupied.remove();
                self.slots.entry(key.to_string())
            }
            entry => entry,
        }
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Corrupt {
        key: key.to_string(),
        reason: "operation against a key holding the wrong kind of value".to_string(),
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_online("get")?;
        match self.live_entry(key) {
            Entry::Occupied(occupied) => match &occupied.get().value {
                Value::Text(text) => Ok(Some(text.clone())),
                Value::Set(_) => Err(wrong_type(key)),
            },
            Entry::Vacant(_) => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.check_online("set")?;
        self.slots.insert(
            key.to_string(),
            Slot {
                value: Value::Text(value.to_string()),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.check_online("set_ex")?;
        self.slots.insert(
            key.to_string(),
            Slot {
                value: Value::Text(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        self.check_online("set_nx")?;
        match self.live_entry(key) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(vacant) => {
                vacant.insert(Slot {
                    value: Value::Text(value.to_string()),
                    expires_at: None,
                });
                Ok(true)
            }
        }
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: &str,
    ) -> Result<bool, StoreError> {
        self.check_online("compare_and_set")?;
        match self.live_entry(key) {
            Entry::Occupied(mut occupied) => match &mut occupied.get_mut().value {
                Value::Text(text) if text == expected => {
                    *text = value.to_string();
                    Ok(true)
                }
                Value::Text(_) => Ok(false),
                Value::Set(_) => Err(wrong_type(key)),
            },
            Entry::Vacant(_) => Ok(false),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.check_online("expire")?;
        match self.live_entry(key) {
            Entry::Occupied(mut occupied) => {
                occupied.get_mut().expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            Entry::Vacant(_) => Ok(false),
        }
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        self.check_online("del")?;
        match self.live_entry(key) {
            Entry::Occupied(occupied) => {
                occupied.remove();
                Ok(true)
            }
            Entry::Vacant(_) => Ok(false),
        }
    }

    async fn take(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_online("take")?;
        match self.live_entry(key) {
            Entry::Occupied(occupied) => match occupied.remove().value {
                Value::Text(text) => Ok(Some(text)),
                Value::Set(_) => Err(wrong_type(key)),
            },
            Entry::Vacant(_) => Ok(None),
        }
    }

    async fn incr_window(&self, key: &str, window: Duration) -> Result<WindowCount, StoreError> {
        self.check_online("incr_window")?;
        let now = Instant::now();
        match self.live_entry(key) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                let count = match &slot.value {
                    Value::Text(text) => text.parse::<u64>().map_err(|_| wrong_type(key))? + 1,
                    Value::Set(_) => return Err(wrong_type(key)),
                };
                slot.value = Value::Text(count.to_string());
                let expires_at = *slot.expires_at.get_or_insert(now + window);
                Ok(WindowCount {
                    count,
                    resets_in: expires_at.saturating_duration_since(now),
                })
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot {
                    value: Value::Text("1".to_string()),
                    expires_at: Some(now + window),
                });
                Ok(WindowCount {
                    count: 1,
                    resets_in: window,
                })
            }
        }
    }

    async fn set_add(&self, key: &str, member: &str, ttl: Duration) -> Result<(), StoreError> {
        self.check_online("set_add")?;
        let expires_at = Instant::now() + ttl;
        match self.live_entry(key) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                match &mut slot.value {
                    Value::Set(members) => {
                        members.insert(member.to_string());
                    }
                    Value::Text(_) => return Err(wrong_type(key)),
                }
                slot.expires_at = Some(expires_at);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot {
                    value: Value::Set(HashSet::from([member.to_string()])),
                    expires_at: Some(expires_at),
                });
            }
        }
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.check_online("set_remove")?;
        if let Entry::Occupied(mut occupied) = self.live_entry(key) {
            let now_empty = match &mut occupied.get_mut().value {
                Value::Set(members) => {
                    members.remove(member);
                    members.is_empty()
                }
                Value::Text(_) => return Err(wrong_type(key)),
            };
            if now_empty {
                occupied.remove();
            }
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.check_online("set_members")?;
        match self.live_entry(key) {
            Entry::Occupied(occupied) => match &occupied.get().value {
                Value::Set(members) => Ok(members.iter().cloned().collect()),
                Value::Text(_) => Err(wrong_type(key)),
            },
            Entry::Vacant(_) => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_set_ex_expires() {
        let store = MemoryStore::new();
        store.set_ex("k", "v", Duration::from_secs(10)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(!store.del("k").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_resets_countdown() {
        let store = MemoryStore::new();
        store.set_ex("k", "v", Duration::from_secs(10)).await.unwrap();

        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(store.expire("k", Duration::from_secs(10)).await.unwrap());
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        assert!(!store.expire("missing", Duration::from_secs(10)).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_incr_window_resets_at_boundary() {
        let store = MemoryStore::new();
        let window = Duration::from_secs(60);

        assert_eq!(store.incr_window("c", window).await.unwrap().count, 1);
        tokio::time::advance(Duration::from_secs(30)).await;
        let second = store.incr_window("c", window).await.unwrap();
        assert_eq!(second.count, 2);
        assert_eq!(second.resets_in, Duration::from_secs(30));

        tokio::time::advance(Duration::from_secs(31)).await;
        let fresh = store.incr_window("c", window).await.unwrap();
        assert_eq!(fresh.count, 1);
        assert_eq!(fresh.resets_in, window);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_incr_window_concurrent_no_lost_updates() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..200 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .incr_window("hot", Duration::from_secs(60))
                    .await
                    .unwrap()
                    .count
            }));
        }

        let mut seen = Vec::new();
        for handle in handles {
            seen.push(handle.await.unwrap());
        }
        seen.sort_unstable();
        assert_eq!(seen, (1..=200).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_set_nx_and_take() {
        let store = MemoryStore::new();
        assert!(store.set_nx("claim", "a").await.unwrap());
        assert!(!store.set_nx("claim", "b").await.unwrap());
        assert_eq!(store.take("claim").await.unwrap().as_deref(), Some("a"));
        assert_eq!(store.take("claim").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_compare_and_set() {
        let store = MemoryStore::new();
        assert!(!store.compare_and_set("k", "a", "b").await.unwrap());

        store.set_ex("k", "a", Duration::from_secs(10)).await.unwrap();
        assert!(!store.compare_and_set("k", "stale", "b").await.unwrap());
        assert!(store.compare_and_set("k", "a", "b").await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("b"));

        // The swap keeps the existing expiry
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sets() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);
        store.set_add("s", "a", ttl).await.unwrap();
        store.set_add("s", "b", ttl).await.unwrap();
        let mut members = store.set_members("s").await.unwrap();
        members.sort();
        assert_eq!(members, vec!["a", "b"]);

        store.set_remove("s", "a").await.unwrap();
        store.set_remove("s", "b").await.unwrap();
        assert!(store.set_members("s").await.unwrap().is_empty());
        assert!(matches!(store.get("s").await, Ok(None)));
    }

    #[tokio::test]
    async fn test_stalled_operation_times_out() {
        let store = MemoryStore::new();
        store.set("k", "v").await.unwrap();
        store.set_stalled("expire", true);

        assert!(matches!(
            store.expire("k", Duration::from_secs(10)).await,
            Err(StoreError::Timeout(_))
        ));
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        store.set_stalled("expire", false);
        assert!(store.expire("k", Duration::from_secs(10)).await.unwrap());
    }

    #[tokio::test]
    async fn test_offline_reports_unavailable() {
        let store = MemoryStore::new();
        store.set("k", "v").await.unwrap();
        store.set_offline(true);
        assert!(matches!(store.get("k").await, Err(StoreError::Unavailable(_))));
        store.set_offline(false);
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
    }
}
