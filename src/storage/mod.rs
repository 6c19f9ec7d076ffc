//! Shared key-value store layer for sessions, identity snapshots, rate-limit
//! counters and the store-backed user directory.
//!
//! All coordination between request handlers happens through the atomic
//! primitives of [`KvStore`]; nothing here holds in-process shared state.
//! Records are serialized to JSON before they reach the store.

pub mod identity;
pub mod memory;
pub mod redis;
pub mod session;
pub mod user;

pub use identity::IdentityCache;
pub use memory::MemoryStore;
pub use self::redis::RedisStore;
pub use session::{SessionId, SessionStore};
pub use user::{KvUserDirectory, NewUser, RepositoryError, UserDirectory, UserRepository};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use zeroize::Zeroizing;

/// Failure talking to the shared store.
///
/// Absence of a key is never an error; every variant here means the store
/// could not answer and callers must fail closed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("corrupt record under {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl From<::redis::RedisError> for StoreError {
    fn from(err: ::redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Result of one fixed-window increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Counter value after this increment.
    pub count: u64,
    /// Time left until the window (and the counter) expires.
    pub resets_in: Duration,
}

/// Network key-value store with TTLs and atomic counters.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Store without expiry.
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Store with a TTL, replacing any previous value and TTL.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Store only if the key is absent. Returns true if the value was written.
    async fn set_nx(&self, key: &str, value: &str) -> Result<bool, StoreError>;

    /// Reset the TTL of an existing key. Returns false if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Delete a key. Returns false if it was already absent.
    async fn del(&self, key: &str) -> Result<bool, StoreError>;

    /// Replace the value of `key` only if it still holds `expected`. The TTL,
    /// if any, is kept. Returns false if the key changed or is absent.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: &str,
    ) -> Result<bool, StoreError>;

    /// Atomically fetch and delete a key.
    async fn take(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Atomically increment a counter, starting its window on the first
    /// increment. The increment and the expiry are one operation.
    async fn incr_window(&self, key: &str, window: Duration) -> Result<WindowCount, StoreError>;

    /// Add a member to a set and keep the set alive for at least `ttl`.
    async fn set_add(&self, key: &str, member: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;
}

/// Fetch and decode a JSON record. The raw JSON is zeroized after decoding.
pub(crate) async fn get_json<T>(store: &dyn KvStore, key: &str) -> Result<Option<T>, StoreError>
where
    T: DeserializeOwned,
{
    match store.get(key).await? {
        Some(data) => decode_json(key, data).map(Some),
        None => Ok(None),
    }
}

pub(crate) fn decode_json<T>(key: &str, data: String) -> Result<T, StoreError>
where
    T: DeserializeOwned,
{
    let zeroizing_data = Zeroizing::new(data);
    serde_json::from_str(&zeroizing_data).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

pub(crate) fn encode_json<T>(key: &str, value: &T) -> Result<String, StoreError>
where
    T: Serialize,
{
    serde_json::to_string(value).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Whole seconds for store TTL arguments, never below one.
pub(crate) fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}
