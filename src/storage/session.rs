//! Session operations.
//!
//! Key patterns:
//! - `session:{id}`: session record (JSON), sliding TTL
//! - `user_sessions:{user_id}`: set of live session ids for bulk revocation
//!
//! Session ids are handed to the client once and never logged.

use super::{decode_json, encode_json, KvStore, StoreError};
use crate::auth::session::{generate_session_id, is_well_formed};
use crate::models::SessionRecord;
use std::sync::Arc;
use std::time::Duration;
use zeroize::Zeroizing;

/// Opaque session identifier. Zeroized on drop; `Debug` never prints it.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionId(Zeroizing<String>);

impl SessionId {
    /// Accept a client-supplied identifier if it has the expected shape.
    pub fn parse(candidate: &str) -> Option<Self> {
        is_well_formed(candidate).then(|| Self(Zeroizing::new(candidate.to_string())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionId([REDACTED])")
    }
}

fn session_key(id: &SessionId) -> String {
    format!("session:{}", id.as_str())
}

fn user_sessions_key(user_id: &str) -> String {
    format!("user_sessions:{}", user_id)
}

#[derive(Clone)]
pub struct SessionStore {
    store: Arc<dyn KvStore>,
}

impl SessionStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Store a new session under a fresh random id with the given TTL.
    ///
    /// The caller delivers the returned id to the client.
    pub async fn create(
        &self,
        record: &SessionRecord,
        ttl: Duration,
    ) -> Result<SessionId, StoreError> {
        let id = SessionId(Zeroizing::new(generate_session_id()));
        let key = session_key(&id);
        let json = encode_json(&key, record)?;

        self.store.set_ex(&key, &json, ttl).await?;
        self.prune_expired(&record.user_id).await?;
        // Keep the tracking set alive at least as long as the session
        self.store
            .set_add(&user_sessions_key(&record.user_id), id.as_str(), ttl)
            .await?;

        Ok(id)
    }

    /// Drop ids of sessions that expired on their own from the tracking set.
    async fn prune_expired(&self, user_id: &str) -> Result<(), StoreError> {
        let tracking_key = user_sessions_key(user_id);
        let mut pruned = 0;
        for id in self.store.set_members(&tracking_key).await? {
            if self.store.get(&format!("session:{}", id)).await?.is_none() {
                self.store.set_remove(&tracking_key, &id).await?;
                pruned += 1;
            }
        }
        if pruned > 0 {
            tracing::debug!(user_id = %user_id, pruned, "Pruned expired session ids");
        }
        Ok(())
    }

    /// Look up a live session. Expired and unknown ids are both `None`.
    pub async fn get(&self, id: &SessionId) -> Result<Option<SessionRecord>, StoreError> {
        let key = session_key(id);
        match self.store.get(&key).await? {
            Some(data) => decode_json(&key, data).map(Some),
            None => Ok(None),
        }
    }

    /// Restart the TTL countdown. Returns false if the session is gone.
    ///
    /// The owner's tracking set is extended with it so bulk revocation keeps
    /// seeing long-lived sessions.
    pub async fn extend(
        &self,
        id: &SessionId,
        user_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let alive = self.store.expire(&session_key(id), ttl).await?;
        if alive {
            self.store.expire(&user_sessions_key(user_id), ttl).await?;
        }
        Ok(alive)
    }

    /// Delete a session. Deleting an absent session is not an error.
    pub async fn delete(&self, id: &SessionId) -> Result<(), StoreError> {
        let key = session_key(id);
        let record = match self.store.get(&key).await? {
            Some(data) => decode_json::<SessionRecord>(&key, data).ok(),
            None => None,
        };

        self.store.del(&key).await?;

        if let Some(record) = record {
            self.store
                .set_remove(&user_sessions_key(&record.user_id), id.as_str())
                .await?;
        }
        Ok(())
    }

    /// Delete every session of a user. Returns how many were still live.
    ///
    /// The tracking set goes with them, including ids that had already expired.
    pub async fn delete_all_for_user(&self, user_id: &str) -> Result<usize, StoreError> {
        let tracking_key = user_sessions_key(user_id);
        let mut revoked = 0;
        for id in self.store.set_members(&tracking_key).await? {
            if self.store.del(&format!("session:{}", id)).await? {
                revoked += 1;
            }
        }
        self.store.del(&tracking_key).await?;

        Ok(revoked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Plan;
    use crate::storage::MemoryStore;

    const TTL: Duration = Duration::from_secs(60);

    fn record(user_id: &str) -> SessionRecord {
        SessionRecord {
            user_id: user_id.to_string(),
            username: "abc123".to_string(),
            email: "abc@example.com".to_string(),
            verified: true,
            plan: Plan::Free,
            created_at: 1,
        }
    }

    fn sessions() -> (SessionStore, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (SessionStore::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let (sessions, _) = sessions();
        let id = sessions.create(&record("u1"), TTL).await.unwrap();

        let found = sessions.get(&id).await.unwrap();
        assert_eq!(found, Some(record("u1")));
    }

    #[tokio::test]
    async fn test_unknown_session_is_absent() {
        let (sessions, _) = sessions();
        let id = SessionId::parse(&generate_session_id()).unwrap();
        assert_eq!(sessions.get(&id).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_ttl_keeps_active_session_alive() {
        let (sessions, _) = sessions();
        let id = sessions.create(&record("u1"), TTL).await.unwrap();

        // Touched every 45s for five minutes: never expires.
        for _ in 0..7 {
            tokio::time::advance(Duration::from_secs(45)).await;
            assert!(sessions.extend(&id, "u1", TTL).await.unwrap());
            assert!(sessions.get(&id).await.unwrap().is_some());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_keeps_tracking_set_alive() {
        let (sessions, _) = sessions();
        let id = sessions.create(&record("u1"), TTL).await.unwrap();

        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(45)).await;
            sessions.extend(&id, "u1", TTL).await.unwrap();
        }
        assert_eq!(sessions.delete_all_for_user("u1").await.unwrap(), 1);
        assert_eq!(sessions.get(&id).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_session_is_reaped() {
        let (sessions, _) = sessions();
        let id = sessions.create(&record("u1"), TTL).await.unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(sessions.get(&id).await.unwrap(), None);
        assert!(!sessions.extend(&id, "u1", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (sessions, _) = sessions();
        let id = sessions.create(&record("u1"), TTL).await.unwrap();

        sessions.delete(&id).await.unwrap();
        assert_eq!(sessions.get(&id).await.unwrap(), None);
        sessions.delete(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_all_for_user() {
        let (sessions, _) = sessions();
        let a = sessions.create(&record("u1"), TTL).await.unwrap();
        let b = sessions.create(&record("u1"), TTL).await.unwrap();
        let other = sessions.create(&record("u2"), TTL).await.unwrap();

        assert_eq!(sessions.delete_all_for_user("u1").await.unwrap(), 2);
        assert_eq!(sessions.get(&a).await.unwrap(), None);
        assert_eq!(sessions.get(&b).await.unwrap(), None);
        assert!(sessions.get(&other).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_ids_leave_the_tracking_set() {
        let (sessions, store) = sessions();
        let tracking_key = user_sessions_key("u1");
        let first = sessions.create(&record("u1"), TTL).await.unwrap();

        tokio::time::advance(Duration::from_secs(45)).await;
        let second = sessions.create(&record("u1"), TTL).await.unwrap();
        assert_eq!(store.set_members(&tracking_key).await.unwrap().len(), 2);

        // `first` has now expired on its own
        tokio::time::advance(Duration::from_secs(20)).await;
        let third = sessions.create(&record("u1"), TTL).await.unwrap();

        let mut tracked = store.set_members(&tracking_key).await.unwrap();
        tracked.sort();
        let mut live = vec![second.as_str().to_string(), third.as_str().to_string()];
        live.sort();
        assert_eq!(tracked, live);
        assert!(!tracked.contains(&first.as_str().to_string()));

        assert_eq!(sessions.delete_all_for_user("u1").await.unwrap(), 2);
        assert!(store.set_members(&tracking_key).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_all_counts_only_live_sessions() {
        let (sessions, _) = sessions();
        sessions.create(&record("u1"), TTL).await.unwrap();
        tokio::time::advance(Duration::from_secs(45)).await;
        sessions.create(&record("u1"), TTL).await.unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;

        assert_eq!(sessions.delete_all_for_user("u1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_record_is_an_error() {
        let (sessions, store) = sessions();
        let id = SessionId::parse(&generate_session_id()).unwrap();
        store.set_ex(&session_key(&id), "not json", TTL).await.unwrap();

        assert!(matches!(
            sessions.get(&id).await,
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn test_store_outage_is_distinguishable_from_absence() {
        let (sessions, store) = sessions();
        let id = sessions.create(&record("u1"), TTL).await.unwrap();

        store.set_offline(true);
        assert!(matches!(
            sessions.get(&id).await,
            Err(StoreError::Unavailable(_))
        ));
    }

    #[test]
    fn test_session_id_debug_is_redacted() {
        let raw = generate_session_id();
        let id = SessionId::parse(&raw).unwrap();
        assert!(!format!("{:?}", id).contains(&raw));
        assert!(SessionId::parse("nope").is_none());
    }
}
