//! Identity snapshot cache.
//!
//! Key pattern: `identity:{user_id}`: denormalized profile snapshot (JSON).
//!
//! Snapshots are eventually consistent. Any write to a cached field must go
//! through [`crate::accounts::IdentityWriter`], which invalidates the snapshot
//! in the same operation.

use super::{encode_json, get_json, KvStore, RepositoryError, StoreError, UserRepository};
use crate::models::IdentitySnapshot;
use std::sync::Arc;
use std::time::Duration;

fn identity_key(user_id: &str) -> String {
    format!("identity:{}", user_id)
}

#[derive(Clone)]
pub struct IdentityCache {
    store: Arc<dyn KvStore>,
    ttl: Duration,
}

impl IdentityCache {
    /// `ttl` is used when read-through populates the cache.
    pub fn new(store: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub async fn get(&self, user_id: &str) -> Result<Option<IdentitySnapshot>, StoreError> {
        get_json(self.store.as_ref(), &identity_key(user_id)).await
    }

    pub async fn set(
        &self,
        user_id: &str,
        snapshot: &IdentitySnapshot,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let key = identity_key(user_id);
        let json = encode_json(&key, snapshot)?;
        self.store.set_ex(&key, &json, ttl).await
    }

    /// Drop the cached snapshot so the next read goes to the directory.
    pub async fn invalidate(&self, user_id: &str) -> Result<(), StoreError> {
        self.store.del(&identity_key(user_id)).await.map(|_| ())
    }

    /// Cached snapshot, or the directory's record after populating the cache.
    ///
    /// Cache failures never fail the read: a broken or unreachable cache
    /// degrades to a directory read. Directory failures propagate.
    pub async fn read_through<R>(
        &self,
        user_id: &str,
        repo: &R,
    ) -> Result<Option<IdentitySnapshot>, RepositoryError>
    where
        R: UserRepository + ?Sized,
    {
        match self.get(user_id).await {
            Ok(Some(snapshot)) => return Ok(Some(snapshot)),
            Ok(None) => {}
            Err(StoreError::Corrupt { .. }) => {
                tracing::warn!(user_id = %user_id, "Discarding corrupt identity snapshot");
                let _ = self.invalidate(user_id).await;
            }
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Identity cache read failed");
            }
        }

        let Some(user) = repo.find_user_by_id(user_id).await? else {
            return Ok(None);
        };
        let snapshot = IdentitySnapshot::from(&user);

        if let Err(e) = self.set(user_id, &snapshot, self.ttl).await {
            tracing::warn!(user_id = %user_id, error = %e, "Identity cache populate failed");
        }

        Ok(Some(snapshot))
    }
}
