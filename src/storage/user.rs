//! User directory seam and its key-value store implementation.
//!
//! Key patterns:
//! - `user:{id}`: user record (JSON), no TTL
//! - `credential:{id}`: password hash (JSON), no TTL
//! - `username:{lowercased}`: username claim, value is the user id
//! - `email:{lowercased}`: email claim, value is the user id
//!
//! Credentials are never cached anywhere else.

use super::{decode_json, encode_json, get_json, KvStore, StoreError};
use crate::models::{Credential, Plan, Role, UserRecord};
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("username already taken")]
    UsernameTaken,

    #[error("email already registered")]
    EmailTaken,

    #[error("user not found")]
    NotFound,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Read side of the user directory, as consumed by the auth core.
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_user_by_id(&self, id: &str) -> Result<Option<UserRecord>, RepositoryError>;

    async fn find_credential_by_user_id(
        &self,
        id: &str,
    ) -> Result<Option<Credential>, RepositoryError>;

    /// Resolve a username or an email address to a user id.
    async fn find_user_id_by_login(&self, login: &str) -> Result<Option<String>, RepositoryError>;
}

/// Write side of the user directory.
///
/// Writes that change a cached identity field belong in
/// [`crate::accounts::IdentityWriter`], not in handlers.
#[async_trait]
pub trait UserDirectory: UserRepository {
    async fn create_user(&self, new_user: NewUser) -> Result<UserRecord, RepositoryError>;

    /// Apply `mutate` to the stored record atomically and return the result.
    ///
    /// `mutate` may run more than once if the record changes underneath it,
    /// so it must not have side effects of its own.
    async fn update_user(
        &self,
        id: &str,
        mutate: &(dyn for<'r> Fn(&'r mut UserRecord) + Send + Sync),
    ) -> Result<UserRecord, RepositoryError>;

    async fn set_password_hash(&self, user_id: &str, hash: &str) -> Result<(), RepositoryError>;
}

/// Input for [`UserDirectory::create_user`].
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password_hash: String,
}

fn user_key(id: &str) -> String {
    format!("user:{}", id)
}

fn credential_key(id: &str) -> String {
    format!("credential:{}", id)
}

fn username_key(username: &str) -> String {
    format!("username:{}", username.to_lowercase())
}

fn email_key(email: &str) -> String {
    format!("email:{}", email.to_lowercase())
}

/// User directory stored in the shared key-value store.
#[derive(Clone)]
pub struct KvUserDirectory {
    store: Arc<dyn KvStore>,
}

impl KvUserDirectory {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl UserRepository for KvUserDirectory {
    async fn find_user_by_id(&self, id: &str) -> Result<Option<UserRecord>, RepositoryError> {
        Ok(get_json(self.store.as_ref(), &user_key(id)).await?)
    }

    async fn find_credential_by_user_id(
        &self,
        id: &str,
    ) -> Result<Option<Credential>, RepositoryError> {
        Ok(get_json(self.store.as_ref(), &credential_key(id)).await?)
    }

    async fn find_user_id_by_login(&self, login: &str) -> Result<Option<String>, RepositoryError> {
        let key = if login.contains('@') {
            email_key(login)
        } else {
            username_key(login)
        };
        Ok(self.store.get(&key).await?)
    }
}

#[async_trait]
impl UserDirectory for KvUserDirectory {
    async fn create_user(&self, new_user: NewUser) -> Result<UserRecord, RepositoryError> {
        let id = nanoid::nanoid!(12);

        // Claims are taken atomically so two concurrent registrations cannot
        // both win the same username or email.
        let username_claim = username_key(&new_user.username);
        if !self.store.set_nx(&username_claim, &id).await? {
            return Err(RepositoryError::UsernameTaken);
        }
        let email_claim = email_key(&new_user.email);
        if !self.store.set_nx(&email_claim, &id).await? {
            self.store.del(&username_claim).await?;
            return Err(RepositoryError::EmailTaken);
        }

        let user = UserRecord {
            id: id.clone(),
            username: new_user.username,
            email: new_user.email,
            display_name: None,
            avatar_url: None,
            verified: false,
            plan: Plan::Free,
            role: Role::Member,
            active: true,
            mfa_enabled: false,
            link_count: 0,
            profile_views: 0,
            created_at: chrono::Utc::now().timestamp(),
        };
        let credential = Credential {
            user_id: id.clone(),
            password_hash: new_user.password_hash,
        };

        let credential_key = credential_key(&id);
        self.store
            .set(&credential_key, &encode_json(&credential_key, &credential)?)
            .await?;
        let user_key = user_key(&id);
        self.store
            .set(&user_key, &encode_json(&user_key, &user)?)
            .await?;

        Ok(user)
    }

    async fn update_user(
        &self,
        id: &str,
        mutate: &(dyn for<'r> Fn(&'r mut UserRecord) + Send + Sync),
    ) -> Result<UserRecord, RepositoryError> {
        let key = user_key(id);
        // Each lost race means another writer committed, so the loop ends
        loop {
            let Some(current) = self.store.get(&key).await? else {
                return Err(RepositoryError::NotFound);
            };
            let mut user: UserRecord = decode_json(&key, current.clone())?;
            mutate(&mut user);
            let updated = encode_json(&key, &user)?;
            if self.store.compare_and_set(&key, &current, &updated).await? {
                return Ok(user);
            }
            tracing::debug!(user_id = %id, "User record changed during update, retrying");
        }
    }

    async fn set_password_hash(&self, user_id: &str, hash: &str) -> Result<(), RepositoryError> {
        let key = credential_key(user_id);
        if self.store.get(&key).await?.is_none() {
            return Err(RepositoryError::NotFound);
        }
        let credential = Credential {
            user_id: user_id.to_string(),
            password_hash: hash.to_string(),
        };
        self.store.set(&key, &encode_json(&key, &credential)?).await?;
        Ok(())
    }
}
