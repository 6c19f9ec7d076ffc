//! Account writes that touch cached identity fields, and email verification.
//!
//! Every change to a field mirrored in the identity snapshot is expressed as
//! an [`IdentityMutation`] and applied through [`IdentityWriter`], which
//! invalidates the snapshot as part of the same call. Handlers never update
//! user records directly.

use crate::auth::session::{generate_verification_token, is_well_formed};
use crate::models::{Plan, Role, UserRecord};
use crate::storage::{
    IdentityCache, KvStore, RepositoryError, SessionStore, StoreError, UserDirectory,
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

/// A write to one or more cached identity fields.
#[derive(Debug, Clone, PartialEq)]
pub enum IdentityMutation {
    /// Email address confirmed.
    Verify,
    ChangePlan(Plan),
    /// Absent fields are left unchanged.
    EditProfile {
        display_name: Option<String>,
        avatar_url: Option<String>,
    },
    SetMfa(bool),
    /// Deactivation also revokes every session of the user.
    SetActive(bool),
    SetRole(Role),
    RecordActivity {
        links_added: u64,
        views_added: u64,
    },
}

impl IdentityMutation {
    fn label(&self) -> &'static str {
        match self {
            IdentityMutation::Verify => "verify",
            IdentityMutation::ChangePlan(_) => "change_plan",
            IdentityMutation::EditProfile { .. } => "edit_profile",
            IdentityMutation::SetMfa(_) => "set_mfa",
            IdentityMutation::SetActive(_) => "set_active",
            IdentityMutation::SetRole(_) => "set_role",
            IdentityMutation::RecordActivity { .. } => "record_activity",
        }
    }

    fn apply_to(&self, user: &mut UserRecord) {
        match self {
            IdentityMutation::Verify => user.verified = true,
            IdentityMutation::ChangePlan(plan) => user.plan = *plan,
            IdentityMutation::EditProfile {
                display_name,
                avatar_url,
            } => {
                if let Some(name) = display_name {
                    user.display_name = Some(name.clone()).filter(|n| !n.is_empty());
                }
                if let Some(url) = avatar_url {
                    user.avatar_url = Some(url.clone()).filter(|u| !u.is_empty());
                }
            }
            IdentityMutation::SetMfa(enabled) => user.mfa_enabled = *enabled,
            IdentityMutation::SetActive(active) => user.active = *active,
            IdentityMutation::SetRole(role) => user.role = *role,
            IdentityMutation::RecordActivity {
                links_added,
                views_added,
            } => {
                user.link_count = user.link_count.saturating_add(*links_added);
                user.profile_views = user.profile_views.saturating_add(*views_added);
            }
        }
    }
}

/// The only write path for cached identity fields.
#[derive(Clone)]
pub struct IdentityWriter {
    users: Arc<dyn UserDirectory>,
    identities: IdentityCache,
    sessions: SessionStore,
}

impl IdentityWriter {
    pub fn new(
        users: Arc<dyn UserDirectory>,
        identities: IdentityCache,
        sessions: SessionStore,
    ) -> Self {
        Self {
            users,
            identities,
            sessions,
        }
    }

    /// Apply `mutation` to the durable record and drop the cached snapshot.
    ///
    /// If the snapshot cannot be dropped the error is returned even though the
    /// durable write landed, so the caller does not report a change that
    /// readers may not see.
    pub async fn apply(
        &self,
        user_id: &str,
        mutation: IdentityMutation,
    ) -> Result<UserRecord, RepositoryError> {
        let label = mutation.label();
        let deactivating = matches!(mutation, IdentityMutation::SetActive(false));
        let user = self
            .users
            .update_user(user_id, &|user: &mut UserRecord| mutation.apply_to(user))
            .await?;

        if let Err(e) = self.identities.invalidate(user_id).await {
            tracing::error!(user_id = %user_id, mutation = label, error = %e, "Identity snapshot invalidation failed");
            return Err(e.into());
        }

        if deactivating {
            let revoked = self.sessions.delete_all_for_user(user_id).await?;
            tracing::info!(action = "sessions_revoked", user_id = %user_id, count = revoked, "Revoked sessions of deactivated user");
        }

        tracing::info!(action = "identity_mutated", user_id = %user_id, mutation = label, "Identity updated");
        Ok(user)
    }

    /// Grant the admin role to `username` if that account exists.
    pub async fn promote_to_admin(
        &self,
        username: &str,
    ) -> Result<Option<UserRecord>, RepositoryError> {
        let Some(user_id) = self.users.find_user_id_by_login(username).await? else {
            return Ok(None);
        };
        self.apply(&user_id, IdentityMutation::SetRole(Role::Admin))
            .await
            .map(Some)
    }

    /// Store a new password hash and revoke every existing session.
    pub async fn replace_password(
        &self,
        user_id: &str,
        password_hash: &str,
    ) -> Result<usize, RepositoryError> {
        self.users.set_password_hash(user_id, password_hash).await?;
        let revoked = self.sessions.delete_all_for_user(user_id).await?;
        tracing::info!(action = "password_changed", user_id = %user_id, sessions_revoked = revoked, "Password replaced");
        Ok(revoked)
    }
}

/// Single-use email verification tokens.
///
/// Key pattern: `verify:{token}`: value is the user id, with TTL.
#[derive(Clone)]
pub struct VerificationTokens {
    store: Arc<dyn KvStore>,
    ttl: Duration,
}

fn verification_key(token: &str) -> String {
    format!("verify:{}", token)
}

impl VerificationTokens {
    pub fn new(store: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub async fn issue(&self, user_id: &str) -> Result<String, StoreError> {
        let token = generate_verification_token();
        self.store
            .set_ex(&verification_key(&token), user_id, self.ttl)
            .await?;
        Ok(token)
    }

    /// Redeem a token, returning its user id. A token redeems at most once.
    pub async fn consume(&self, token: &str) -> Result<Option<String>, StoreError> {
        if !is_well_formed(token) {
            return Ok(None);
        }
        self.store.take(&verification_key(token)).await
    }
}

#[derive(Debug, thiserror::Error)]
#[error("verification delivery failed: {0}")]
pub struct MailerError(pub String);

/// Delivers verification tokens to users.
#[async_trait]
pub trait VerificationMailer: Send + Sync {
    async fn send_verification(&self, user: &UserRecord, token: &str) -> Result<(), MailerError>;
}

/// Records that a verification was issued without delivering it anywhere.
#[derive(Debug, Default, Clone)]
pub struct TracingMailer;

#[async_trait]
impl VerificationMailer for TracingMailer {
    async fn send_verification(&self, user: &UserRecord, _token: &str) -> Result<(), MailerError> {
        tracing::info!(action = "verification_issued", user_id = %user.id, "Verification token issued");
        Ok(())
    }
}

/// Keeps the latest token per email address in memory.
#[derive(Debug, Default)]
pub struct OutboxMailer {
    sent: DashMap<String, String>,
}

impl OutboxMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return the latest token sent to `email`.
    pub fn take(&self, email: &str) -> Option<String> {
        self.sent
            .remove(&email.to_lowercase())
            .map(|(_, token)| token)
    }
}

#[async_trait]
impl VerificationMailer for OutboxMailer {
    async fn send_verification(&self, user: &UserRecord, token: &str) -> Result<(), MailerError> {
        self.sent
            .insert(user.email.to_lowercase(), token.to_string());
        Ok(())
    }
}
