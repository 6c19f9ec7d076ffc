//! Request and response models for the API.
//!
//! All models use serde for serialization/deserialization.
//! Storage models represent records kept in the shared key-value store.

use serde::{Deserialize, Serialize};

// ============================================================================
// Auth Models
// ============================================================================

/// Request to register a new account.
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

/// Response after registration. No session is issued until the email is verified.
#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub user_id: String,
    pub username: String,
    pub verification_required: bool,
}

/// Request to log in with a username or email.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub login: String,
    pub password: String,
}

/// Request to consume an email verification token.
#[derive(Debug, Deserialize)]
pub struct VerifyEmailRequest {
    pub token: String,
}

/// Response after a session has been created (login or email verification).
#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub token: String,
    pub token_type: &'static str,
    pub expires_in: u64,
    pub user: Identity,
}

/// Response for the current caller: identity fields plus session start.
#[derive(Debug, Serialize)]
pub struct MeResponse {
    #[serde(flatten)]
    pub identity: Identity,
    pub session_started_at: i64,
}

// ============================================================================
// Profile Models
// ============================================================================

/// Partial profile edit; absent fields are left unchanged.
#[derive(Debug, Deserialize)]
pub struct ProfileUpdateRequest {
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

/// Request to change the caller's password.
#[derive(Debug, Deserialize)]
pub struct PasswordChangeRequest {
    pub current_password: String,
    pub new_password: String,
}

/// Premium-only activity counters.
#[derive(Debug, Serialize)]
pub struct InsightsResponse {
    pub user_id: String,
    pub link_count: u64,
    pub profile_views: u64,
}

/// Response for routes with optional authentication.
#[derive(Debug, Serialize)]
pub struct WhoAmIResponse {
    pub authenticated: bool,
    pub user: Option<Identity>,
}

// ============================================================================
// Admin Models
// ============================================================================

/// Request to change a user's plan.
#[derive(Debug, Deserialize)]
pub struct PlanChangeRequest {
    pub plan: Plan,
}

/// Request to clear an auth-attempt counter.
#[derive(Debug, Deserialize)]
pub struct RateLimitClearRequest {
    pub ip: std::net::IpAddr,
    pub login: String,
}

// ============================================================================
// Storage Models
// ============================================================================

/// Durable user record, owned by the user directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub username: String,
    pub email: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub verified: bool,
    pub plan: Plan,
    pub role: Role,
    pub active: bool,
    pub mfa_enabled: bool,
    pub link_count: u64,
    pub profile_views: u64,
    pub created_at: i64,
}

/// Durable credential. The bcrypt hash embeds its own salt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub user_id: String,
    pub password_hash: String,
}

/// Session data as stored under `session:{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub user_id: String,
    pub username: String,
    pub email: String,
    pub verified: bool,
    pub plan: Plan,
    pub created_at: i64,
}

impl SessionRecord {
    /// Snapshot a freshly read user into a session record.
    pub fn for_user(user: &UserRecord) -> Self {
        Self {
            user_id: user.id.clone(),
            username: user.username.clone(),
            email: user.email.clone(),
            verified: user.verified,
            plan: user.plan,
            created_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// Denormalized profile snapshot as stored under `identity:{user_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentitySnapshot {
    pub user_id: String,
    pub username: String,
    pub email: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub verified: bool,
    pub plan: Plan,
    pub role: Role,
    pub active: bool,
    pub mfa_enabled: bool,
    pub link_count: u64,
    pub profile_views: u64,
}

impl From<&UserRecord> for IdentitySnapshot {
    fn from(user: &UserRecord) -> Self {
        Self {
            user_id: user.id.clone(),
            username: user.username.clone(),
            email: user.email.clone(),
            display_name: user.display_name.clone(),
            avatar_url: user.avatar_url.clone(),
            verified: user.verified,
            plan: user.plan,
            role: user.role,
            active: user.active,
            mfa_enabled: user.mfa_enabled,
            link_count: user.link_count,
            profile_views: user.profile_views,
        }
    }
}

/// The caller's identity as exposed to handlers and clients.
pub type Identity = IdentitySnapshot;

// ============================================================================
// Plans and Roles
// ============================================================================

/// Subscription tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Premium,
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Premium => "premium",
        }
    }

    pub fn is_premium(&self) -> bool {
        matches!(self, Plan::Premium)
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// User role types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Member,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Member => "member",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "member" => Ok(Role::Member),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> UserRecord {
        UserRecord {
            id: "u1".to_string(),
            username: "abc123".to_string(),
            email: "abc@example.com".to_string(),
            display_name: Some("Abc".to_string()),
            avatar_url: None,
            verified: false,
            plan: Plan::Free,
            role: Role::Member,
            active: true,
            mfa_enabled: false,
            link_count: 3,
            profile_views: 10,
            created_at: 0,
        }
    }

    #[test]
    fn test_snapshot_copies_mutable_fields() {
        let snapshot = IdentitySnapshot::from(&user());
        assert_eq!(snapshot.user_id, "u1");
        assert_eq!(snapshot.display_name.as_deref(), Some("Abc"));
        assert_eq!(snapshot.link_count, 3);
        assert!(snapshot.active);
    }

    #[test]
    fn test_session_record_for_user() {
        let record = SessionRecord::for_user(&user());
        assert_eq!(record.user_id, "u1");
        assert_eq!(record.plan, Plan::Free);
        assert!(record.created_at > 0);
    }

    #[test]
    fn test_plan_and_role_wire_format() {
        assert_eq!(serde_json::to_string(&Plan::Premium).unwrap(), "\"premium\"");
        assert_eq!(serde_json::to_string(&Role::Admin).unwrap(), "\"admin\"");
        assert_eq!("member".parse::<Role>().unwrap(), Role::Member);
        assert!("owner".parse::<Role>().is_err());
    }
}
