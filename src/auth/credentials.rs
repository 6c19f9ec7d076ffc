//! Password hashing and signed session tokens.
//!
//! Tokens are HS256 JWTs that carry the session id they were issued for.
//! A token alone never authenticates: the gate also requires that session
//! to be live, so logout revokes every token tied to it.

use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;

/// bcrypt cost factor for stored password hashes.
pub const PASSWORD_HASH_COST: u32 = 12;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("password must not be empty")]
    EmptyPassword,

    #[error("password hashing failed: {0}")]
    Hash(String),

    #[error("Invalid credentials")]
    InvalidCredentials,
}

/// Why a token was rejected. All kinds collapse to 401 at the boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,

    #[error("token expired")]
    Expired,

    #[error("token issuer mismatch")]
    WrongIssuer,

    #[error("token signature or algorithm invalid")]
    BadSignature,

    #[error("token encoding failed: {0}")]
    Encode(String),
}

impl TokenError {
    /// Stable label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            TokenError::Malformed => "token_malformed",
            TokenError::Expired => "token_expired",
            TokenError::WrongIssuer => "token_wrong_issuer",
            TokenError::BadSignature => "token_bad_signature",
            TokenError::Encode(_) => "token_encode",
        }
    }
}

/// Claims embedded in every issued token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: String,
    pub username: String,
    /// Session id the token is bound to.
    pub sid: String,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
}

pub struct CredentialService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    token_ttl: Duration,
    hash_cost: u32,
    dummy_hash: OnceLock<String>,
}

impl CredentialService {
    pub fn new(secret: &[u8], issuer: impl Into<String>, token_ttl: Duration) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            issuer: issuer.into(),
            token_ttl,
            hash_cost: PASSWORD_HASH_COST,
            dummy_hash: OnceLock::new(),
        }
    }

    /// Override the bcrypt cost. Only test fixtures should lower it.
    pub fn with_hash_cost(mut self, cost: u32) -> Self {
        self.hash_cost = cost;
        self
    }

    /// Hash a password with bcrypt. CPU-bound; see [`hash_password_blocking`].
    pub fn hash_password(&self, password: &str) -> Result<String, CredentialError> {
        if password.is_empty() {
            return Err(CredentialError::EmptyPassword);
        }
        bcrypt::hash(password, self.hash_cost).map_err(|e| CredentialError::Hash(e.to_string()))
    }

    /// Verify a password against a stored hash.
    ///
    /// A corrupt or foreign hash is indistinguishable from a wrong password.
    pub fn verify_password(&self, password: &str, hash: &str) -> bool {
        bcrypt::verify(password, hash).unwrap_or(false)
    }

    /// Burn the same CPU as a real verification when there is no user to
    /// verify against, so response timing does not reveal unknown logins.
    pub fn verify_against_dummy(&self, password: &str) -> bool {
        let hash = self.dummy_hash.get_or_init(|| {
            bcrypt::hash("linkhub-dummy-password", self.hash_cost).unwrap_or_default()
        });
        let _ = self.verify_password(password, hash);
        false
    }

    /// Issue a signed token bound to `session_id`.
    pub fn issue_token(
        &self,
        user_id: &str,
        username: &str,
        session_id: &str,
    ) -> Result<String, TokenError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user_id.to_string(),
            username: username.to_string(),
            sid: session_id.to_string(),
            iss: self.issuer.clone(),
            iat: now,
            exp: now + self.token_ttl.as_secs() as i64,
        };
        self.encode_claims(&claims)
    }

    fn encode_claims(&self, claims: &Claims) -> Result<String, TokenError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(|e| TokenError::Encode(e.to_string()))
    }

    /// Check signature, expiry and issuer. Any failing check rejects the token.
    pub fn validate_token(&self, token: &str) -> Result<Claims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_exp = true;
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);

        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                ErrorKind::InvalidIssuer => TokenError::WrongIssuer,
                ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => {
                    TokenError::BadSignature
                }
                _ => TokenError::Malformed,
            })
    }
}

/// Run a password hash on the blocking pool so request workers keep serving.
pub async fn hash_password_blocking(
    service: std::sync::Arc<CredentialService>,
    password: String,
) -> Result<String, CredentialError> {
    tokio::task::spawn_blocking(move || service.hash_password(&password))
        .await
        .map_err(|e| CredentialError::Hash(e.to_string()))?
}

/// Verify a password on the blocking pool. `None` hash runs the dummy check.
pub async fn verify_password_blocking(
    service: std::sync::Arc<CredentialService>,
    password: String,
    hash: Option<String>,
) -> bool {
    tokio::task::spawn_blocking(move || match hash {
        Some(hash) => service.verify_password(&password, &hash),
        None => service.verify_against_dummy(&password),
    })
    .await
    .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"test-secret-that-is-long-enough-for-hs256";

    fn service() -> CredentialService {
        CredentialService::new(SECRET, "linkhub", Duration::from_secs(3600))
            .with_hash_cost(bcrypt::DEFAULT_COST.min(4))
    }

    #[test]
    fn test_hash_and_verify() {
        let service = service();
        let hash = service.hash_password("password1").unwrap();
        assert!(service.verify_password("password1", &hash));
    }

    #[test]
    fn test_single_character_mutations_fail() {
        let service = service();
        let hash = service.hash_password("password1").unwrap();
        for wrong in ["password2", "Password1", "password", "password1 ", "xassword1"] {
            assert!(!service.verify_password(wrong, &hash), "{} verified", wrong);
        }
    }

    #[test]
    fn test_empty_password_rejected() {
        assert!(matches!(
            service().hash_password(""),
            Err(CredentialError::EmptyPassword)
        ));
    }

    #[test]
    fn test_corrupt_hash_is_plain_false() {
        let service = service();
        assert!(!service.verify_password("password1", "not-a-bcrypt-hash"));
        assert!(!service.verify_password("password1", ""));
        assert!(!service.verify_against_dummy("password1"));
    }

    #[test]
    fn test_issue_then_validate() {
        let service = service();
        let token = service.issue_token("u1", "abc123", "sid-1").unwrap();
        let claims = service.validate_token(&token).unwrap();
        assert_eq!(claims.sub, "u1");
        assert_eq!(claims.username, "abc123");
        assert_eq!(claims.sid, "sid-1");
        assert_eq!(claims.iss, "linkhub");
        assert_eq!(claims.exp - claims.iat, 3600);
    }

    #[test]
    fn test_expired_token() {
        let service = service();
        let now = Utc::now().timestamp();
        let token = service
            .encode_claims(&Claims {
                sub: "u1".to_string(),
                username: "abc123".to_string(),
                sid: "sid-1".to_string(),
                iss: "linkhub".to_string(),
                iat: now - 120,
                exp: now - 60,
            })
            .unwrap();
        assert_eq!(service.validate_token(&token), Err(TokenError::Expired));
    }

    #[test]
    fn test_wrong_issuer() {
        let other = CredentialService::new(SECRET, "someone-else", Duration::from_secs(3600));
        let token = other.issue_token("u1", "abc123", "sid-1").unwrap();
        assert_eq!(service().validate_token(&token), Err(TokenError::WrongIssuer));
    }

    #[test]
    fn test_wrong_secret() {
        let other = CredentialService::new(
            b"another-secret-that-is-long-enough-for-hs256",
            "linkhub",
            Duration::from_secs(3600),
        );
        let token = other.issue_token("u1", "abc123", "sid-1").unwrap();
        assert_eq!(service().validate_token(&token), Err(TokenError::BadSignature));
    }

    #[test]
    fn test_wrong_algorithm() {
        let claims = Claims {
            sub: "u1".to_string(),
            username: "abc123".to_string(),
            sid: "sid-1".to_string(),
            iss: "linkhub".to_string(),
            iat: Utc::now().timestamp(),
            exp: Utc::now().timestamp() + 600,
        };
        let token = encode(
            &Header::new(Algorithm::HS512),
            &claims,
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap();
        assert_eq!(service().validate_token(&token), Err(TokenError::BadSignature));
    }

    #[test]
    fn test_malformed_token() {
        assert_eq!(service().validate_token("garbage"), Err(TokenError::Malformed));
        assert_eq!(service().validate_token(""), Err(TokenError::Malformed));
    }

    #[tokio::test]
    async fn test_blocking_helpers() {
        let service = std::sync::Arc::new(service());
        let hash = hash_password_blocking(service.clone(), "password1".to_string())
            .await
            .unwrap();
        assert!(verify_password_blocking(service.clone(), "password1".to_string(), Some(hash)).await);
        assert!(!verify_password_blocking(service, "password1".to_string(), None).await);
    }
}
