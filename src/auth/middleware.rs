//! Request authentication: shared state, identity resolution, route gates
//! and extractors.
//!
//! Resolution order for every request:
//! 1. session id from the session cookie;
//! 2. otherwise a bearer token, whose embedded session id must still be live
//!    and belong to the token's subject.
//!
//! A resolved session is extended, its identity is read through the identity
//! cache, and an inactive account is treated as unauthenticated. Store
//! failures are never mistaken for absence: they fail the request closed.

use crate::accounts::{IdentityWriter, VerificationMailer, VerificationTokens};
use crate::auth::credentials::{CredentialService, TokenError};
use crate::config::Config;
use crate::error::{AppError, INVALID_SESSION};
use crate::metrics::{AuthOutcome, MetricsSink};
use crate::models::{Identity, Role, SessionRecord};
use crate::ratelimit::RateLimiter;
use crate::storage::{
    IdentityCache, KvStore, RepositoryError, SessionId, SessionStore, StoreError, UserDirectory,
};
use axum::{
    extract::{FromRequestParts, OptionalFromRequestParts, Request, State},
    http::{header::AUTHORIZATION, request::Parts, Extensions, HeaderMap},
    middleware::Next,
    response::Response,
};
use axum_extra::extract::cookie::CookieJar;
use std::convert::Infallible;
use std::sync::Arc;

/// Message when a gated route is called without any credential.
pub const AUTH_REQUIRED: &str = "Authentication required";

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub credentials: Arc<CredentialService>,
    pub sessions: SessionStore,
    pub identities: IdentityCache,
    pub limiter: RateLimiter,
    pub users: Arc<dyn UserDirectory>,
    pub writer: IdentityWriter,
    pub verifications: VerificationTokens,
    pub mailer: Arc<dyn VerificationMailer>,
    pub metrics: Arc<dyn MetricsSink>,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<dyn KvStore>,
        users: Arc<dyn UserDirectory>,
        metrics: Arc<dyn MetricsSink>,
        mailer: Arc<dyn VerificationMailer>,
    ) -> Self {
        let credentials = CredentialService::new(
            config.jwt_secret.as_bytes(),
            config.jwt_issuer.clone(),
            config.session_ttl(),
        )
        .with_hash_cost(config.bcrypt_cost);

        let sessions = SessionStore::new(store.clone());
        let identities = IdentityCache::new(store.clone(), config.identity_cache_ttl());
        let writer = IdentityWriter::new(users.clone(), identities.clone(), sessions.clone());

        Self {
            credentials: Arc::new(credentials),
            limiter: RateLimiter::new(store.clone(), metrics.clone()),
            verifications: VerificationTokens::new(store, config.verification_ttl()),
            config: Arc::new(config),
            sessions,
            identities,
            users,
            writer,
            mailer,
            metrics,
        }
    }
}

/// Identity bound to one request by the gate.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub identity: Identity,
    pub session: SessionRecord,
    pub session_id: SessionId,
}

/// Why a request could not be bound to an identity.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("no credential presented")]
    Missing,

    #[error("session absent or expired")]
    SessionAbsent,

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error("token subject does not own its session")]
    SessionMismatch,

    #[error("account inactive")]
    Inactive,

    #[error("session store failure: {0}")]
    Store(#[from] StoreError),

    #[error("user directory failure: {0}")]
    Directory(String),
}

impl GateError {
    fn outcome(&self) -> AuthOutcome {
        match self {
            GateError::Missing => AuthOutcome::Anonymous,
            GateError::SessionAbsent | GateError::SessionMismatch => AuthOutcome::SessionAbsent,
            GateError::Token(e) => AuthOutcome::TokenRejected(e.kind()),
            GateError::Inactive => AuthOutcome::Inactive,
            GateError::Store(_) | GateError::Directory(_) => AuthOutcome::StoreFailure,
        }
    }

    fn log(&self) {
        match self {
            GateError::Store(e) => {
                tracing::error!(error = %e, "Session resolution failed on store error");
            }
            GateError::Directory(e) => {
                tracing::error!(error = %e, "Session resolution failed on directory error");
            }
            GateError::Inactive => {
                tracing::info!(action = "inactive_rejected", "Inactive account presented a live session");
            }
            other => tracing::debug!(reason = %other, "Request not authenticated"),
        }
    }
}

impl From<RepositoryError> for GateError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::Store(e) => GateError::Store(e),
            other => GateError::Directory(other.to_string()),
        }
    }
}

impl From<GateError> for AppError {
    fn from(err: GateError) -> Self {
        match err {
            GateError::Missing => AppError::Unauthorized(AUTH_REQUIRED.to_string()),
            _ => AppError::Unauthorized(INVALID_SESSION.to_string()),
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Resolve the caller of a request.
pub async fn resolve(state: &AppState, headers: &HeaderMap) -> Result<AuthContext, GateError> {
    let jar = CookieJar::from_headers(headers);
    let cookie = jar.get(&state.config.session_cookie_name);
    let mut presented = cookie.is_some();

    if let Some(session_id) = cookie.and_then(|c| SessionId::parse(c.value())) {
        if let Some(session) = state.sessions.get(&session_id).await? {
            return bind(state, session_id, session).await;
        }
    }

    if let Some(token) = bearer_token(headers) {
        presented = true;
        let claims = state.credentials.validate_token(token)?;
        let session_id = SessionId::parse(&claims.sid).ok_or(GateError::SessionAbsent)?;
        let session = state
            .sessions
            .get(&session_id)
            .await?
            .ok_or(GateError::SessionAbsent)?;
        if session.user_id != claims.sub {
            return Err(GateError::SessionMismatch);
        }
        return bind(state, session_id, session).await;
    }

    Err(if presented {
        GateError::SessionAbsent
    } else {
        GateError::Missing
    })
}

async fn bind(
    state: &AppState,
    session_id: SessionId,
    session: SessionRecord,
) -> Result<AuthContext, GateError> {
    // Concurrent requests may race to reset the same TTL; any winner is fine
    if !state
        .sessions
        .extend(&session_id, &session.user_id, state.config.session_ttl())
        .await?
    {
        return Err(GateError::SessionAbsent);
    }

    let identity = state
        .identities
        .read_through(&session.user_id, state.users.as_ref())
        .await?
        .ok_or(GateError::SessionAbsent)?;

    if !identity.active {
        return Err(GateError::Inactive);
    }

    Ok(AuthContext {
        identity,
        session,
        session_id,
    })
}

/// Reject requests without a resolvable identity (401).
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    match resolve(&state, request.headers()).await {
        Ok(ctx) => {
            state.metrics.auth_outcome(AuthOutcome::Authenticated);
            request.extensions_mut().insert(ctx);
            Ok(next.run(request).await)
        }
        Err(e) => {
            state.metrics.auth_outcome(e.outcome());
            e.log();
            Err(e.into())
        }
    }
}

/// Bind an identity when one resolves; otherwise continue anonymously.
pub async fn optional_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    match resolve(&state, request.headers()).await {
        Ok(ctx) => {
            state.metrics.auth_outcome(AuthOutcome::Authenticated);
            request.extensions_mut().insert(ctx);
        }
        Err(e) => {
            state.metrics.auth_outcome(e.outcome());
            e.log();
        }
    }
    next.run(request).await
}

fn gate_context<'a>(state: &AppState, request: &'a Request) -> Result<&'a AuthContext, AppError> {
    request.extensions().get::<AuthContext>().ok_or_else(|| {
        state.metrics.auth_outcome(AuthOutcome::Anonymous);
        AppError::Unauthorized(AUTH_REQUIRED.to_string())
    })
}

/// Require a premium plan (403). Layer inside `require_auth`.
pub async fn require_premium(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let ctx = gate_context(&state, &request)?;
    if !ctx.identity.plan.is_premium() {
        state.metrics.auth_outcome(AuthOutcome::Forbidden);
        tracing::debug!(user_id = %ctx.identity.user_id, "Premium capability missing");
        return Err(AppError::Forbidden("Premium plan required".to_string()));
    }
    Ok(next.run(request).await)
}

/// Require the admin role (403). Layer inside `require_auth`.
pub async fn require_admin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let ctx = gate_context(&state, &request)?;
    if ctx.identity.role != Role::Admin {
        state.metrics.auth_outcome(AuthOutcome::Forbidden);
        tracing::warn!(action = "admin_denied", user_id = %ctx.identity.user_id, "Admin access denied");
        return Err(AppError::Forbidden("Admin access required".to_string()));
    }
    Ok(next.run(request).await)
}

/// Identity bound by the gate, if any.
pub fn current_user(extensions: &Extensions) -> Option<&Identity> {
    extensions.get::<AuthContext>().map(|ctx| &ctx.identity)
}

/// Session bound by the gate, if any.
pub fn current_session(extensions: &Extensions) -> Option<&SessionRecord> {
    extensions.get::<AuthContext>().map(|ctx| &ctx.session)
}

impl<S> FromRequestParts<S> for AuthContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthContext>()
            .cloned()
            .ok_or_else(|| AppError::Unauthorized(AUTH_REQUIRED.to_string()))
    }
}

impl<S> OptionalFromRequestParts<S> for AuthContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> Result<Option<Self>, Self::Rejection> {
        Ok(parts.extensions.get::<AuthContext>().cloned())
    }
}

/// Extractor for the caller's identity.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub Identity);

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        current_user(&parts.extensions)
            .cloned()
            .map(CurrentUser)
            .ok_or_else(|| AppError::Unauthorized(AUTH_REQUIRED.to_string()))
    }
}

impl<S> OptionalFromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> Result<Option<Self>, Self::Rejection> {
        Ok(current_user(&parts.extensions).cloned().map(CurrentUser))
    }
}

/// Extractor for the caller's session record.
#[derive(Debug, Clone)]
pub struct CurrentSession(pub SessionRecord);

impl<S> FromRequestParts<S> for CurrentSession
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        current_session(&parts.extensions)
            .cloned()
            .map(CurrentSession)
            .ok_or_else(|| AppError::Unauthorized(AUTH_REQUIRED.to_string()))
    }
}
