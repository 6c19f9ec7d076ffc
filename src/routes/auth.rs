//! Auth API endpoints.

use crate::accounts::IdentityMutation;
use crate::auth::credentials::{
    hash_password_blocking, verify_password_blocking, CredentialError,
};
use crate::auth::middleware::{AppState, AuthContext, CurrentSession, CurrentUser};
use crate::auth::validate::{validate_email, validate_password, validate_username};
use crate::config::Config;
use crate::error::AppError;
use crate::models::{
    Identity, LoginRequest, MeResponse, RegisterRequest, RegisterResponse, SessionRecord,
    SessionResponse, UserRecord, VerifyEmailRequest,
};
use crate::ratelimit::{client_ip, ip_hash, RateLimitKey, RouteClass};
use crate::storage::{NewUser, SessionId, StoreError};
use axum::{
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use std::net::SocketAddr;

fn session_cookie(config: &Config, session_id: &SessionId) -> Cookie<'static> {
    Cookie::build((
        config.session_cookie_name.clone(),
        session_id.as_str().to_string(),
    ))
    .http_only(true)
    .secure(config.cookie_secure)
    .same_site(SameSite::Lax)
    .path("/")
    .max_age(time::Duration::seconds(config.session_ttl_secs as i64))
    .build()
}

/// Expired cookie that clears the session cookie in the browser.
pub(crate) fn clear_session_cookie(config: &Config) -> Cookie<'static> {
    Cookie::build((config.session_cookie_name.clone(), String::new()))
        .http_only(true)
        .secure(config.cookie_secure)
        .same_site(SameSite::Lax)
        .path("/")
        .max_age(time::Duration::ZERO)
        .build()
}

/// Create a session for a freshly read user and deliver it as cookie and token.
async fn start_session(
    state: &AppState,
    jar: CookieJar,
    user: &UserRecord,
) -> Result<(CookieJar, Json<SessionResponse>), AppError> {
    let session_id = state
        .sessions
        .create(&SessionRecord::for_user(user), state.config.session_ttl())
        .await?;
    let token = state
        .credentials
        .issue_token(&user.id, &user.username, session_id.as_str())
        .map_err(|e| AppError::Internal(format!("Token issue failed: {}", e)))?;

    let jar = jar.add(session_cookie(&state.config, &session_id));
    Ok((
        jar,
        Json(SessionResponse {
            token,
            token_type: "Bearer",
            expires_in: state.config.session_ttl_secs,
            user: Identity::from(user),
        }),
    ))
}

/// Issue a fresh verification token and hand it to the mailer. Delivery
/// failures are logged; only a failure to store the token is returned.
async fn send_verification(state: &AppState, user: &UserRecord) -> Result<(), StoreError> {
    let token = state.verifications.issue(&user.id).await?;
    if let Err(e) = state.mailer.send_verification(user, &token).await {
        tracing::warn!(user_id = %user.id, error = %e, "Verification delivery failed");
    }
    Ok(())
}

/// POST /api/auth/register: Create an account pending email verification
pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, AppError> {
    validate_username(&req.username)?;
    validate_email(&req.email)?;
    validate_password(&req.password)?;

    let password_hash = hash_password_blocking(state.credentials.clone(), req.password).await?;

    let user = state
        .users
        .create_user(NewUser {
            username: req.username,
            email: req.email.trim().to_string(),
            password_hash,
        })
        .await?;

    // The account exists now; a missing token can be reissued after login
    if let Err(e) = send_verification(&state, &user).await {
        tracing::error!(user_id = %user.id, error = %e, "Verification token not issued");
    }

    tracing::info!(action = "user_registered", user_id = %user.id, username = %user.username, "New user registered");

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            user_id: user.id,
            username: user.username,
            verification_required: true,
        }),
    ))
}

/// POST /api/auth/verify-email: Redeem a verification token and start a session
pub async fn verify_email(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(req): Json<VerifyEmailRequest>,
) -> Result<impl IntoResponse, AppError> {
    let user_id = state
        .verifications
        .consume(req.token.trim())
        .await?
        .ok_or_else(|| {
            AppError::BadRequest("Invalid or expired verification token".to_string())
        })?;

    let user = state.writer.apply(&user_id, IdentityMutation::Verify).await?;
    if !user.active {
        return Err(CredentialError::InvalidCredentials.into());
    }

    tracing::info!(action = "email_verified", user_id = %user.id, "Email verified");

    start_session(&state, jar, &user).await
}

/// POST /api/auth/login: Verify credentials and create a session
///
/// Counted against the auth limit per client IP and login name. Every
/// response carries the `X-RateLimit-*` headers of that counter.
pub async fn login(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(req): Json<LoginRequest>,
) -> Response {
    let ip = client_ip(&headers, Some(addr.ip()), state.config.trusted_proxy_count);
    let key = RateLimitKey::Login {
        ip,
        login: req.login.clone(),
    };
    let policy = state.config.rate_limit_policy(RouteClass::Auth);

    let status = match state.limiter.check_class(RouteClass::Auth, &key, policy).await {
        Ok(status) => status,
        Err(e) => return AppError::from(e).into_response(),
    };
    if status.exceeded {
        tracing::warn!(action = "rate_limited", endpoint = "auth/login", ip_hash = %ip_hash(&ip), "Rate limit exceeded");
        return AppError::RateLimited(status).into_response();
    }

    let mut response = match authenticate(&state, &req).await {
        Ok(user) => {
            // Prior failures must not count against a legitimate user
            if let Err(e) = state.limiter.clear_class(RouteClass::Auth, &key).await {
                tracing::warn!(user_id = %user.id, error = %e, "Failed to clear login counter");
            }
            if !user.verified {
                tracing::debug!(user_id = %user.id, "Login before email verification");
            }
            tracing::info!(action = "auth_success", user_id = %user.id, "User logged in");
            start_session(&state, jar, &user).await.into_response()
        }
        Err(e) => {
            if matches!(e, AppError::Unauthorized(_)) {
                tracing::warn!(action = "auth_failed", ip_hash = %ip_hash(&ip), "Invalid credentials");
            }
            e.into_response()
        }
    };
    status.apply_headers(response.headers_mut());
    response
}

/// Check a login and password. Unknown users, wrong passwords and inactive
/// accounts are indistinguishable to the caller.
async fn authenticate(state: &AppState, req: &LoginRequest) -> Result<UserRecord, AppError> {
    let invalid = || AppError::from(CredentialError::InvalidCredentials);

    let login = req.login.trim();
    if login.is_empty() || req.password.is_empty() {
        return Err(invalid());
    }

    let user = match state.users.find_user_id_by_login(login).await? {
        Some(id) => state.users.find_user_by_id(&id).await?,
        None => None,
    };
    let credential = match &user {
        Some(user) => state.users.find_credential_by_user_id(&user.id).await?,
        None => None,
    };

    let verified = verify_password_blocking(
        state.credentials.clone(),
        req.password.clone(),
        credential.map(|c| c.password_hash),
    )
    .await;

    match user {
        Some(user) if verified && user.active => Ok(user),
        _ => Err(invalid()),
    }
}

/// POST /api/auth/resend-verification: Send a new verification token
pub async fn resend_verification(
    CurrentUser(identity): CurrentUser,
    State(state): State<AppState>,
) -> Result<StatusCode, AppError> {
    if identity.verified {
        return Err(AppError::Conflict("Email already verified".to_string()));
    }
    let user = state
        .users
        .find_user_by_id(&identity.user_id)
        .await?
        .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;

    send_verification(&state, &user).await?;
    tracing::info!(action = "verification_resent", user_id = %user.id, "Verification token reissued");

    Ok(StatusCode::ACCEPTED)
}

/// POST /api/auth/logout: Invalidate current session
pub async fn logout(
    ctx: AuthContext,
    State(state): State<AppState>,
    jar: CookieJar,
) -> Result<impl IntoResponse, AppError> {
    state.sessions.delete(&ctx.session_id).await?;

    tracing::info!(action = "logout", user_id = %ctx.identity.user_id, "User logged out");

    Ok((
        jar.add(clear_session_cookie(&state.config)),
        StatusCode::NO_CONTENT,
    ))
}

/// GET /api/auth/me: Current identity and when its session began
pub async fn me(
    CurrentUser(user): CurrentUser,
    CurrentSession(session): CurrentSession,
) -> Json<MeResponse> {
    Json(MeResponse {
        identity: user,
        session_started_at: session.created_at,
    })
}
