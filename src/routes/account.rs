//! Profile endpoints for the signed-in user, plus the public whoami probe.

use super::auth::clear_session_cookie;
use crate::accounts::IdentityMutation;
use crate::auth::credentials::{
    hash_password_blocking, verify_password_blocking, CredentialError,
};
use crate::auth::middleware::{AppState, CurrentUser};
use crate::auth::validate::validate_password;
use crate::error::AppError;
use crate::models::{
    Identity, InsightsResponse, PasswordChangeRequest, ProfileUpdateRequest, WhoAmIResponse,
};
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use axum_extra::extract::cookie::CookieJar;

const DISPLAY_NAME_MAX_LEN: usize = 64;
const AVATAR_URL_MAX_LEN: usize = 2048;

fn validate_profile(req: &ProfileUpdateRequest) -> Result<(), AppError> {
    if let Some(name) = &req.display_name {
        if name.chars().count() > DISPLAY_NAME_MAX_LEN {
            return Err(AppError::BadRequest(
                "Display name must be at most 64 characters".to_string(),
            ));
        }
        if name.chars().any(char::is_control) {
            return Err(AppError::BadRequest(
                "Display name may not contain control characters".to_string(),
            ));
        }
    }
    if let Some(url) = &req.avatar_url {
        if !url.is_empty() && (!url.starts_with("https://") || url.len() > AVATAR_URL_MAX_LEN) {
            return Err(AppError::BadRequest(
                "Avatar URL must be an https URL of at most 2048 characters".to_string(),
            ));
        }
    }
    Ok(())
}

/// PATCH /api/profile: Edit display name and avatar
pub async fn update_profile(
    State(state): State<AppState>,
    CurrentUser(caller): CurrentUser,
    Json(req): Json<ProfileUpdateRequest>,
) -> Result<Json<Identity>, AppError> {
    validate_profile(&req)?;

    let user = state
        .writer
        .apply(
            &caller.user_id,
            IdentityMutation::EditProfile {
                display_name: req.display_name.map(|n| n.trim().to_string()),
                avatar_url: req.avatar_url,
            },
        )
        .await?;

    Ok(Json(Identity::from(&user)))
}

/// POST /api/profile/password: Change password and end every session
pub async fn change_password(
    State(state): State<AppState>,
    CurrentUser(caller): CurrentUser,
    jar: CookieJar,
    Json(req): Json<PasswordChangeRequest>,
) -> Result<impl IntoResponse, AppError> {
    validate_password(&req.new_password)?;

    let credential = state
        .users
        .find_credential_by_user_id(&caller.user_id)
        .await?;
    let verified = verify_password_blocking(
        state.credentials.clone(),
        req.current_password,
        credential.map(|c| c.password_hash),
    )
    .await;
    if !verified {
        tracing::warn!(action = "password_change_failed", user_id = %caller.user_id, "Current password mismatch");
        return Err(CredentialError::InvalidCredentials.into());
    }

    let hash = hash_password_blocking(state.credentials.clone(), req.new_password).await?;
    state.writer.replace_password(&caller.user_id, &hash).await?;

    Ok((
        jar.add(clear_session_cookie(&state.config)),
        StatusCode::NO_CONTENT,
    ))
}

/// GET /api/profile/insights: Activity counters (premium)
pub async fn insights(CurrentUser(caller): CurrentUser) -> Json<InsightsResponse> {
    Json(InsightsResponse {
        user_id: caller.user_id,
        link_count: caller.link_count,
        profile_views: caller.profile_views,
    })
}

/// GET /api/public/whoami: Caller identity when signed in
pub async fn whoami(caller: Option<CurrentUser>) -> Json<WhoAmIResponse> {
    let user = caller.map(|CurrentUser(user)| user);
    Json(WhoAmIResponse {
        authenticated: user.is_some(),
        user,
    })
}
