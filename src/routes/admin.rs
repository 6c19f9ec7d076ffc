//! Admin API endpoints (all behind `require_auth` + `require_admin`).

use super::{validate_id, USER_ID_LEN};
use crate::accounts::IdentityMutation;
use crate::auth::middleware::{AppState, CurrentUser};
use crate::error::AppError;
use crate::models::{Identity, PlanChangeRequest, RateLimitClearRequest};
use crate::ratelimit::{ip_hash, RateLimitKey, RouteClass};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

/// POST /api/admin/users/{id}/plan: Change a user's plan
pub async fn change_plan(
    CurrentUser(admin): CurrentUser,
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<PlanChangeRequest>,
) -> Result<Json<Identity>, AppError> {
    validate_id(&id, "user id", USER_ID_LEN)?;

    let user = state
        .writer
        .apply(&id, IdentityMutation::ChangePlan(req.plan))
        .await?;

    tracing::info!(action = "plan_changed", admin_id = %admin.user_id, user_id = %id, plan = %req.plan, "Admin changed plan");

    Ok(Json(Identity::from(&user)))
}

/// POST /api/admin/users/{id}/deactivate: Deactivate a user and end their sessions
pub async fn deactivate_user(
    CurrentUser(admin): CurrentUser,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    validate_id(&id, "user id", USER_ID_LEN)?;

    if id == admin.user_id {
        return Err(AppError::BadRequest(
            "Cannot deactivate your own account".to_string(),
        ));
    }

    state
        .writer
        .apply(&id, IdentityMutation::SetActive(false))
        .await?;

    tracing::info!(action = "user_deactivated", admin_id = %admin.user_id, user_id = %id, "Admin deactivated user");

    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/admin/ratelimit/clear: Reset the login counter for an IP and login
pub async fn clear_rate_limit(
    CurrentUser(admin): CurrentUser,
    State(state): State<AppState>,
    Json(req): Json<RateLimitClearRequest>,
) -> Result<impl IntoResponse, AppError> {
    if req.login.trim().is_empty() {
        return Err(AppError::BadRequest("Login must not be empty".to_string()));
    }

    let key = RateLimitKey::Login {
        ip: req.ip,
        login: req.login,
    };
    state.limiter.clear_class(RouteClass::Auth, &key).await?;

    tracing::info!(action = "ratelimit_cleared", admin_id = %admin.user_id, ip_hash = %ip_hash(&req.ip), "Admin cleared login counter");

    Ok(StatusCode::NO_CONTENT)
}
