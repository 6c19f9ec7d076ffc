//! API route handlers.

pub mod account;
pub mod admin;
pub mod auth;

use crate::auth::middleware::{
    optional_auth, require_admin, require_auth, require_premium, AppState,
};
use crate::error::AppError;
use crate::ratelimit::{limit_api, limit_global};
use axum::{
    middleware::from_fn_with_state,
    routing::{get, patch, post},
    Router,
};

/// Length of user ids issued by the user directory.
pub const USER_ID_LEN: usize = 12;

/// Validate that a string is a valid nanoid (alphanumeric, hyphens, underscores).
pub fn validate_id(id: &str, label: &str, expected_len: usize) -> Result<(), AppError> {
    if id.len() != expected_len
        || !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(AppError::BadRequest(format!("Invalid {} format", label)));
    }
    Ok(())
}

/// Build the API router with all endpoints.
///
/// Gate order, outermost first: global limit, authentication, per-user API
/// limit, capability check.
pub fn api_router(state: AppState) -> Router {
    let public = Router::new()
        .route("/api/auth/register", post(auth::register))
        .route("/api/auth/verify-email", post(auth::verify_email))
        .route("/api/auth/login", post(auth::login));

    let optional = Router::new()
        .route("/api/public/whoami", get(account::whoami))
        .layer(from_fn_with_state(state.clone(), optional_auth));

    let premium = Router::new()
        .route("/api/profile/insights", get(account::insights))
        .layer(from_fn_with_state(state.clone(), require_premium));

    let api = Router::new()
        .route("/api/auth/me", get(auth::me))
        .route(
            "/api/auth/resend-verification",
            post(auth::resend_verification),
        )
        .route("/api/profile", patch(account::update_profile))
        .route("/api/profile/password", post(account::change_password))
        .merge(premium)
        .layer(from_fn_with_state(state.clone(), limit_api));

    let admin = Router::new()
        .route("/api/admin/users/{id}/plan", post(admin::change_plan))
        .route(
            "/api/admin/users/{id}/deactivate",
            post(admin::deactivate_user),
        )
        .route("/api/admin/ratelimit/clear", post(admin::clear_rate_limit))
        .layer(from_fn_with_state(state.clone(), require_admin));

    let authenticated = Router::new()
        .route("/api/auth/logout", post(auth::logout))
        .merge(api)
        .merge(admin)
        .layer(from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(public)
        .merge(optional)
        .merge(authenticated)
        .layer(from_fn_with_state(state.clone(), limit_global))
        .with_state(state)
}
