//! Account management handlers.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use avatarbank_core::{User, SUPPORTED_LOCALES};

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

/// Longest accepted nickname, in characters.
const MAX_NICKNAME_CHARS: usize = 50;

/// User profile response.
#[derive(Debug, Serialize)]
pub struct UserResponse {
    /// User ID.
    pub id: String,
    /// Email.
    pub email: String,
    /// Display name.
    pub nickname: String,
    /// Role.
    pub role: String,
    /// Account status.
    pub status: String,
    /// UI locale.
    pub locale: String,
    /// Current balance in credits.
    pub credit_balance: i64,
    /// Created timestamp.
    pub created_at: String,
}

impl From<&User> for UserResponse {
    fn from(user: &User) -> Self {
        Self {
            id: user.id.to_string(),
            email: user.email.clone(),
            nickname: user.nickname.clone(),
            role: user.role.to_string(),
            status: user.status.to_string(),
            locale: user.locale.clone(),
            credit_balance: user.credit_balance,
            created_at: user.created_at.to_rfc3339(),
        }
    }
}

/// Create account request.
#[derive(Debug, Deserialize)]
pub struct CreateAccountRequest {
    /// Email. Defaults to the token's email claim.
    pub email: Option<String>,
    /// Display name.
    pub nickname: String,
    /// UI locale (default: "en").
    pub locale: Option<String>,
}

/// Register the caller's profile with a zero balance.
pub async fn create_account(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(body): Json<CreateAccountRequest>,
) -> Result<(StatusCode, Json<UserResponse>), ApiError> {
    let email = body
        .email
        .or(auth.email)
        .map(|email| email.trim().to_string())
        .filter(|email| email.contains('@'))
        .ok_or_else(|| ApiError::BadRequest("a valid email is required".into()))?;

    let nickname = body.nickname.trim();
    if nickname.is_empty() || nickname.chars().count() > MAX_NICKNAME_CHARS {
        return Err(ApiError::BadRequest(format!(
            "nickname must be 1 to {MAX_NICKNAME_CHARS} characters"
        )));
    }

    let mut user = User::new(auth.user_id, email, nickname);
    if let Some(locale) = body.locale {
        if !SUPPORTED_LOCALES.contains(&locale.as_str()) {
            return Err(ApiError::BadRequest(format!("unsupported locale: {locale}")));
        }
        user.locale = locale;
    }

    state.store.create_user(&user).await?;

    tracing::info!(user_id = %user.id, "Account created");

    Ok((StatusCode::CREATED, Json(UserResponse::from(&user))))
}

/// Get the current user's profile.
pub async fn get_account(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<Json<UserResponse>, ApiError> {
    let user = state
        .store
        .get_user(&auth.user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Account not found".into()))?;

    Ok(Json(UserResponse::from(&user)))
}
