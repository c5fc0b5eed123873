//! Avatar listing, creation and preview upload.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use avatarbank_core::{Avatar, AvatarId, AvatarStatus, UserRole, DEFAULT_CREDIT_PER_GENERATION};

use super::{paginate, parse_id, PageQuery};
use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

/// Highest per-generation price an influencer may set.
const MAX_CREDIT_PER_GENERATION: i64 = 1000;

/// Avatar response.
#[derive(Debug, Serialize)]
pub struct AvatarResponse {
    /// Avatar ID.
    pub id: String,
    /// Owning influencer.
    pub influencer_id: String,
    /// Title.
    pub title: String,
    /// Description.
    pub description: Option<String>,
    /// Credits per generation.
    pub credit_per_generation: i64,
    /// Whether NSFW output is allowed.
    pub nsfw_allowed: bool,
    /// Preview image URL.
    pub preview_image_url: Option<String>,
    /// Curation status.
    pub status: String,
    /// Created timestamp.
    pub created_at: String,
}

impl From<&Avatar> for AvatarResponse {
    fn from(avatar: &Avatar) -> Self {
        Self {
            id: avatar.id.to_string(),
            influencer_id: avatar.influencer_id.to_string(),
            title: avatar.title.clone(),
            description: avatar.description.clone(),
            credit_per_generation: avatar.credit_per_generation,
            nsfw_allowed: avatar.nsfw_allowed,
            preview_image_url: avatar.preview_image_url.clone(),
            status: avatar.status.to_string(),
            created_at: avatar.created_at.to_rfc3339(),
        }
    }
}

/// Avatar page response.
#[derive(Debug, Serialize)]
pub struct ListAvatarsResponse {
    /// Avatars (newest first).
    pub avatars: Vec<AvatarResponse>,
    /// Whether there are more avatars.
    pub has_more: bool,
}

/// List public avatars.
pub async fn list_avatars(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PageQuery>,
) -> Result<Json<ListAvatarsResponse>, ApiError> {
    let limit = query.limit();
    let avatars = state
        .store
        .list_avatars(Some(AvatarStatus::Public), limit + 1, query.offset)
        .await?;
    let (avatars, has_more) = paginate(avatars, limit);

    Ok(Json(ListAvatarsResponse {
        avatars: avatars.iter().map(AvatarResponse::from).collect(),
        has_more,
    }))
}

/// Get a public avatar.
pub async fn get_avatar(
    State(state): State<Arc<AppState>>,
    Path(avatar_id): Path<String>,
) -> Result<Json<AvatarResponse>, ApiError> {
    let id: AvatarId = parse_id(&avatar_id, "avatar")?;
    let avatar = state
        .store
        .get_avatar(&id)
        .await?
        .filter(Avatar::is_available)
        .ok_or(ApiError::AvatarNotFound(avatar_id))?;

    Ok(Json(AvatarResponse::from(&avatar)))
}

/// Create avatar request.
#[derive(Debug, Deserialize)]
pub struct CreateAvatarRequest {
    /// Title.
    pub title: String,
    /// Description.
    pub description: Option<String>,
    /// Credits per generation (default: 1).
    pub credit_per_generation: Option<i64>,
    /// Whether NSFW output is allowed.
    #[serde(default)]
    pub nsfw_allowed: bool,
}

/// Create an avatar awaiting review. Influencers only.
pub async fn create_avatar(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(body): Json<CreateAvatarRequest>,
) -> Result<(StatusCode, Json<AvatarResponse>), ApiError> {
    let owner = state
        .store
        .get_user(&auth.user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Account not found".into()))?;
    if owner.role != UserRole::Influencer || !owner.is_active() {
        return Err(ApiError::Forbidden);
    }

    let title = body.title.trim();
    if title.is_empty() {
        return Err(ApiError::BadRequest("title must not be empty".into()));
    }
    let price = body
        .credit_per_generation
        .unwrap_or(DEFAULT_CREDIT_PER_GENERATION);
    if !(1..=MAX_CREDIT_PER_GENERATION).contains(&price) {
        return Err(ApiError::BadRequest(format!(
            "credit_per_generation must be between 1 and {MAX_CREDIT_PER_GENERATION}"
        )));
    }

    let mut avatar = Avatar::new(owner.id, title, price);
    avatar.description = body.description;
    avatar.nsfw_allowed = body.nsfw_allowed;

    state.store.create_avatar(&avatar).await?;

    tracing::info!(avatar_id = %avatar.id, influencer_id = %owner.id, "Avatar created");

    Ok((StatusCode::CREATED, Json(AvatarResponse::from(&avatar))))
}

/// Preview upload query parameters.
#[derive(Debug, Deserialize)]
pub struct PreviewQuery {
    /// Original file name, used for the extension.
    #[serde(default = "default_file_name")]
    pub file_name: String,
}

fn default_file_name() -> String {
    "preview.jpg".into()
}

/// Upload a preview image for an avatar the caller owns.
///
/// The request body is the raw image. A previous preview is deleted.
pub async fn upload_preview(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(avatar_id): Path<String>,
    Query(query): Query<PreviewQuery>,
    body: Bytes,
) -> Result<Json<AvatarResponse>, ApiError> {
    let id: AvatarId = parse_id(&avatar_id, "avatar")?;
    let mut avatar = state
        .store
        .get_avatar(&id)
        .await?
        .filter(|avatar| avatar.influencer_id == auth.user_id)
        .ok_or(ApiError::AvatarNotFound(avatar_id))?;

    if body.is_empty() {
        return Err(ApiError::BadRequest("image body is empty".into()));
    }

    let stored = state
        .media
        .upload(&format!("avatars/{id}"), &query.file_name, &body)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    if let Some(previous) = avatar.preview_image_url.replace(stored.url) {
        if let Err(e) = state.media.delete(&previous).await {
            tracing::warn!(avatar_id = %id, error = %e, "Failed to delete old preview");
        }
    }
    avatar.updated_at = chrono::Utc::now();
    state.store.update_avatar(&avatar).await?;

    tracing::info!(avatar_id = %id, key = %stored.key, "Avatar preview uploaded");

    Ok(Json(AvatarResponse::from(&avatar)))
}
