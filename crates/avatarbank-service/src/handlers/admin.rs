//! Admin handlers.
//!
//! Every route requires [`AdminAuth`]. Credit purchases and payouts are
//! recorded here by hand; there is no payment integration.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use avatarbank_core::{AvatarId, AvatarStatus, GenerationId, UserId, UserRole, UserStatus};

use super::accounts::UserResponse;
use super::avatars::{AvatarResponse, ListAvatarsResponse};
use super::credits::TransactionResponse;
use super::generations::GenerationResponse;
use super::{paginate, parse_id, PageQuery};
use crate::auth::AdminAuth;
use crate::error::ApiError;
use crate::settlement::{LedgerAudit, SweepReport};
use crate::state::AppState;

/// Largest single credit adjustment an admin may record.
const MAX_ADJUSTMENT: i64 = 1_000_000;

fn check_amount(amount: i64) -> Result<(), ApiError> {
    if amount <= 0 || amount > MAX_ADJUSTMENT {
        return Err(ApiError::BadRequest(format!(
            "amount must be between 1 and {MAX_ADJUSTMENT}"
        )));
    }
    Ok(())
}

// ============================================================================
// Credits
// ============================================================================

/// Purchase recording request.
#[derive(Debug, Deserialize)]
pub struct PurchaseRequest {
    /// User to credit.
    pub user_id: String,
    /// Credits bought.
    pub amount: i64,
    /// Description (default: "Credit purchase").
    pub description: Option<String>,
}

/// Balance change response.
#[derive(Debug, Serialize)]
pub struct AdjustmentResponse {
    /// The recorded transaction.
    pub transaction: TransactionResponse,
    /// Balance after the transaction.
    pub balance: i64,
}

/// Record a credit purchase.
pub async fn record_purchase(
    State(state): State<Arc<AppState>>,
    admin: AdminAuth,
    Json(body): Json<PurchaseRequest>,
) -> Result<Json<AdjustmentResponse>, ApiError> {
    let user_id: UserId = parse_id(&body.user_id, "user")?;
    check_amount(body.amount)?;

    let description = body
        .description
        .unwrap_or_else(|| "Credit purchase".to_string());
    let tx = state
        .store
        .add_credits(&user_id, body.amount, description)
        .await?;

    tracing::info!(
        admin = %admin.email,
        user_id = %user_id,
        amount = body.amount,
        balance = tx.credit_after,
        "Purchase recorded"
    );

    Ok(Json(AdjustmentResponse {
        balance: tx.credit_after,
        transaction: TransactionResponse::from(&tx),
    }))
}

/// Payout recording request.
#[derive(Debug, Deserialize)]
pub struct PayoutRequest {
    /// User paid out.
    pub user_id: String,
    /// Credits converted to payout.
    pub amount: i64,
    /// External payout reference.
    pub payout_reference: Option<String>,
    /// Description (default: "Influencer payout").
    pub description: Option<String>,
}

/// Record a payout. Fails with `402` if it exceeds the balance.
pub async fn record_payout(
    State(state): State<Arc<AppState>>,
    admin: AdminAuth,
    Json(body): Json<PayoutRequest>,
) -> Result<Json<AdjustmentResponse>, ApiError> {
    let user_id: UserId = parse_id(&body.user_id, "user")?;
    check_amount(body.amount)?;

    let description = body
        .description
        .unwrap_or_else(|| "Influencer payout".to_string());
    let tx = state
        .store
        .record_payout(&user_id, body.amount, body.payout_reference, description)
        .await?;

    tracing::info!(
        admin = %admin.email,
        user_id = %user_id,
        amount = body.amount,
        balance = tx.credit_after,
        "Payout recorded"
    );

    Ok(Json(AdjustmentResponse {
        balance: tx.credit_after,
        transaction: TransactionResponse::from(&tx),
    }))
}

// ============================================================================
// Users and avatars
// ============================================================================

/// Influencer approval request.
#[derive(Debug, Deserialize)]
pub struct ApproveInfluencerRequest {
    /// User to promote.
    pub user_id: String,
}

/// Promote a user to influencer. Approving an influencer again is a no-op.
pub async fn approve_influencer(
    State(state): State<Arc<AppState>>,
    admin: AdminAuth,
    Json(body): Json<ApproveInfluencerRequest>,
) -> Result<Json<UserResponse>, ApiError> {
    let user_id: UserId = parse_id(&body.user_id, "user")?;
    let user = state
        .store
        .get_user(&user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("user not found: {user_id}")))?;

    if user.role == UserRole::Influencer {
        return Ok(Json(UserResponse::from(&user)));
    }

    let user = state
        .store
        .set_user_role(&user_id, UserRole::Influencer)
        .await?;
    tracing::info!(admin = %admin.email, user_id = %user_id, "Influencer approved");

    Ok(Json(UserResponse::from(&user)))
}

/// Status change request.
#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    /// New status.
    pub status: String,
}

/// Change a user's account status.
pub async fn set_user_status(
    State(state): State<Arc<AppState>>,
    admin: AdminAuth,
    Path(user_id): Path<String>,
    Json(body): Json<StatusRequest>,
) -> Result<Json<UserResponse>, ApiError> {
    let user_id: UserId = parse_id(&user_id, "user")?;
    let status: UserStatus = body
        .status
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("unknown user status: {}", body.status)))?;

    let user = state.store.set_user_status(&user_id, status).await?;
    tracing::info!(admin = %admin.email, user_id = %user_id, status = %status, "User status changed");

    Ok(Json(UserResponse::from(&user)))
}

/// Change an avatar's curation status.
pub async fn set_avatar_status(
    State(state): State<Arc<AppState>>,
    admin: AdminAuth,
    Path(avatar_id): Path<String>,
    Json(body): Json<StatusRequest>,
) -> Result<Json<AvatarResponse>, ApiError> {
    let id: AvatarId = parse_id(&avatar_id, "avatar")?;
    let status: AvatarStatus = body
        .status
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("unknown avatar status: {}", body.status)))?;

    let mut avatar = state
        .store
        .get_avatar(&id)
        .await?
        .ok_or(ApiError::AvatarNotFound(avatar_id))?;
    avatar.status = status;
    avatar.updated_at = chrono::Utc::now();
    state.store.update_avatar(&avatar).await?;

    tracing::info!(admin = %admin.email, avatar_id = %id, status = %status, "Avatar status changed");

    Ok(Json(AvatarResponse::from(&avatar)))
}

/// Admin avatar listing query.
#[derive(Debug, Deserialize)]
pub struct AdminAvatarQuery {
    /// Only avatars in this status.
    pub status: Option<String>,
    /// Page size.
    #[serde(default = "super::default_limit")]
    pub limit: usize,
    /// Offset for pagination.
    #[serde(default)]
    pub offset: usize,
}

/// List avatars in any status, e.g. the review queue.
pub async fn list_avatars(
    State(state): State<Arc<AppState>>,
    _admin: AdminAuth,
    Query(query): Query<AdminAvatarQuery>,
) -> Result<Json<ListAvatarsResponse>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(|raw| {
            raw.parse::<AvatarStatus>()
                .map_err(|_| ApiError::BadRequest(format!("unknown avatar status: {raw}")))
        })
        .transpose()?;

    let page = PageQuery {
        limit: query.limit,
        offset: query.offset,
    };
    let limit = page.limit();
    let avatars = state
        .store
        .list_avatars(status, limit + 1, page.offset)
        .await?;
    let (avatars, has_more) = paginate(avatars, limit);

    Ok(Json(ListAvatarsResponse {
        avatars: avatars.iter().map(AvatarResponse::from).collect(),
        has_more,
    }))
}

// ============================================================================
// Generations and recovery
// ============================================================================

/// Cancel a pending or processing generation and refund it.
pub async fn cancel_generation(
    State(state): State<Arc<AppState>>,
    admin: AdminAuth,
    Path(generation_id): Path<String>,
) -> Result<Json<GenerationResponse>, ApiError> {
    let id: GenerationId = parse_id(&generation_id, "generation")?;
    let reason = format!("canceled by admin {}", admin.email);
    let outcome = state.settlement.cancel(&id, None, &reason).await?;
    Ok(Json(GenerationResponse::from(outcome.generation())))
}

/// Run one stale sweep now.
pub async fn sweep(
    State(state): State<Arc<AppState>>,
    admin: AdminAuth,
) -> Result<Json<SweepReport>, ApiError> {
    let report = state.settlement.sweep_stale().await?;
    tracing::info!(
        admin = %admin.email,
        examined = report.examined,
        refunded = report.refunded.len(),
        "Manual stale sweep"
    );
    Ok(Json(report))
}

/// Replay a user's ledger against their balance.
pub async fn ledger_audit(
    State(state): State<Arc<AppState>>,
    _admin: AdminAuth,
    Path(user_id): Path<String>,
) -> Result<Json<LedgerAudit>, ApiError> {
    let user_id: UserId = parse_id(&user_id, "user")?;
    Ok(Json(state.settlement.audit_ledger(&user_id).await?))
}
