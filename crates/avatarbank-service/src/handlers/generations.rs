//! Generation submission and lookup handlers.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::{Deserialize, Serialize};

use avatarbank_core::{AvatarId, Generation, GenerationId, Task};

use super::{paginate, parse_id, PageQuery};
use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::settlement::SubmitRequest;
use crate::state::AppState;

/// Longest accepted idempotency key.
const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;

/// Generation response.
#[derive(Debug, Serialize)]
pub struct GenerationResponse {
    /// Generation ID.
    pub id: String,
    /// Paying user.
    pub buyer_id: String,
    /// Avatar, if any.
    pub avatar_id: Option<String>,
    /// Lifecycle state.
    pub status: String,
    /// Credits charged.
    pub credits_used: i64,
    /// Prompt.
    pub prompt: String,
    /// Result image (success only).
    pub image_url: Option<String>,
    /// Provider seed (success only).
    pub seed: Option<String>,
    /// Safety checker flag.
    pub nsfw_flag: bool,
    /// Provider queue request ID.
    pub request_id: Option<String>,
    /// Why it failed or was canceled.
    pub fail_reason: Option<String>,
    /// Task created for queued submissions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Created timestamp.
    pub created_at: String,
    /// Updated timestamp.
    pub updated_at: String,
}

impl From<&Generation> for GenerationResponse {
    fn from(generation: &Generation) -> Self {
        Self {
            id: generation.id.to_string(),
            buyer_id: generation.buyer_id.to_string(),
            avatar_id: generation.avatar_id.map(|id| id.to_string()),
            status: generation.status.to_string(),
            credits_used: generation.credits_used,
            prompt: generation.prompt.clone(),
            image_url: generation.image_url.clone(),
            seed: generation.seed.clone(),
            nsfw_flag: generation.nsfw_flag,
            request_id: generation.request_id.clone(),
            fail_reason: generation.fail_reason.clone(),
            task_id: None,
            created_at: generation.created_at.to_rfc3339(),
            updated_at: generation.updated_at.to_rfc3339(),
        }
    }
}

/// Task response.
#[derive(Debug, Serialize)]
pub struct TaskResponse {
    /// Task ID.
    pub id: String,
    /// Generation ID.
    pub generation_id: String,
    /// Kind of work.
    pub task_type: String,
    /// Execution state.
    pub status: String,
    /// Worker that ran it.
    pub worker_id: Option<String>,
    /// Retry number.
    pub retry_count: u32,
    /// Last worker error.
    pub last_error_message: Option<String>,
    /// Created timestamp.
    pub created_at: String,
    /// Started timestamp.
    pub started_at: Option<String>,
    /// Finished timestamp.
    pub finished_at: Option<String>,
}

impl From<&Task> for TaskResponse {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.to_string(),
            generation_id: task.generation_id.to_string(),
            task_type: task.task_type.clone(),
            status: task.status.to_string(),
            worker_id: task.worker_id.clone(),
            retry_count: task.retry_count,
            last_error_message: task.last_error_message.clone(),
            created_at: task.created_at.to_rfc3339(),
            started_at: task.started_at.map(|t| t.to_rfc3339()),
            finished_at: task.finished_at.map(|t| t.to_rfc3339()),
        }
    }
}

/// Submit generation request.
#[derive(Debug, Deserialize)]
pub struct CreateGenerationRequest {
    /// Avatar to render against.
    pub avatar_id: Option<String>,
    /// Prompt text.
    pub prompt: String,
    /// Extra credits for paid options (default: 0).
    #[serde(default)]
    pub option_credits: i64,
    /// Idempotency key. The `Idempotency-Key` header takes precedence.
    pub idempotency_key: Option<String>,
}

/// Submit a generation.
///
/// Responds `201` for a new generation, `200` when the idempotency key
/// matched an earlier one. A provider failure is not an error response: the
/// generation comes back `failed` with its refund already applied.
pub async fn create_generation(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    headers: HeaderMap,
    Json(body): Json<CreateGenerationRequest>,
) -> Result<(StatusCode, Json<GenerationResponse>), ApiError> {
    let avatar_id = body
        .avatar_id
        .as_deref()
        .map(|raw| parse_id::<AvatarId>(raw, "avatar"))
        .transpose()?;

    let idempotency_key = headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or(body.idempotency_key)
        .map(|key| key.trim().to_string())
        .filter(|key| !key.is_empty());
    if idempotency_key
        .as_ref()
        .is_some_and(|key| key.len() > MAX_IDEMPOTENCY_KEY_LEN)
    {
        return Err(ApiError::BadRequest(format!(
            "idempotency key longer than {MAX_IDEMPOTENCY_KEY_LEN} bytes"
        )));
    }

    let submission = state
        .settlement
        .submit(
            &auth.user_id,
            SubmitRequest {
                avatar_id,
                prompt: body.prompt,
                option_credits: body.option_credits,
                idempotency_key,
            },
        )
        .await?;

    let mut response = GenerationResponse::from(&submission.generation);
    response.task_id = submission.task.map(|task| task.id.to_string());

    let status = if submission.replayed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(response)))
}

/// Load a generation owned by the caller.
async fn owned_generation(
    state: &AppState,
    auth: &AuthUser,
    raw_id: &str,
) -> Result<Generation, ApiError> {
    let id: GenerationId = parse_id(raw_id, "generation")?;
    state
        .store
        .get_generation(&id)
        .await?
        .filter(|generation| generation.buyer_id == auth.user_id)
        .ok_or_else(|| ApiError::NotFound(format!("generation not found: {raw_id}")))
}

/// Get one of the caller's generations.
pub async fn get_generation(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(generation_id): Path<String>,
) -> Result<Json<GenerationResponse>, ApiError> {
    let generation = owned_generation(&state, &auth, &generation_id).await?;
    Ok(Json(GenerationResponse::from(&generation)))
}

/// Generation page response.
#[derive(Debug, Serialize)]
pub struct ListGenerationsResponse {
    /// Generations (newest first).
    pub generations: Vec<GenerationResponse>,
    /// Whether there are more generations.
    pub has_more: bool,
}

/// List the caller's generations.
pub async fn list_my_generations(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Query(query): Query<PageQuery>,
) -> Result<Json<ListGenerationsResponse>, ApiError> {
    let limit = query.limit();
    let generations = state
        .store
        .list_generations_by_buyer(&auth.user_id, limit + 1, query.offset)
        .await?;
    let (generations, has_more) = paginate(generations, limit);

    Ok(Json(ListGenerationsResponse {
        generations: generations.iter().map(GenerationResponse::from).collect(),
        has_more,
    }))
}

/// Cancel one of the caller's pending generations and refund it.
pub async fn cancel_generation(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(generation_id): Path<String>,
) -> Result<Json<GenerationResponse>, ApiError> {
    let id: GenerationId = parse_id(&generation_id, "generation")?;
    let outcome = state
        .settlement
        .cancel(&id, Some(&auth.user_id), "canceled by buyer")
        .await?;
    Ok(Json(GenerationResponse::from(outcome.generation())))
}

/// Task list response.
#[derive(Debug, Serialize)]
pub struct ListTasksResponse {
    /// Tasks, first dispatch first.
    pub tasks: Vec<TaskResponse>,
}

/// List the tasks of one of the caller's generations.
pub async fn list_generation_tasks(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(generation_id): Path<String>,
) -> Result<Json<ListTasksResponse>, ApiError> {
    let generation = owned_generation(&state, &auth, &generation_id).await?;
    let tasks = state.store.list_tasks_by_generation(&generation.id).await?;
    Ok(Json(ListTasksResponse {
        tasks: tasks.iter().map(TaskResponse::from).collect(),
    }))
}
