//! Worker callback handlers.
//!
//! External workers report task progress here. Bodies are signed with the
//! shared worker secret (see [`WorkerRequest`]). Outcome reports are safe to
//! repeat: a report for a settled generation changes nothing.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use avatarbank_core::{GeneratedImage, TaskId};

use super::generations::{GenerationResponse, TaskResponse};
use super::parse_id;
use crate::auth::WorkerRequest;
use crate::error::ApiError;
use crate::settlement::TaskFailure;
use crate::state::AppState;

/// Task start report.
#[derive(Debug, Deserialize)]
pub struct StartTaskRequest {
    /// Reporting worker.
    #[serde(default = "default_worker_id")]
    pub worker_id: String,
}

fn default_worker_id() -> String {
    "external".to_string()
}

/// Task state after a report.
#[derive(Debug, Serialize)]
pub struct TaskReportResponse {
    /// The reported task, or its replacement after a retry.
    pub task: Option<TaskResponse>,
    /// The generation after the report.
    pub generation: GenerationResponse,
    /// Whether a retry was scheduled.
    pub retried: bool,
}

/// A worker picked up a task.
pub async fn start_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
    WorkerRequest(body): WorkerRequest<StartTaskRequest>,
) -> Result<Json<TaskReportResponse>, ApiError> {
    let id: TaskId = parse_id(&task_id, "task")?;
    let (task, generation) = state.settlement.start_task(&id, &body.worker_id).await?;

    Ok(Json(TaskReportResponse {
        task: Some(TaskResponse::from(&task)),
        generation: GenerationResponse::from(&generation),
        retried: false,
    }))
}

/// Task completion report.
#[derive(Debug, Deserialize)]
pub struct CompleteTaskRequest {
    /// Where the image was stored.
    pub image_url: String,
    /// Provider seed.
    pub seed: Option<String>,
    /// Safety checker flag.
    #[serde(default)]
    pub nsfw_flag: bool,
}

/// A worker produced an image.
pub async fn complete_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
    WorkerRequest(body): WorkerRequest<CompleteTaskRequest>,
) -> Result<Json<TaskReportResponse>, ApiError> {
    let id: TaskId = parse_id(&task_id, "task")?;
    if body.image_url.trim().is_empty() {
        return Err(ApiError::BadRequest("image_url must not be empty".into()));
    }

    let outcome = state
        .settlement
        .complete_task(
            &id,
            GeneratedImage {
                image_url: body.image_url,
                seed: body.seed,
                nsfw_flag: body.nsfw_flag,
            },
        )
        .await?;
    let task = state.store.get_task(&id).await?;

    Ok(Json(TaskReportResponse {
        task: task.as_ref().map(TaskResponse::from),
        generation: GenerationResponse::from(outcome.generation()),
        retried: false,
    }))
}

/// Task failure report.
#[derive(Debug, Deserialize)]
pub struct FailTaskRequest {
    /// What went wrong.
    #[serde(default = "default_error")]
    pub error: String,
}

fn default_error() -> String {
    "worker reported failure".to_string()
}

/// A worker gave up on a task. The generation is retried or refunded.
pub async fn fail_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
    WorkerRequest(body): WorkerRequest<FailTaskRequest>,
) -> Result<Json<TaskReportResponse>, ApiError> {
    let id: TaskId = parse_id(&task_id, "task")?;

    let response = match state.settlement.fail_task(&id, &body.error).await? {
        TaskFailure::Retried { generation, task } => TaskReportResponse {
            task: Some(TaskResponse::from(&task)),
            generation: GenerationResponse::from(&generation),
            retried: true,
        },
        TaskFailure::Settled(outcome) => {
            let task = state.store.get_task(&id).await?;
            TaskReportResponse {
                task: task.as_ref().map(TaskResponse::from),
                generation: GenerationResponse::from(outcome.generation()),
                retried: false,
            }
        }
        TaskFailure::Ignored(generation) => {
            let task = state.store.get_task(&id).await?;
            TaskReportResponse {
                task: task.as_ref().map(TaskResponse::from),
                generation: GenerationResponse::from(&generation),
                retried: false,
            }
        }
    };

    Ok(Json(response))
}
