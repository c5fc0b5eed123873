//! Worker tasks.
//!
//! A task is one dispatch of a generation to a worker. Retries create a new
//! task for the same generation; the generation and its debit are reused.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{GenerationId, TaskId};

/// Task type for image generation.
pub const TASK_TYPE_IMAGE_GENERATION: &str = "image_generation";

/// A unit of work handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Task ID.
    pub id: TaskId,

    /// Generation this task works on.
    pub generation_id: GenerationId,

    /// Kind of work.
    pub task_type: String,

    /// Execution state.
    pub status: TaskStatus,

    /// Worker that picked the task up.
    pub worker_id: Option<String>,

    /// Zero for the first dispatch, incremented per retry.
    pub retry_count: u32,

    /// Last error reported by the worker.
    pub last_error_message: Option<String>,

    /// When the task was created.
    pub created_at: DateTime<Utc>,

    /// When a worker started it.
    pub started_at: Option<DateTime<Utc>>,

    /// When it reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a queued image generation task.
    #[must_use]
    pub fn queued(generation_id: GenerationId, retry_count: u32) -> Self {
        Self {
            id: TaskId::generate(),
            generation_id,
            task_type: TASK_TYPE_IMAGE_GENERATION.to_string(),
            status: TaskStatus::Queued,
            worker_id: None,
            retry_count,
            last_error_message: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Mark the task as picked up by `worker_id`.
    pub fn start(&mut self, worker_id: impl Into<String>) {
        self.status = TaskStatus::Running;
        self.worker_id = Some(worker_id.into());
        self.started_at = Some(Utc::now());
    }

    /// Move the task to a terminal state.
    pub fn finish(&mut self, status: TaskStatus, error: Option<String>) {
        self.status = status;
        if error.is_some() {
            self.last_error_message = error;
        }
        self.finished_at = Some(Utc::now());
    }
}

/// Execution state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for a worker.
    Queued,
    /// A worker is on it.
    Running,
    /// Done, image produced.
    Success,
    /// Done, no image.
    Failed,
    /// Abandoned.
    Canceled,
}

impl TaskStatus {
    /// Whether the task is finished.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Canceled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        })
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}
