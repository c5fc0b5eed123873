//! Request and response types for the avatarbank client.

use serde::{Deserialize, Serialize};

use avatarbank_core::{AvatarId, GenerationId, GenerationStatus, TaskId, UserId};

/// Balance response.
#[derive(Debug, Clone, Deserialize)]
pub struct BalanceResponse {
    /// Balance in credits.
    pub credit_balance: i64,
    /// Credits the user may spend now.
    pub spendable_credits: i64,
    /// Account status.
    pub status: String,
}

/// One ledger entry.
#[derive(Debug, Clone, Deserialize)]
pub struct Transaction {
    /// Transaction ID.
    pub id: String,
    /// `purchase`, `generation_debit`, `generation_refund` or `payout`.
    pub transaction_type: String,
    /// Signed amount (positive = credit, negative = debit).
    pub amount: i64,
    /// Balance before.
    pub credit_before: i64,
    /// Balance after.
    pub credit_after: i64,
    /// Generation ID or payout reference.
    pub reference_id: Option<String>,
    /// Description.
    pub description: String,
    /// RFC 3339 timestamp.
    pub created_at: String,
}

/// A page of ledger entries, newest first.
#[derive(Debug, Clone, Deserialize)]
pub struct TransactionPage {
    /// Entries.
    pub transactions: Vec<Transaction>,
    /// Whether another page exists.
    pub has_more: bool,
}

/// A sellable avatar.
#[derive(Debug, Clone, Deserialize)]
pub struct Avatar {
    /// Avatar ID.
    pub id: AvatarId,
    /// Owning influencer.
    pub influencer_id: UserId,
    /// Title.
    pub title: String,
    /// Description.
    pub description: Option<String>,
    /// Price per generation.
    pub credit_per_generation: i64,
    /// Whether NSFW output is allowed.
    pub nsfw_allowed: bool,
    /// Preview image.
    pub preview_image_url: Option<String>,
    /// Listing status.
    pub status: String,
    /// RFC 3339 timestamp.
    pub created_at: String,
}

/// A page of avatars.
#[derive(Debug, Clone, Deserialize)]
pub struct AvatarPage {
    /// Avatars.
    pub avatars: Vec<Avatar>,
    /// Whether another page exists.
    pub has_more: bool,
}

/// Generation submission.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CreateGeneration {
    /// Avatar to render against.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_id: Option<AvatarId>,
    /// Prompt text.
    pub prompt: String,
    /// Extra credits for paid options.
    #[serde(skip_serializing_if = "is_zero")]
    pub option_credits: i64,
    /// Key that makes a resubmission return the original generation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero(value: &i64) -> bool {
    *value == 0
}

impl CreateGeneration {
    /// A submission with no avatar.
    #[must_use]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    /// Render against an avatar.
    #[must_use]
    pub fn with_avatar(mut self, avatar_id: AvatarId) -> Self {
        self.avatar_id = Some(avatar_id);
        self
    }

    /// Attach an idempotency key.
    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// A generation as the API reports it.
#[derive(Debug, Clone, Deserialize)]
pub struct Generation {
    /// Generation ID.
    pub id: GenerationId,
    /// Paying user.
    pub buyer_id: UserId,
    /// Avatar, if any.
    pub avatar_id: Option<AvatarId>,
    /// Lifecycle state.
    pub status: GenerationStatus,
    /// Credits charged.
    pub credits_used: i64,
    /// Prompt.
    pub prompt: String,
    /// Result image.
    pub image_url: Option<String>,
    /// Provider seed.
    pub seed: Option<String>,
    /// Safety checker flag.
    #[serde(default)]
    pub nsfw_flag: bool,
    /// Provider queue request ID.
    pub request_id: Option<String>,
    /// Why it failed or was canceled.
    pub fail_reason: Option<String>,
    /// Task created for a queued submission.
    #[serde(default)]
    pub task_id: Option<TaskId>,
    /// RFC 3339 timestamp.
    pub created_at: String,
    /// RFC 3339 timestamp.
    pub updated_at: String,
}

impl Generation {
    /// Whether the outcome is known.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Result of a submission.
#[derive(Debug, Clone)]
pub struct Submission {
    /// The generation.
    pub generation: Generation,
    /// True when an earlier submission with the same idempotency key was
    /// returned instead of a new charge.
    pub replayed: bool,
}

/// A page of generations, newest first.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationPage {
    /// Generations.
    pub generations: Vec<Generation>,
    /// Whether another page exists.
    pub has_more: bool,
}

/// A unit of queued work.
#[derive(Debug, Clone, Deserialize)]
pub struct Task {
    /// Task ID.
    pub id: TaskId,
    /// Generation it runs.
    pub generation_id: GenerationId,
    /// Kind of work.
    pub task_type: String,
    /// `pending`, `processing`, `success` or `failed`.
    pub status: String,
    /// Worker that ran it.
    pub worker_id: Option<String>,
    /// Retry number.
    pub retry_count: u32,
    /// Last worker error.
    pub last_error_message: Option<String>,
    /// RFC 3339 timestamp.
    pub created_at: String,
    /// RFC 3339 timestamp.
    pub started_at: Option<String>,
    /// RFC 3339 timestamp.
    pub finished_at: Option<String>,
}

/// Outcome of a worker callback.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskReport {
    /// The task, or its retry when one was queued.
    pub task: Option<Task>,
    /// The generation after the report.
    pub generation: Generation,
    /// Whether the failure was retried instead of settled.
    #[serde(default)]
    pub retried: bool,
}

/// Worker result for a finished task.
#[derive(Debug, Clone, Serialize)]
pub struct CompletedImage {
    /// Result image.
    pub image_url: String,
    /// Provider seed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<String>,
    /// Safety checker flag.
    pub nsfw_flag: bool,
}

/// API error response.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorResponse {
    /// Error details.
    pub error: ApiErrorBody,
}

/// API error body.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    /// Error code.
    pub code: String,
    /// Error message.
    pub message: String,
    /// Additional details.
    pub details: Option<serde_json::Value>,
}
