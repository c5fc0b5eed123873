//! Generation records and their state machine.
//!
//! ```text
//!             start              complete
//!  Pending ───────────► Processing ─────────► Success
//!     │  ▲                 │  │
//!     │  └─────requeue─────┘  │ fail
//!     │                       ▼
//!     ├──────── fail ──────► Failed    (refund)
//!     └──────── cancel ────► Canceled  (refund, also from Processing)
//! ```
//!
//! Every state change goes through [`Generation::apply`]. The only
//! transitions that touch money are `Fail` and `Cancel`, and they can only
//! fire from a non-terminal state, so a generation is refunded at most once.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MarketError, Result};
use crate::{AvatarId, GenerationId, UserId};

/// Maximum prompt length in characters.
pub const MAX_PROMPT_CHARS: usize = 2000;

/// Upper bound for option credits on a single request.
pub const MAX_OPTION_CREDITS: i64 = 100;

/// One attempt to produce an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generation {
    /// Generation ID.
    pub id: GenerationId,

    /// The paying user.
    pub buyer_id: UserId,

    /// Avatar the prompt is rendered against, if any.
    pub avatar_id: Option<AvatarId>,

    /// Credits debited at submission. Never recomputed.
    pub credits_used: i64,

    /// The prompt as submitted.
    pub prompt: String,

    /// Lifecycle state.
    pub status: GenerationStatus,

    /// Result image location. Set only on success.
    pub image_url: Option<String>,

    /// Provider seed. Set only on success.
    pub seed: Option<String>,

    /// Whether the provider's safety checker flagged the output.
    pub nsfw_flag: bool,

    /// Provider queue request ID (queued path only).
    pub request_id: Option<String>,

    /// Why the generation failed or was canceled.
    pub fail_reason: Option<String>,

    /// Client-supplied key that makes submission idempotent per buyer.
    pub idempotency_key: Option<String>,

    /// When the generation was submitted (and charged).
    pub created_at: DateTime<Utc>,

    /// When the generation last changed state.
    pub updated_at: DateTime<Utc>,
}

impl Generation {
    /// Create a freshly charged generation in the `Pending` state.
    #[must_use]
    pub fn pending(
        buyer_id: UserId,
        avatar_id: Option<AvatarId>,
        prompt: impl Into<String>,
        credits_used: i64,
        idempotency_key: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: GenerationId::generate(),
            buyer_id,
            avatar_id,
            credits_used,
            prompt: prompt.into(),
            status: GenerationStatus::Pending,
            image_url: None,
            seed: None,
            nsfw_flag: false,
            request_id: None,
            fail_reason: None,
            idempotency_key,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a transition, returning the ledger effect the caller must
    /// commit together with the updated record.
    ///
    /// # Errors
    ///
    /// Returns `MarketError::InvalidTransition` if the state machine does not
    /// allow `transition` from the current state. The record is left untouched.
    pub fn apply(&mut self, transition: Transition) -> Result<LedgerEffect> {
        use GenerationStatus::{Canceled, Failed, Pending, Processing, Success};

        let invalid = |from, transition: &Transition| MarketError::InvalidTransition {
            from,
            transition: transition.name(),
        };

        let effect = match (self.status, transition) {
            (Pending, Transition::Start) => {
                self.status = Processing;
                LedgerEffect::None
            }
            (Processing, Transition::Complete(image)) => {
                self.status = Success;
                self.image_url = Some(image.image_url);
                self.seed = image.seed;
                self.nsfw_flag = image.nsfw_flag;
                LedgerEffect::None
            }
            (Pending | Processing, Transition::Fail { reason }) => {
                self.status = Failed;
                self.fail_reason = Some(reason);
                LedgerEffect::Refund {
                    amount: self.credits_used,
                }
            }
            (Pending | Processing, Transition::Cancel { reason }) => {
                self.status = Canceled;
                self.fail_reason = Some(reason);
                LedgerEffect::Refund {
                    amount: self.credits_used,
                }
            }
            (Processing, Transition::Requeue) => {
                self.status = Pending;
                LedgerEffect::None
            }
            (Pending | Processing, Transition::AttachRequest { request_id }) => {
                self.request_id = Some(request_id);
                LedgerEffect::None
            }
            (from, transition) => return Err(invalid(from, &transition)),
        };

        self.updated_at = Utc::now();
        Ok(effect)
    }

    /// Whether the generation has reached a final state.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Lifecycle state of a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    /// Charged, not yet picked up. Outcome unknown.
    Pending,

    /// Provider call in flight. Outcome unknown.
    Processing,

    /// Image produced.
    Success,

    /// Provider failed; credits refunded.
    Failed,

    /// Abandoned before an outcome; credits refunded.
    Canceled,
}

impl GenerationStatus {
    /// Terminal states are immutable.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Canceled)
    }

    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for GenerationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for GenerationStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            other => Err(format!("unknown generation status: {other}")),
        }
    }
}

/// Structured success payload from the image provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedImage {
    /// Where the provider put the image.
    pub image_url: String,

    /// Seed the provider used, if reported.
    pub seed: Option<String>,

    /// Whether the safety checker flagged the image.
    pub nsfw_flag: bool,
}

/// A requested change to a generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// A worker or the inline path picked the generation up.
    Start,

    /// The provider returned an image.
    Complete(GeneratedImage),

    /// The provider failed, timed out, or the generation went stale.
    Fail {
        /// Human-readable reason shown to the buyer.
        reason: String,
    },

    /// The generation was abandoned before an outcome.
    Cancel {
        /// Human-readable reason shown to the buyer.
        reason: String,
    },

    /// Put a processing generation back in the queue for another attempt.
    Requeue,

    /// Record the provider's queue request ID.
    AttachRequest {
        /// Provider-side request ID.
        request_id: String,
    },
}

impl Transition {
    /// Short name used in errors and logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Complete(_) => "complete",
            Self::Fail { .. } => "fail",
            Self::Cancel { .. } => "cancel",
            Self::Requeue => "requeue",
            Self::AttachRequest { .. } => "attach_request",
        }
    }

    /// Whether the transition moves the generation to a terminal state.
    ///
    /// Settling an already-settled generation is a no-op rather than an
    /// error, which is what makes outcome reporting safe to repeat.
    #[must_use]
    pub const fn is_settlement(&self) -> bool {
        matches!(self, Self::Complete(_) | Self::Fail { .. } | Self::Cancel { .. })
    }
}

/// Ledger consequence of a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerEffect {
    /// No balance change.
    None,

    /// Return the generation's credits to the buyer.
    Refund {
        /// Credits to return.
        amount: i64,
    },
}
