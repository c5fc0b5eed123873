//! Error types for avatarbank.

use crate::generation::GenerationStatus;
use crate::ids::IdError;

/// Result type for avatarbank operations.
pub type Result<T> = std::result::Result<T, MarketError>;

/// Errors that can occur in avatarbank operations.
///
/// Precondition errors (`InsufficientCredits`, `AvatarNotFound`) are raised
/// before anything is written. Provider errors are raised after the debit and
/// are folded into a failed generation plus refund; they never reach the
/// buyer as a raw error.
#[derive(Debug, thiserror::Error)]
pub enum MarketError {
    /// The buyer cannot cover the cost (or is not allowed to spend at all).
    #[error("insufficient credits: balance={balance}, required={required}")]
    InsufficientCredits {
        /// Spendable balance in credits.
        balance: i64,
        /// Required amount in credits.
        required: i64,
    },

    /// The requested avatar does not exist or is not available for generation.
    #[error("avatar not found: {avatar_id}")]
    AvatarNotFound {
        /// The avatar ID that was not found.
        avatar_id: String,
    },

    /// User not found.
    #[error("user not found: {user_id}")]
    UserNotFound {
        /// The user ID that was not found.
        user_id: String,
    },

    /// User already registered.
    #[error("user already exists: {user_id}")]
    UserAlreadyExists {
        /// The user ID that already exists.
        user_id: String,
    },

    /// Generation not found.
    #[error("generation not found: {generation_id}")]
    GenerationNotFound {
        /// The generation ID that was not found.
        generation_id: String,
    },

    /// Task not found.
    #[error("task not found: {task_id}")]
    TaskNotFound {
        /// The task ID that was not found.
        task_id: String,
    },

    /// A generation state transition that the state machine does not allow.
    #[error("invalid generation transition from {from} via {transition}")]
    InvalidTransition {
        /// State the generation was in.
        from: GenerationStatus,
        /// Name of the rejected transition.
        transition: &'static str,
    },

    /// The image provider failed or returned an unusable response.
    #[error("provider failure: {0}")]
    ProviderFailure(String),

    /// The image provider did not answer within the configured bound.
    #[error("provider timed out after {seconds}s")]
    ProviderTimeout {
        /// The timeout that elapsed.
        seconds: u64,
    },

    /// A concurrent writer won a race on the same rows; retry the whole call.
    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// Invalid credit amount.
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// Request failed validation.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Invalid identifier.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl MarketError {
    /// Whether this error was raised by the provider boundary and must be
    /// settled as a failed generation rather than returned to the caller.
    #[must_use]
    pub const fn is_provider_error(&self) -> bool {
        matches!(self, Self::ProviderFailure(_) | Self::ProviderTimeout { .. })
    }
}
