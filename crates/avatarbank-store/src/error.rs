//! Error types for avatarbank storage.

use avatarbank_core::GenerationStatus;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Record not found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of record.
        entity: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// Record already exists.
    #[error("{entity} already exists: {id}")]
    AlreadyExists {
        /// Kind of record.
        entity: &'static str,
        /// Conflicting identifier.
        id: String,
    },

    /// Insufficient credits for deduction.
    #[error("insufficient credits: balance={balance}, required={required}")]
    InsufficientCredits {
        /// Spendable balance in credits.
        balance: i64,
        /// Required amount in credits.
        required: i64,
    },

    /// The generation state machine rejected the transition.
    #[error("invalid generation transition from {from} via {transition}")]
    InvalidTransition {
        /// State the generation was in.
        from: GenerationStatus,
        /// Name of the rejected transition.
        transition: &'static str,
    },

    /// A concurrent writer won; nothing was committed.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl StoreError {
    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

impl From<avatarbank_core::MarketError> for StoreError {
    fn from(err: avatarbank_core::MarketError) -> Self {
        match err {
            avatarbank_core::MarketError::InvalidTransition { from, transition } => {
                Self::InvalidTransition { from, transition }
            }
            avatarbank_core::MarketError::InsufficientCredits { balance, required } => {
                Self::InsufficientCredits { balance, required }
            }
            other => Self::Database(other.to_string()),
        }
    }
}

impl From<StoreError> for avatarbank_core::MarketError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InsufficientCredits { balance, required } => {
                Self::InsufficientCredits { balance, required }
            }
            StoreError::InvalidTransition { from, transition } => {
                Self::InvalidTransition { from, transition }
            }
            StoreError::NotFound { entity: "user", id } => Self::UserNotFound { user_id: id },
            StoreError::NotFound {
                entity: "generation",
                id,
            } => Self::GenerationNotFound { generation_id: id },
            StoreError::NotFound { entity: "task", id } => Self::TaskNotFound { task_id: id },
            StoreError::NotFound { entity: "avatar", id } => Self::AvatarNotFound { avatar_id: id },
            StoreError::AlreadyExists { entity: "user", id } => {
                Self::UserAlreadyExists { user_id: id }
            }
            StoreError::Conflict(msg) => Self::ConcurrencyConflict(msg),
            other => Self::Storage(other.to_string()),
        }
    }
}
