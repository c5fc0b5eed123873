//! Client error types.

/// Errors that can occur when using the avatarbank client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server returned an error response.
    #[error("API error: {code} - {message}")]
    Api {
        /// Error code.
        code: String,
        /// Error message.
        message: String,
        /// HTTP status code.
        status: u16,
    },

    /// The user cannot cover the price.
    #[error("insufficient credits: balance={balance}, required={required}")]
    InsufficientCredits {
        /// Spendable balance.
        balance: i64,
        /// Required amount.
        required: i64,
    },

    /// The avatar does not exist or is not available.
    #[error("avatar not found: {avatar_id}")]
    AvatarNotFound {
        /// The avatar ID as sent.
        avatar_id: String,
    },

    /// A concurrent request on the same account won; safe to retry.
    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl ClientError {
    /// Whether repeating the same call may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConcurrencyConflict(_) => true,
            Self::Http(err) => err.is_timeout() || err.is_connect(),
            Self::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
