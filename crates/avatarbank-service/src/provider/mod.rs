//! Image provider boundary.
//!
//! A provider either answers inline ([`ImageProvider::generate`]) or accepts
//! a queued request ([`ImageProvider::submit`]) that is then polled until it
//! completes. Every error is folded by the caller into a failed generation
//! plus refund.

mod fal;

pub use fal::FalClient;

use async_trait::async_trait;

use avatarbank_core::{GeneratedImage, MarketError};

/// Errors raised at the provider boundary.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// No API key is configured.
    #[error("FAL_API_KEY is not configured")]
    NotConfigured,

    /// Transport-level failure.
    #[error("provider request failed: {0}")]
    Http(String),

    /// Non-success HTTP status.
    #[error("provider returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },

    /// The response did not have the expected shape.
    #[error("malformed provider response: {0}")]
    MalformedResponse(String),

    /// The provider did not answer within the bound.
    #[error("provider timed out after {seconds}s")]
    Timeout {
        /// The bound that elapsed.
        seconds: u64,
    },

    /// A queued request finished unsuccessfully.
    #[error("provider reported failure: {0}")]
    Failed(String),
}

impl From<ProviderError> for MarketError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Timeout { seconds } => Self::ProviderTimeout { seconds },
            other => Self::ProviderFailure(other.to_string()),
        }
    }
}

/// State of a queued request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    /// Accepted, not started.
    Queued,
    /// Running at the provider.
    InProgress,
    /// Finished with an image.
    Completed(GeneratedImage),
    /// Finished without an image.
    Failed(String),
}

impl PollStatus {
    /// Whether polling can stop.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed(_) | Self::Failed(_))
    }
}

/// An external image generation service.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    /// Generate one image inline.
    async fn generate(&self, prompt: &str) -> Result<GeneratedImage, ProviderError>;

    /// Queue one image, returning the provider's request ID.
    async fn submit(&self, prompt: &str) -> Result<String, ProviderError>;

    /// Check a queued request.
    async fn poll(&self, request_id: &str) -> Result<PollStatus, ProviderError>;
}
