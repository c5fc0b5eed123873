//! Avatarbank HTTP client implementation.

use reqwest::{Client, RequestBuilder, StatusCode};
use std::time::Duration;

use avatarbank_core::{AvatarId, GenerationId};

use crate::error::ClientError;
use crate::types::{
    ApiErrorResponse, Avatar, AvatarPage, BalanceResponse, CreateGeneration, Generation,
    GenerationPage, Submission, TransactionPage,
};

/// Avatarbank API client acting for one user.
#[derive(Debug, Clone)]
pub struct AvatarbankClient {
    client: Client,
    base_url: String,
    token: String,
}

impl AvatarbankClient {
    /// Create a new client.
    ///
    /// # Arguments
    ///
    /// * `base_url` - Base URL of the avatarbank service (e.g., `"http://avatarbank:8080"`)
    /// * `token` - The user's access token
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Configuration` if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self, ClientError> {
        Self::with_options(base_url, token, &ClientOptions::default())
    }

    /// Create a new client with custom options.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Configuration` if the token is empty or the HTTP
    /// client cannot be built.
    pub fn with_options(
        base_url: impl Into<String>,
        token: impl Into<String>,
        options: &ClientOptions,
    ) -> Result<Self, ClientError> {
        let token = token.into();
        if token.is_empty() {
            return Err(ClientError::Configuration("access token is empty".into()));
        }

        Ok(Self {
            client: build_http_client(options)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1{path}", self.base_url)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.header("authorization", format!("Bearer {}", self.token))
    }

    /// Get the current credit balance.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn get_balance(&self) -> Result<BalanceResponse, ClientError> {
        let request = self.client.get(self.url("/credits/balance"));
        let response = self.authorized(request).send().await?;
        handle_response(response).await
    }

    /// List ledger entries, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn list_transactions(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<TransactionPage, ClientError> {
        let request = self
            .client
            .get(self.url("/credits/transactions"))
            .query(&[("limit", limit), ("offset", offset)]);
        let response = self.authorized(request).send().await?;
        handle_response(response).await
    }

    /// List active avatars.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn list_avatars(&self, limit: usize, offset: usize) -> Result<AvatarPage, ClientError> {
        let request = self
            .client
            .get(self.url("/avatars"))
            .query(&[("limit", limit), ("offset", offset)]);
        let response = self.authorized(request).send().await?;
        handle_response(response).await
    }

    /// Get one avatar.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn get_avatar(&self, avatar_id: &AvatarId) -> Result<Avatar, ClientError> {
        let request = self.client.get(self.url(&format!("/avatars/{avatar_id}")));
        let response = self.authorized(request).send().await?;
        handle_response(response).await
    }

    /// Submit a generation.
    ///
    /// The credits are charged before the call returns. A provider failure is
    /// not an error: the generation comes back `failed` and already refunded.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::InsufficientCredits` if the balance cannot cover
    /// the price, or another error if the request fails.
    pub async fn create_generation(
        &self,
        submission: &CreateGeneration,
    ) -> Result<Submission, ClientError> {
        let mut request = self.client.post(self.url("/generations")).json(submission);
        if let Some(key) = &submission.idempotency_key {
            request = request.header("idempotency-key", key);
        }
        let response = self.authorized(request).send().await?;

        let replayed = response.status() == StatusCode::OK;
        let generation: Generation = handle_response(response).await?;
        tracing::debug!(generation_id = %generation.id, replayed, "Generation submitted");

        Ok(Submission {
            generation,
            replayed,
        })
    }

    /// Get one of the user's generations.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn get_generation(
        &self,
        generation_id: &GenerationId,
    ) -> Result<Generation, ClientError> {
        let request = self
            .client
            .get(self.url(&format!("/generations/{generation_id}")));
        let response = self.authorized(request).send().await?;
        handle_response(response).await
    }

    /// List the user's generations, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn list_generations(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<GenerationPage, ClientError> {
        let request = self
            .client
            .get(self.url("/my/generations"))
            .query(&[("limit", limit), ("offset", offset)]);
        let response = self.authorized(request).send().await?;
        handle_response(response).await
    }

    /// Cancel a generation that has not been picked up yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the generation already has an
    /// outcome.
    pub async fn cancel_generation(
        &self,
        generation_id: &GenerationId,
    ) -> Result<Generation, ClientError> {
        let request = self
            .client
            .post(self.url(&format!("/generations/{generation_id}/cancel")));
        let response = self.authorized(request).send().await?;
        handle_response(response).await
    }
}

/// Client options for customization.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Request timeout in seconds (default: 150).
    ///
    /// Synchronous generations hold the request open for the provider call,
    /// so this sits above the provider's own bound.
    pub timeout_seconds: u64,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout_seconds: 150,
        }
    }
}

pub(crate) fn build_http_client(options: &ClientOptions) -> Result<Client, ClientError> {
    Client::builder()
        .timeout(Duration::from_secs(options.timeout_seconds))
        .build()
        .map_err(|e| ClientError::Configuration(e.to_string()))
}

/// Decode a success body or map the API error envelope to a typed error.
pub(crate) async fn handle_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ClientError> {
    let status = response.status();

    if status.is_success() {
        let body = response.bytes().await?;
        return Ok(serde_json::from_slice(&body)?);
    }

    let error_body: Result<ApiErrorResponse, _> = response.json().await;

    match error_body {
        Ok(api_error) => {
            let details = api_error.error.details.as_ref();
            let detail_i64 = |key: &str| {
                details
                    .and_then(|d| d.get(key))
                    .and_then(serde_json::Value::as_i64)
                    .unwrap_or(0)
            };

            match api_error.error.code.as_str() {
                "insufficient_credits" => Err(ClientError::InsufficientCredits {
                    balance: detail_i64("balance"),
                    required: detail_i64("required"),
                }),
                "avatar_not_found" => Err(ClientError::AvatarNotFound {
                    avatar_id: details
                        .and_then(|d| d.get("avatar_id"))
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                }),
                "concurrency_conflict" => {
                    Err(ClientError::ConcurrencyConflict(api_error.error.message))
                }
                code => Err(ClientError::Api {
                    code: code.to_string(),
                    message: api_error.error.message,
                    status: status.as_u16(),
                }),
            }
        }
        Err(_) => Err(ClientError::Api {
            code: "unknown".to_string(),
            message: format!("HTTP {status}"),
            status: status.as_u16(),
        }),
    }
}
