//! fal.ai client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use avatarbank_core::GeneratedImage;

use super::{ImageProvider, PollStatus, ProviderError};
use crate::config::ProviderConfig;

/// Longest error body kept in a `ProviderError::Status`.
const MAX_ERROR_BODY: usize = 512;

/// fal.ai request payload.
#[derive(Debug, Serialize)]
struct FalRequest<'a> {
    prompt: &'a str,
    num_images: u32,
    enable_safety_checker: bool,
}

impl<'a> FalRequest<'a> {
    fn new(prompt: &'a str) -> Self {
        Self {
            prompt,
            num_images: 1,
            enable_safety_checker: true,
        }
    }
}

#[derive(Debug, Deserialize)]
struct FalImage {
    url: String,
}

/// fal.ai image result.
#[derive(Debug, Deserialize)]
struct FalResult {
    #[serde(default)]
    images: Vec<FalImage>,
    #[serde(default)]
    seed: Option<serde_json::Value>,
    #[serde(default)]
    has_nsfw_concepts: Vec<bool>,
}

impl FalResult {
    fn into_image(self) -> Result<GeneratedImage, ProviderError> {
        let image_url = self
            .images
            .into_iter()
            .next()
            .map(|image| image.url)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| ProviderError::MalformedResponse("response has no images".into()))?;

        let seed = match self.seed {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::String(s)) => Some(s),
            Some(other) => Some(other.to_string()),
        };

        Ok(GeneratedImage {
            image_url,
            seed,
            nsfw_flag: self.has_nsfw_concepts.iter().any(|flagged| *flagged),
        })
    }
}

#[derive(Debug, Deserialize)]
struct FalQueued {
    #[serde(default)]
    request_id: Option<String>,
    #[serde(default, rename = "requestId")]
    request_id_camel: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FalStatus {
    status: String,
    #[serde(default)]
    error: Option<String>,
}

/// fal.ai HTTP client.
#[derive(Debug, Clone)]
pub struct FalClient {
    client: Client,
    api_base_url: String,
    queue_base_url: String,
    model: String,
    api_key: Option<String>,
    timeout_seconds: u64,
}

impl FalClient {
    /// Create a client from provider settings.
    ///
    /// A missing API key is not an error here; every call then fails with
    /// `ProviderError::NotConfigured`, which settles as a refunded failure.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Http` if the HTTP client cannot be built.
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| ProviderError::Http(e.to_string()))?;

        Ok(Self {
            client,
            api_base_url: config.fal_api_base_url.trim_end_matches('/').to_string(),
            queue_base_url: config.fal_queue_base_url.trim_end_matches('/').to_string(),
            model: config.fal_model.trim_matches('/').to_string(),
            api_key: config.fal_api_key.clone().filter(|key| !key.is_empty()),
            timeout_seconds: config.timeout_seconds,
        })
    }

    fn sync_url(&self) -> String {
        format!("{}/{}", self.api_base_url, self.model)
    }

    fn queue_url(&self, suffix: &str) -> String {
        format!("{}/{}/queue{suffix}", self.queue_base_url, self.model)
    }

    fn authorization(&self) -> Result<String, ProviderError> {
        self.api_key
            .as_ref()
            .map(|key| format!("Key {key}"))
            .ok_or(ProviderError::NotConfigured)
    }

    fn transport_error(&self, err: &reqwest::Error) -> ProviderError {
        if err.is_timeout() {
            ProviderError::Timeout {
                seconds: self.timeout_seconds,
            }
        } else {
            ProviderError::Http(err.to_string())
        }
    }

    async fn get<T: DeserializeOwned>(&self, url: &str) -> Result<T, ProviderError> {
        let response = self
            .client
            .get(url)
            .header("Authorization", self.authorization()?)
            .send()
            .await
            .map_err(|e| self.transport_error(&e))?;
        self.handle_response(response).await
    }

    async fn post<T: DeserializeOwned>(&self, url: &str, prompt: &str) -> Result<T, ProviderError> {
        let response = self
            .client
            .post(url)
            .header("Authorization", self.authorization()?)
            .header("Content-Type", "application/json")
            .json(&FalRequest::new(prompt))
            .send()
            .await
            .map_err(|e| self.transport_error(&e))?;
        self.handle_response(response).await
    }

    async fn handle_response<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, ProviderError> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| self.transport_error(&e))?;

        if !status.is_success() {
            let mut body = body;
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_str(&body).map_err(|e| ProviderError::MalformedResponse(e.to_string()))
    }
}

#[async_trait]
impl ImageProvider for FalClient {
    async fn generate(&self, prompt: &str) -> Result<GeneratedImage, ProviderError> {
        tracing::debug!(model = %self.model, "Calling fal.ai");
        let result: FalResult = self.post(&self.sync_url(), prompt).await?;
        result.into_image()
    }

    async fn submit(&self, prompt: &str) -> Result<String, ProviderError> {
        let queued: FalQueued = self.post(&self.queue_url(""), prompt).await?;
        queued
            .request_id
            .or(queued.request_id_camel)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                ProviderError::MalformedResponse("queue response missing request_id".into())
            })
    }

    async fn poll(&self, request_id: &str) -> Result<PollStatus, ProviderError> {
        let status: FalStatus = self.get(&self.queue_url(&format!("/{request_id}"))).await?;

        match status.status.to_ascii_uppercase().as_str() {
            "IN_QUEUE" | "QUEUED" => Ok(PollStatus::Queued),
            "IN_PROGRESS" | "RUNNING" => Ok(PollStatus::InProgress),
            "COMPLETED" | "OK" => {
                let result: FalResult = self
                    .get(&self.queue_url(&format!("/{request_id}/result")))
                    .await?;
                result.into_image().map(PollStatus::Completed)
            }
            "FAILED" | "ERROR" | "CANCELLED" | "CANCELED" => Ok(PollStatus::Failed(
                status.error.unwrap_or_else(|| status.status.to_lowercase()),
            )),
            other => Err(ProviderError::MalformedResponse(format!(
                "unknown queue status: {other}"
            ))),
        }
    }
}
