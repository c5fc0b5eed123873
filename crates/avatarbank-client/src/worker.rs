//! Signed task callbacks for out-of-process workers.

use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Serialize;
use sha2::Sha256;

use avatarbank_core::TaskId;

use crate::client::{build_http_client, handle_response, ClientOptions};
use crate::error::ClientError;
use crate::types::{CompletedImage, TaskReport};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the body signature.
const SIGNATURE_HEADER: &str = "x-worker-signature";

/// Client for the `/v1/worker` callback routes.
///
/// Every body is signed with HMAC-SHA256 under the shared worker secret.
#[derive(Clone)]
pub struct WorkerClient {
    client: Client,
    base_url: String,
    worker_id: String,
    secret: Vec<u8>,
}

impl std::fmt::Debug for WorkerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerClient")
            .field("base_url", &self.base_url)
            .field("worker_id", &self.worker_id)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct StartBody<'a> {
    worker_id: &'a str,
}

#[derive(Serialize)]
struct FailBody<'a> {
    error: &'a str,
}

impl WorkerClient {
    /// Create a worker client.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Configuration` if the secret is empty or the HTTP
    /// client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        worker_id: impl Into<String>,
        secret: impl AsRef<[u8]>,
    ) -> Result<Self, ClientError> {
        let secret = secret.as_ref().to_vec();
        if secret.is_empty() {
            return Err(ClientError::Configuration("worker secret is empty".into()));
        }

        Ok(Self {
            client: build_http_client(&ClientOptions::default())?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            worker_id: worker_id.into(),
            secret,
        })
    }

    /// Hex HMAC-SHA256 of `body`.
    fn sign(&self, body: &[u8]) -> Result<String, ClientError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| ClientError::Configuration(e.to_string()))?;
        mac.update(body);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    async fn call<B: Serialize>(
        &self,
        task_id: &TaskId,
        action: &str,
        body: &B,
    ) -> Result<TaskReport, ClientError> {
        let body = serde_json::to_vec(body)?;
        let signature = self.sign(&body)?;

        let response = self
            .client
            .post(format!(
                "{}/v1/worker/tasks/{task_id}/{action}",
                self.base_url
            ))
            .header("content-type", "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(body)
            .send()
            .await?;

        handle_response(response).await
    }

    /// Claim a task.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the task is no longer pending.
    pub async fn start(&self, task_id: &TaskId) -> Result<TaskReport, ClientError> {
        tracing::debug!(task_id = %task_id, worker_id = %self.worker_id, "Starting task");
        self.call(
            task_id,
            "start",
            &StartBody {
                worker_id: &self.worker_id,
            },
        )
        .await
    }

    /// Report a produced image.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server rejects the report.
    pub async fn complete(
        &self,
        task_id: &TaskId,
        image: &CompletedImage,
    ) -> Result<TaskReport, ClientError> {
        self.call(task_id, "complete", image).await
    }

    /// Report a failure. The server either queues a retry or settles the
    /// generation as failed and refunds it.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server rejects the report.
    pub async fn fail(&self, task_id: &TaskId, error: &str) -> Result<TaskReport, ClientError> {
        tracing::debug!(task_id = %task_id, error, "Reporting task failure");
        self.call(task_id, "fail", &FailBody { error }).await
    }
}
