//! Common test utilities for avatarbank integration tests.

#![allow(dead_code)] // Some utilities are used by different test files

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;
use axum_test::TestServer;
use serde_json::{json, Value};
use tempfile::TempDir;

use avatarbank_core::{Avatar, AvatarStatus, GeneratedImage, User, UserId, UserRole};
use avatarbank_service::crypto::hmac_sha256_hex;
use avatarbank_service::dispatch::{DispatchError, TaskDispatcher, TaskMessage};
use avatarbank_service::{
    create_router, spawn_workers, AppState, ChannelDispatcher, GenerationMode, ImageProvider,
    LocalDiskStorage, PollStatus, ProviderError, ServiceConfig,
};
use avatarbank_store::{MemoryStore, Store};

/// Email on the admin whitelist.
pub const ADMIN_EMAIL: &str = "ops@avatarbank.test";

/// Shared worker callback secret.
pub const WORKER_SECRET: &str = "worker-test-secret";

/// What the fake provider does with the next request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Behavior {
    /// Return an image.
    Succeed,
    /// Return an error with this message.
    Fail(String),
    /// Never answer.
    Hang,
}

/// Image provider whose behavior tests can switch at runtime.
pub struct FakeProvider {
    behavior: Mutex<Behavior>,
    calls: AtomicUsize,
}

impl FakeProvider {
    pub fn new(behavior: Behavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    /// Number of generate or submit calls seen.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn current(&self) -> Behavior {
        self.behavior.lock().unwrap().clone()
    }

    fn image(n: usize) -> GeneratedImage {
        GeneratedImage {
            image_url: format!("https://cdn.test/images/{n}.png"),
            seed: Some(n.to_string()),
            nsfw_flag: false,
        }
    }
}

#[async_trait]
impl ImageProvider for FakeProvider {
    async fn generate(&self, _prompt: &str) -> Result<GeneratedImage, ProviderError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        match self.current() {
            Behavior::Succeed => Ok(Self::image(n)),
            Behavior::Fail(msg) => Err(ProviderError::Failed(msg)),
            Behavior::Hang => std::future::pending().await,
        }
    }

    async fn submit(&self, _prompt: &str) -> Result<String, ProviderError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        match self.current() {
            Behavior::Fail(msg) => Err(ProviderError::Failed(msg)),
            Behavior::Succeed | Behavior::Hang => Ok(format!("req-{n}")),
        }
    }

    async fn poll(&self, request_id: &str) -> Result<PollStatus, ProviderError> {
        match self.current() {
            Behavior::Succeed => Ok(PollStatus::Completed(GeneratedImage {
                image_url: format!("https://cdn.test/queue/{request_id}.png"),
                seed: None,
                nsfw_flag: false,
            })),
            Behavior::Fail(msg) => Ok(PollStatus::Failed(msg)),
            Behavior::Hang => Ok(PollStatus::InProgress),
        }
    }
}

/// Dispatcher that only records tasks, leaving them for worker callbacks.
#[derive(Default)]
pub struct RecordingDispatcher {
    pub messages: Mutex<Vec<TaskMessage>>,
}

#[async_trait]
impl TaskDispatcher for RecordingDispatcher {
    async fn dispatch(&self, message: TaskMessage) -> Result<(), DispatchError> {
        self.messages.lock().unwrap().push(message);
        Ok(())
    }
}

/// How queued tasks are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Workers {
    /// Tasks stay queued until a test drives the worker callbacks.
    External,
    /// An in-process worker pool runs them against the fake provider.
    Local,
}

/// Test harness containing everything needed for integration tests.
pub struct TestHarness {
    /// The test server for making HTTP requests.
    pub server: TestServer,
    /// Direct store access for setup and assertions.
    pub store: Arc<MemoryStore>,
    /// The fake image provider.
    pub provider: Arc<FakeProvider>,
    /// Tasks handed to the recording dispatcher (external workers only).
    pub dispatched: Arc<RecordingDispatcher>,
    /// Media directory (kept alive for test duration).
    pub _media_dir: TempDir,
    /// A test user ID for authenticated requests.
    pub test_user_id: UserId,
    /// The admin's user ID.
    pub admin_id: UserId,
}

impl TestHarness {
    /// Sync mode with a provider that succeeds.
    pub fn new() -> Self {
        Self::build(GenerationMode::Sync, Workers::External, |_| {})
    }

    /// Async mode; tasks are driven through the worker callbacks.
    pub fn queued() -> Self {
        Self::build(GenerationMode::Async, Workers::External, |_| {})
    }

    /// Async mode with an in-process worker pool.
    pub fn with_local_workers() -> Self {
        Self::build(GenerationMode::Async, Workers::Local, |config| {
            config.provider.poll_interval_ms = 10;
        })
    }

    /// Build a harness, letting the caller adjust the config.
    pub fn build(
        mode: GenerationMode,
        workers: Workers,
        configure: impl FnOnce(&mut ServiceConfig),
    ) -> Self {
        let media_dir = TempDir::new().expect("Failed to create temp directory");
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(FakeProvider::new(Behavior::Succeed));
        let dispatched = Arc::new(RecordingDispatcher::default());

        let mut config = ServiceConfig {
            listen_addr: "127.0.0.1:0".into(),
            jwt_secret_key: "test-jwt-secret".into(),
            worker_hmac_secret: Some(WORKER_SECRET.into()),
            admin: avatarbank_service::config::AdminConfig::from_list(ADMIN_EMAIL),
            max_body_bytes: 1024 * 1024,
            request_timeout_seconds: 30,
            generation_mode: mode,
            media_dir: media_dir.path().to_string_lossy().to_string(),
            media_base_url: "/media".into(),
            ..ServiceConfig::default()
        };
        config.provider.fal_api_key = Some("test-key".into());
        config.provider.timeout_seconds = 5;
        configure(&mut config);

        let media = Arc::new(LocalDiskStorage::new(
            media_dir.path(),
            config.media_base_url.clone(),
        ));

        let state = match workers {
            Workers::External => AppState::new(
                store.clone(),
                config,
                provider.clone(),
                dispatched.clone(),
                media,
            ),
            Workers::Local => {
                let (dispatcher, receiver) = ChannelDispatcher::new(64);
                let state = AppState::new(
                    store.clone(),
                    config,
                    provider.clone(),
                    Arc::new(dispatcher),
                    media,
                );
                spawn_workers(2, receiver, Arc::clone(&state.settlement));
                state
            }
        };

        let router: Router = create_router(state);
        let server = TestServer::new(router).expect("Failed to create test server");

        Self {
            server,
            store,
            provider,
            dispatched,
            _media_dir: media_dir,
            test_user_id: UserId::generate(),
            admin_id: UserId::generate(),
        }
    }

    /// Get the authorization header for the test user.
    pub fn user_auth_header(&self) -> String {
        Self::auth_header_for(&self.test_user_id)
    }

    /// Authorization header for any user.
    pub fn auth_header_for(user_id: &UserId) -> String {
        format!("Bearer test-token:{user_id}")
    }

    /// Get a different user's auth header (for testing isolation).
    pub fn other_user_auth_header() -> String {
        Self::auth_header_for(&UserId::generate())
    }

    /// Authorization header for the whitelisted admin.
    pub fn admin_auth_header(&self) -> String {
        format!("Bearer test-token:{}:{ADMIN_EMAIL}", self.admin_id)
    }

    /// Register the test user through the API.
    pub async fn register(&self) {
        self.register_user(&self.test_user_id).await;
    }

    /// Register any user through the API.
    pub async fn register_user(&self, user_id: &UserId) {
        self.server
            .post("/v1/accounts")
            .add_header("authorization", Self::auth_header_for(user_id))
            .json(&json!({
                "email": format!("{user_id}@example.com"),
                "nickname": "tester",
            }))
            .await
            .assert_status(axum::http::StatusCode::CREATED);
    }

    /// Credit a user through the admin purchase endpoint.
    pub async fn fund(&self, user_id: &UserId, amount: i64) {
        self.server
            .post("/v1/admin/credits/purchase")
            .add_header("authorization", self.admin_auth_header())
            .json(&json!({ "user_id": user_id.to_string(), "amount": amount }))
            .await
            .assert_status_ok();
    }

    /// Register and fund the test user.
    pub async fn funded_user(&self, amount: i64) {
        self.register().await;
        if amount > 0 {
            self.fund(&self.test_user_id, amount).await;
        }
    }

    /// Create an influencer with one avatar in `status`, straight in the store.
    pub async fn seed_avatar(&self, price: i64, status: AvatarStatus) -> Avatar {
        let mut influencer = User::new(UserId::generate(), "creator@example.com", "creator");
        influencer.role = UserRole::Influencer;
        self.store.create_user(&influencer).await.unwrap();

        let mut avatar = Avatar::new(influencer.id, "Studio portrait", price);
        avatar.status = status;
        self.store.create_avatar(&avatar).await.unwrap();
        avatar
    }

    /// Submit a generation as the test user.
    pub async fn submit(&self, body: Value) -> axum_test::TestResponse {
        self.server
            .post("/v1/generations")
            .add_header("authorization", self.user_auth_header())
            .json(&body)
            .await
    }

    /// Current balance of the test user.
    pub async fn balance(&self) -> i64 {
        self.balance_of(&self.test_user_id).await
    }

    /// Current balance of any user, read from the store.
    pub async fn balance_of(&self, user_id: &UserId) -> i64 {
        self.store
            .get_user(user_id)
            .await
            .unwrap()
            .expect("user exists")
            .credit_balance
    }

    /// Sign a worker callback body.
    pub fn sign(body: &str) -> String {
        hmac_sha256_hex(WORKER_SECRET.as_bytes(), body.as_bytes()).unwrap()
    }

    /// Send a signed worker callback.
    pub async fn worker_call(&self, path: &str, body: Value) -> axum_test::TestResponse {
        let body = body.to_string();
        self.server
            .post(path)
            .add_header("x-worker-signature", Self::sign(&body))
            .add_header("content-type", "application/json")
            .bytes(body.into_bytes().into())
            .await
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    false
}
