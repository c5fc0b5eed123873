//! Router configuration.
//!
//! This module sets up the Axum router with all routes and middleware.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, patch, post, put};
use axum::Router;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{accounts, admin, avatars, credits, generations, health, worker};
use crate::state::AppState;

// ============================================================================
// Concurrency Limiting Constants
// ============================================================================

/// Maximum concurrent generation submissions. Each one may hold a provider
/// call open for the whole provider timeout in sync mode.
const GENERATION_MAX_CONCURRENT_REQUESTS: usize = 32;

/// Maximum concurrent requests for general API endpoints.
const API_MAX_CONCURRENT_REQUESTS: usize = 50;

/// Create the service router with all routes and middleware.
///
/// # Routes
///
/// ## Public
/// - `GET /health` - Health check
/// - `GET /v1/avatars` - List public avatars
/// - `GET /v1/avatars/:id` - Get a public avatar
///
/// ## Accounts and credits (JWT auth)
/// - `POST /v1/accounts` - Register profile
/// - `GET /v1/accounts/me` - Get current user's profile
/// - `GET /v1/credits/balance` - Get current balance
/// - `GET /v1/credits/transactions` - List transaction history
///
/// ## Avatars (JWT auth, influencers)
/// - `POST /v1/avatars` - Create avatar
/// - `PUT /v1/avatars/:id/preview` - Upload preview image
///
/// ## Generations (JWT auth)
/// - `POST /v1/generations` - Submit generation
/// - `GET /v1/generations/:id` - Get generation
/// - `POST /v1/generations/:id/cancel` - Cancel pending generation
/// - `GET /v1/generations/:id/tasks` - List tasks
/// - `GET /v1/my/generations` - List own generations
///
/// ## Admin (JWT auth, whitelisted email)
/// - `POST /v1/admin/credits/purchase` - Record purchase
/// - `POST /v1/admin/credits/payout` - Record payout
/// - `POST /v1/admin/influencers/approve` - Promote to influencer
/// - `PATCH /v1/admin/users/:id/status` - Change user status
/// - `GET /v1/admin/users/:id/ledger-audit` - Replay ledger
/// - `GET /v1/admin/avatars` - List avatars in any status
/// - `PATCH /v1/admin/avatars/:id/status` - Change avatar status
/// - `POST /v1/admin/generations/:id/cancel` - Cancel and refund
/// - `POST /v1/admin/sweep` - Refund stale generations now
///
/// ## Workers (HMAC-signed body)
/// - `POST /v1/worker/tasks/:id/start`
/// - `POST /v1/worker/tasks/:id/complete`
/// - `POST /v1/worker/tasks/:id/fail`
pub fn create_router(state: AppState) -> Router {
    // Extract config values before moving state
    let cors_origins = state.config.cors_origins.clone();
    let max_body_bytes = state.config.max_body_bytes;
    let request_timeout_seconds = state.config.request_timeout_seconds;

    let cors = build_cors_layer(&cors_origins);

    let state = Arc::new(state);

    let generation_routes = Router::new()
        .route("/", post(generations::create_generation))
        .route("/:id", get(generations::get_generation))
        .route("/:id/cancel", post(generations::cancel_generation))
        .route("/:id/tasks", get(generations::list_generation_tasks))
        .layer(ConcurrencyLimitLayer::new(GENERATION_MAX_CONCURRENT_REQUESTS));

    let admin_routes = Router::new()
        .route("/credits/purchase", post(admin::record_purchase))
        .route("/credits/payout", post(admin::record_payout))
        .route("/influencers/approve", post(admin::approve_influencer))
        .route("/users/:id/status", patch(admin::set_user_status))
        .route("/users/:id/ledger-audit", get(admin::ledger_audit))
        .route("/avatars", get(admin::list_avatars))
        .route("/avatars/:id/status", patch(admin::set_avatar_status))
        .route("/generations/:id/cancel", post(admin::cancel_generation))
        .route("/sweep", post(admin::sweep));

    let worker_routes = Router::new()
        .route("/tasks/:id/start", post(worker::start_task))
        .route("/tasks/:id/complete", post(worker::complete_task))
        .route("/tasks/:id/fail", post(worker::fail_task));

    let api_routes = Router::new()
        // Accounts
        .route("/accounts", post(accounts::create_account))
        .route("/accounts/me", get(accounts::get_account))
        // Credits
        .route("/credits/balance", get(credits::get_balance))
        .route("/credits/transactions", get(credits::list_transactions))
        // Avatars
        .route(
            "/avatars",
            get(avatars::list_avatars).post(avatars::create_avatar),
        )
        .route("/avatars/:id", get(avatars::get_avatar))
        .route("/avatars/:id/preview", put(avatars::upload_preview))
        // Generations
        .nest("/generations", generation_routes)
        .route("/my/generations", get(generations::list_my_generations))
        .nest("/admin", admin_routes)
        .layer(ConcurrencyLimitLayer::new(API_MAX_CONCURRENT_REQUESTS));

    Router::new()
        // Health (public, no rate limit)
        .route("/health", get(health::health))
        .nest("/v1", api_routes)
        // Worker callbacks (no rate limit, controlled by the worker fleet)
        .nest("/v1/worker", worker_routes)
        // Global middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TimeoutLayer::new(Duration::from_secs(
            request_timeout_seconds,
        )))
        .with_state(state)
}

/// Build the CORS layer from configured origins.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
