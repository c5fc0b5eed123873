//! Avatarbank Service - HTTP API for the avatar image marketplace
//!
//! This is the main entry point for the avatarbank service.

use std::sync::Arc;
use std::time::Duration;

use tower_http::services::ServeDir;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use avatarbank_service::dispatch::DEFAULT_QUEUE_CAPACITY;
use avatarbank_service::{
    create_router, spawn_sweeper, spawn_workers, AppState, ChannelDispatcher, FalClient,
    GenerationMode, LocalDiskStorage, ServiceConfig, StoreBackend,
};
use avatarbank_store::{MemoryStore, PgStore, Store};

/// Connections held by the PostgreSQL pool.
const PG_MAX_CONNECTIONS: u32 = 16;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,avatarbank=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Avatarbank Service");

    // Load configuration from environment
    let config = ServiceConfig::from_env()?;

    tracing::info!(
        listen_addr = %config.listen_addr,
        store_backend = ?config.store_backend,
        generation_mode = ?config.generation_mode,
        fal_configured = %config.provider.fal_api_key.is_some(),
        fal_model = %config.provider.fal_model,
        admins = config.admin.whitelist.len(),
        "Service configuration loaded"
    );

    let store = open_store(&config).await?;

    let provider = Arc::new(FalClient::new(&config.provider)?);
    let media = Arc::new(LocalDiskStorage::new(
        &config.media_dir,
        &config.media_base_url,
    ));

    // Retries enqueue tasks in either mode.
    let (dispatcher, receiver) = ChannelDispatcher::new(DEFAULT_QUEUE_CAPACITY);
    let state = AppState::new(
        store,
        config.clone(),
        provider,
        Arc::new(dispatcher),
        media,
    );

    let workers = spawn_workers(config.worker_count, receiver, Arc::clone(&state.settlement));
    if config.generation_mode == GenerationMode::Async {
        tracing::info!(workers = workers.len(), "Task workers started");
    }

    if let Some(seconds) = config.sweep_interval_seconds {
        tracing::info!(interval_seconds = seconds, "Stale sweep enabled");
        spawn_sweeper(Arc::clone(&state.settlement), Duration::from_secs(seconds));
    }

    // Create the router
    let mut app = create_router(state);
    if config.media_base_url.starts_with('/') {
        app = app.nest_service(&config.media_base_url, ServeDir::new(&config.media_dir));
    }
    tracing::info!("Router configured with all API endpoints");

    // Start HTTP server
    tracing::info!(listen_addr = %config.listen_addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Open the configured storage backend.
async fn open_store(config: &ServiceConfig) -> Result<Arc<dyn Store>, Box<dyn std::error::Error>> {
    match config.store_backend {
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory store - data is lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .ok_or("DATABASE_URL is required for the postgres backend")?;
            let store = PgStore::connect(url, PG_MAX_CONNECTIONS).await?;
            store.migrate().await?;
            tracing::info!("PostgreSQL store ready");
            Ok(Arc::new(store))
        }
        #[cfg(feature = "rocksdb-backend")]
        StoreBackend::RocksDb => {
            tracing::info!(path = %config.data_dir, "Opening RocksDB store");
            Ok(Arc::new(avatarbank_store::RocksStore::open(&config.data_dir)?))
        }
        #[cfg(not(feature = "rocksdb-backend"))]
        StoreBackend::RocksDb => {
            Err("this build does not include the rocksdb backend (feature rocksdb-backend)".into())
        }
    }
}
