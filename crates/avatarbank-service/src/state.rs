//! Application state.

use std::sync::Arc;

use avatarbank_store::Store;

use crate::config::ServiceConfig;
use crate::dispatch::TaskDispatcher;
use crate::media::MediaStorage;
use crate::provider::ImageProvider;
use crate::settlement::Settlement;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// The storage backend.
    pub store: Arc<dyn Store>,

    /// Service configuration.
    pub config: ServiceConfig,

    /// Generation protocol.
    pub settlement: Arc<Settlement>,

    /// Uploaded file storage.
    pub media: Arc<dyn MediaStorage>,
}

impl AppState {
    /// Create a new application state.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        config: ServiceConfig,
        provider: Arc<dyn ImageProvider>,
        dispatcher: Arc<dyn TaskDispatcher>,
        media: Arc<dyn MediaStorage>,
    ) -> Self {
        let settlement = Arc::new(Settlement::new(
            Arc::clone(&store),
            provider,
            dispatcher,
            &config,
        ));

        if config.admin.whitelist.is_empty() {
            tracing::warn!("Admin whitelist is empty - admin endpoints are unreachable");
        }
        if config.worker_hmac_secret.is_none() {
            tracing::warn!("WORKER_HMAC_SECRET not set - worker callbacks are disabled");
        }

        Self {
            store,
            config,
            settlement,
            media,
        }
    }
}
