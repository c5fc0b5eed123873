//! Avatarbank HTTP API Service.
//!
//! This crate provides the HTTP API for the avatar image marketplace,
//! including:
//!
//! - Accounts, balances and the credit ledger
//! - Avatar listing and influencer uploads
//! - Generation submission with up-front charge and exactly-once refund
//! - Admin credit adjustments, curation, cancellation and recovery
//! - Signed worker callbacks for the task queue
//!
//! # Authentication
//!
//! The service supports two authentication methods:
//!
//! 1. **JWT access tokens** - For buyers, influencers and admins
//! 2. **HMAC body signatures** - For worker callbacks

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
// Allow some pedantic lints that are noisy for Axum handler functions
#![allow(clippy::missing_errors_doc)] // Axum handlers all return Result
#![allow(clippy::unused_async)]

pub mod auth;
pub mod config;
pub mod crypto;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod media;
pub mod provider;
pub mod routes;
pub mod settlement;
pub mod state;

pub use config::{GenerationMode, ServiceConfig, StoreBackend};
pub use dispatch::{spawn_workers, ChannelDispatcher, TaskDispatcher, TaskMessage};
pub use error::ApiError;
pub use media::{LocalDiskStorage, MediaStorage};
pub use provider::{FalClient, ImageProvider, PollStatus, ProviderError};
pub use routes::create_router;
pub use settlement::{spawn_sweeper, Settlement};
pub use state::AppState;
