//! Avatarbank Client SDK.
//!
//! Two clients cover the two callers of the avatarbank API:
//!
//! - [`AvatarbankClient`] acts for a signed-in user (balance, history,
//!   avatars, generations) with that user's bearer token.
//! - [`WorkerClient`] is used by out-of-process generation workers to report
//!   task progress through the HMAC-signed callback routes.
//!
//! # Example
//!
//! ```no_run
//! use avatarbank_client::{AvatarbankClient, CreateGeneration};
//!
//! # async fn example() -> Result<(), avatarbank_client::ClientError> {
//! let client = AvatarbankClient::new("http://avatarbank:8080", "user-jwt")?;
//!
//! let submission = client
//!     .create_generation(&CreateGeneration::new("portrait at golden hour"))
//!     .await?;
//!
//! println!(
//!     "{} charged {} credits",
//!     submission.generation.id, submission.generation.credits_used
//! );
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod client;
mod error;
mod types;
mod worker;

pub use client::{AvatarbankClient, ClientOptions};
pub use error::ClientError;
pub use types::*;
pub use worker::WorkerClient;
