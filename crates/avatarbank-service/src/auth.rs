//! Authentication extractors.
//!
//! This module provides extractors for:
//! - `AuthUser` - End-user authentication via HMAC-signed JWT
//! - `AdminAuth` - An `AuthUser` whose email is in the admin whitelist
//! - `WorkerRequest` - A worker callback body signed with the worker secret

use std::str::FromStr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{FromRequest, FromRequestParts, Request};
use axum::http::request::Parts;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use avatarbank_core::UserId;

use crate::crypto::verify_signature;
use crate::error::ApiError;
use crate::state::AppState;

/// Header carrying the worker body signature.
pub const WORKER_SIGNATURE_HEADER: &str = "x-worker-signature";

/// An authenticated user extracted from a bearer JWT.
#[derive(Debug, Clone)]
pub struct AuthUser {
    /// The user ID.
    pub user_id: UserId,
    /// Email claim, when the token carries one.
    pub email: Option<String>,
}

impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ApiError;

    fn from_request_parts<'life0, 'life1, 'async_trait>(
        parts: &'life0 mut Parts,
        state: &'life1 Arc<AppState>,
    ) -> ::core::pin::Pin<
        Box<
            dyn ::core::future::Future<Output = Result<Self, Self::Rejection>>
                + ::core::marker::Send
                + 'async_trait,
        >,
    >
    where
        'life0: 'async_trait,
        'life1: 'async_trait,
        Self: 'async_trait,
    {
        Box::pin(async move {
            let auth_header = parts
                .headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .ok_or(ApiError::Unauthorized)?;

            let token = auth_header
                .strip_prefix("Bearer ")
                .ok_or(ApiError::Unauthorized)?;

            // Allow test tokens in testing only.
            // Format: `test-token:<user-id>` or `test-token:<user-id>:<email>`.
            #[cfg(any(test, feature = "test-auth"))]
            if let Some(rest) = token.strip_prefix("test-token:") {
                let (user_id_str, email) = match rest.split_once(':') {
                    Some((id, email)) => (id, Some(email.to_string())),
                    None => (rest, None),
                };
                let user_id = user_id_str
                    .parse::<UserId>()
                    .map_err(|_| ApiError::Unauthorized)?;

                return Ok(AuthUser { user_id, email });
            }

            let claims = validate_jwt(token, state)?;

            let user_id = claims
                .sub
                .parse::<UserId>()
                .map_err(|_| ApiError::Unauthorized)?;

            Ok(AuthUser {
                user_id,
                email: claims.email,
            })
        })
    }
}

/// Admin authentication.
///
/// The caller must present a valid user token and their email must be in
/// the configured whitelist. The email comes from the token's `email` claim,
/// falling back to the registered profile.
#[derive(Debug, Clone)]
pub struct AdminAuth {
    /// The admin's user ID.
    pub user_id: UserId,
    /// The whitelisted email (for audit logging).
    pub email: String,
}

impl FromRequestParts<Arc<AppState>> for AdminAuth {
    type Rejection = ApiError;

    fn from_request_parts<'life0, 'life1, 'async_trait>(
        parts: &'life0 mut Parts,
        state: &'life1 Arc<AppState>,
    ) -> ::core::pin::Pin<
        Box<
            dyn ::core::future::Future<Output = Result<Self, Self::Rejection>>
                + ::core::marker::Send
                + 'async_trait,
        >,
    >
    where
        'life0: 'async_trait,
        'life1: 'async_trait,
        Self: 'async_trait,
    {
        Box::pin(async move {
            let user = AuthUser::from_request_parts(parts, state).await?;

            let email = match user.email {
                Some(email) => email,
                None => state
                    .store
                    .get_user(&user.user_id)
                    .await?
                    .map(|profile| profile.email)
                    .ok_or(ApiError::Forbidden)?,
            };

            if !state.config.admin.is_admin(&email) {
                tracing::warn!(user_id = %user.user_id, "Admin access denied");
                return Err(ApiError::Forbidden);
            }

            tracing::info!(user_id = %user.user_id, admin_email = %email, "Admin authenticated");

            Ok(AdminAuth {
                user_id: user.user_id,
                email,
            })
        })
    }
}

/// A worker callback whose raw body carries a valid HMAC-SHA256 signature.
///
/// Rejects every request when no worker secret is configured.
#[derive(Debug, Clone)]
pub struct WorkerRequest<T>(pub T);

impl<T> FromRequest<Arc<AppState>> for WorkerRequest<T>
where
    T: DeserializeOwned + Send,
{
    type Rejection = ApiError;

    fn from_request<'life0, 'async_trait>(
        req: Request,
        state: &'life0 Arc<AppState>,
    ) -> ::core::pin::Pin<
        Box<
            dyn ::core::future::Future<Output = Result<Self, Self::Rejection>>
                + ::core::marker::Send
                + 'async_trait,
        >,
    >
    where
        'life0: 'async_trait,
        Self: 'async_trait,
    {
        Box::pin(async move {
            let signature = req
                .headers()
                .get(WORKER_SIGNATURE_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .ok_or(ApiError::Unauthorized)?;

            let secret = state
                .config
                .worker_hmac_secret
                .as_deref()
                .ok_or(ApiError::Unauthorized)?;

            let body = Bytes::from_request(req, state)
                .await
                .map_err(|e| ApiError::BadRequest(e.to_string()))?;

            if !verify_signature(secret, &body, &signature) {
                tracing::warn!("Worker callback signature mismatch");
                return Err(ApiError::Unauthorized);
            }

            let payload = if body.is_empty() {
                serde_json::from_slice(b"{}")
            } else {
                serde_json::from_slice(&body)
            }
            .map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {e}")))?;

            Ok(WorkerRequest(payload))
        })
    }
}

/// JWT claims for user access tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtClaims {
    /// Subject (user ID).
    pub sub: String,
    /// Email, if the issuer includes it.
    #[serde(default)]
    pub email: Option<String>,
    /// Token kind; only access tokens are accepted when present.
    #[serde(default, rename = "type")]
    pub token_type: Option<String>,
    /// Expiration time.
    pub exp: i64,
}

/// Validate an access token against the configured secret.
fn validate_jwt(token: &str, state: &AppState) -> Result<JwtClaims, ApiError> {
    let algorithm = Algorithm::from_str(&state.config.jwt_algorithm).map_err(|e| {
        tracing::error!(error = %e, algorithm = %state.config.jwt_algorithm, "Unsupported JWT algorithm");
        ApiError::Unauthorized
    })?;
    if !matches!(algorithm, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512) {
        tracing::error!(algorithm = ?algorithm, "Only HMAC JWT algorithms are supported");
        return Err(ApiError::Unauthorized);
    }

    let key = DecodingKey::from_secret(state.config.jwt_secret_key.as_bytes());
    let validation = Validation::new(algorithm);

    let token_data = decode::<JwtClaims>(token, &key, &validation).map_err(|e| {
        tracing::debug!(error = %e, "JWT validation failed");
        ApiError::Unauthorized
    })?;

    if token_data
        .claims
        .token_type
        .as_deref()
        .is_some_and(|kind| kind != "access")
    {
        return Err(ApiError::Unauthorized);
    }

    Ok(token_data.claims)
}
