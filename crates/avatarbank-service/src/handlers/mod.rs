//! API handlers.

use std::str::FromStr;

use serde::Deserialize;

use crate::error::ApiError;

pub mod accounts;
pub mod admin;
pub mod avatars;
pub mod credits;
pub mod generations;
pub mod health;
pub mod worker;

/// Largest page any list endpoint returns.
const MAX_PAGE_SIZE: usize = 100;

/// Pagination query parameters.
#[derive(Debug, Deserialize)]
pub struct PageQuery {
    /// Maximum number of items to return (default: 50, max: 100).
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Offset for pagination (default: 0).
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    50
}

impl PageQuery {
    /// The effective page size.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit.clamp(1, MAX_PAGE_SIZE)
    }
}

/// Split a fetched page of `limit + 1` items into the page and a `has_more` flag.
pub(crate) fn paginate<T>(mut items: Vec<T>, limit: usize) -> (Vec<T>, bool) {
    let has_more = items.len() > limit;
    items.truncate(limit);
    (items, has_more)
}

/// Parse an identifier from a path segment.
pub(crate) fn parse_id<T: FromStr>(raw: &str, what: &str) -> Result<T, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid {what} ID: {raw}")))
}
