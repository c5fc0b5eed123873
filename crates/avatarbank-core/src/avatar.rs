//! Avatar types.
//!
//! An avatar is a licensed likeness owned by an influencer. Buyers attach an
//! avatar to a generation; the avatar's per-generation price is snapshotted
//! into the generation at submission time.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AvatarId, UserId};

/// Price of a generation against a newly created avatar, in credits.
pub const DEFAULT_CREDIT_PER_GENERATION: i64 = 1;

/// A licensed persona usable as a generation subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Avatar {
    /// Avatar ID.
    pub id: AvatarId,

    /// Owning influencer.
    pub influencer_id: UserId,

    /// Display title.
    pub title: String,

    /// Free-form description.
    pub description: Option<String>,

    /// Credits charged per generation against this avatar.
    pub credit_per_generation: i64,

    /// Whether NSFW output is permitted for this likeness.
    pub nsfw_allowed: bool,

    /// Preview image location in media storage.
    pub preview_image_url: Option<String>,

    /// Curation status.
    pub status: AvatarStatus,

    /// When the avatar was created.
    pub created_at: DateTime<Utc>,

    /// When the avatar was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Avatar {
    /// Create a new avatar awaiting review.
    #[must_use]
    pub fn new(influencer_id: UserId, title: impl Into<String>, credit_per_generation: i64) -> Self {
        let now = Utc::now();
        Self {
            id: AvatarId::generate(),
            influencer_id,
            title: title.into(),
            description: None,
            credit_per_generation,
            nsfw_allowed: false,
            preview_image_url: None,
            status: AvatarStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether buyers may submit generations against this avatar.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.status == AvatarStatus::Public
    }
}

/// Curation status of an avatar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AvatarStatus {
    /// Awaiting admin review.
    Pending,

    /// Listed and usable for generation.
    Public,

    /// Refused by an admin.
    Rejected,

    /// Withdrawn from the listing.
    Hidden,
}

impl fmt::Display for AvatarStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Public => "public",
            Self::Rejected => "rejected",
            Self::Hidden => "hidden",
        })
    }
}

impl std::str::FromStr for AvatarStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "public" => Ok(Self::Public),
            "rejected" => Ok(Self::Rejected),
            "hidden" => Ok(Self::Hidden),
            other => Err(format!("unknown avatar status: {other}")),
        }
    }
}
