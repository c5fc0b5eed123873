//! User types for avatarbank.
//!
//! A user carries the cached credit balance. The balance is a projection of
//! the user's ledger: it only ever changes together with a
//! [`CreditTransaction`](crate::CreditTransaction) written in the same commit.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::UserId;

/// Default locale for new users.
pub const DEFAULT_LOCALE: &str = "en";

/// Locales the frontend ships translations for.
pub const SUPPORTED_LOCALES: [&str; 3] = ["en", "ko", "ja"];

/// A registered marketplace user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// The user ID (token subject).
    pub id: UserId,

    /// Contact email, also used for the admin whitelist.
    pub email: String,

    /// Public display name.
    pub nickname: String,

    /// Marketplace role.
    pub role: UserRole,

    /// Account status. Only active users may transact.
    pub status: UserStatus,

    /// UI locale.
    pub locale: String,

    /// Current credit balance. Never negative.
    pub credit_balance: i64,

    /// When the user registered.
    pub created_at: DateTime<Utc>,

    /// When the user was last updated.
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Create a new active buyer with zero balance.
    #[must_use]
    pub fn new(id: UserId, email: impl Into<String>, nickname: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            email: email.into(),
            nickname: nickname.into(),
            role: UserRole::Buyer,
            status: UserStatus::Active,
            locale: DEFAULT_LOCALE.to_string(),
            credit_balance: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the user may take part in credit-affecting operations.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == UserStatus::Active
    }

    /// Credits the user may spend right now. Inactive users have none.
    #[must_use]
    pub fn spendable_credits(&self) -> i64 {
        if self.is_active() {
            self.credit_balance
        } else {
            0
        }
    }

    /// Check if the user can pay `amount` credits. Inactive users cannot
    /// transact at all, even for free.
    #[must_use]
    pub fn can_afford(&self, amount: i64) -> bool {
        self.is_active() && self.credit_balance >= amount
    }
}

/// Marketplace role of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    /// Buys credits and submits generations.
    Buyer,

    /// Owns avatars. Granted by an admin only.
    Influencer,

    /// Platform operator.
    Admin,
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Buyer => "buyer",
            Self::Influencer => "influencer",
            Self::Admin => "admin",
        })
    }
}

/// Status of a user account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    /// May transact.
    Active,

    /// Temporarily blocked by an admin.
    Suspended,

    /// Soft-deleted.
    Deleted,
}

impl fmt::Display for UserStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Deleted => "deleted",
        })
    }
}

impl std::str::FromStr for UserStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "suspended" => Ok(Self::Suspended),
            "deleted" => Ok(Self::Deleted),
            other => Err(format!("unknown user status: {other}")),
        }
    }
}

impl std::str::FromStr for UserRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buyer" => Ok(Self::Buyer),
            "influencer" => Ok(Self::Influencer),
            "admin" => Ok(Self::Admin),
            other => Err(format!("unknown user role: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_user_is_active_buyer_with_zero_balance() {
        let user = User::new(UserId::generate(), "a@example.com", "alice");
        assert_eq!(user.credit_balance, 0);
        assert_eq!(user.role, UserRole::Buyer);
        assert!(user.is_active());
        assert_eq!(user.locale, "en");
    }

    #[test]
    fn can_afford_is_inclusive() {
        let mut user = User::new(UserId::generate(), "a@example.com", "alice");
        user.credit_balance = 5;
        assert!(user.can_afford(5));
        assert!(!user.can_afford(6));
    }

    #[test]
    fn inactive_user_cannot_afford_anything() {
        let mut user = User::new(UserId::generate(), "a@example.com", "alice");
        user.status = UserStatus::Suspended;
        assert!(!user.can_afford(0));
        user.status = UserStatus::Active;
        assert!(user.can_afford(0));
    }

    #[test]
    fn suspended_user_has_nothing_to_spend() {
        let mut user = User::new(UserId::generate(), "a@example.com", "alice");
        user.credit_balance = 100;
        user.status = UserStatus::Suspended;
        assert_eq!(user.spendable_credits(), 0);
        assert!(!user.can_afford(1));
    }

    #[test]
    fn status_parses_from_wire_names() {
        assert_eq!("suspended".parse::<UserStatus>(), Ok(UserStatus::Suspended));
        assert!("frozen".parse::<UserStatus>().is_err());
        assert_eq!(UserRole::Influencer.to_string(), "influencer");
    }
}
