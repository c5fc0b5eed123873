//! Credit ledger types.
//!
//! Every change to a user's balance appends a [`CreditTransaction`] carrying
//! both the balance before and after the change. The snapshots make the
//! ledger auditable entry by entry without replaying from the start, and
//! [`verify_ledger`] replays it anyway to check the cached balance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{GenerationId, TransactionId, UserId};

/// A credit transaction representing a balance change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditTransaction {
    /// Unique transaction ID (ULID for time-ordering).
    pub id: TransactionId,

    /// The user whose balance was affected.
    pub user_id: UserId,

    /// Type of transaction.
    pub transaction_type: TransactionType,

    /// Signed amount in credits. Positive = credit, negative = debit.
    pub amount: i64,

    /// Balance immediately before this entry.
    pub credit_before: i64,

    /// Balance immediately after this entry.
    pub credit_after: i64,

    /// Entity this entry belongs to (the generation for debits and refunds).
    pub reference_id: Option<String>,

    /// Human-readable description.
    pub description: String,

    /// When the transaction was created.
    pub created_at: DateTime<Utc>,
}

impl CreditTransaction {
    fn new(
        user_id: UserId,
        transaction_type: TransactionType,
        amount: i64,
        credit_before: i64,
        reference_id: Option<String>,
        description: String,
    ) -> Self {
        Self {
            id: TransactionId::generate(),
            user_id,
            transaction_type,
            amount,
            credit_before,
            credit_after: credit_before + amount,
            reference_id,
            description,
            created_at: Utc::now(),
        }
    }

    /// Credits bought by the user (recorded by an admin).
    #[must_use]
    pub fn purchase(user_id: UserId, amount: i64, credit_before: i64, description: String) -> Self {
        Self::new(
            user_id,
            TransactionType::Purchase,
            amount.abs(),
            credit_before,
            None,
            description,
        )
    }

    /// Reservation debit for a generation.
    #[must_use]
    pub fn generation(
        user_id: UserId,
        generation_id: GenerationId,
        amount: i64,
        credit_before: i64,
    ) -> Self {
        Self::new(
            user_id,
            TransactionType::Generation,
            -amount.abs(), // Always negative for generations
            credit_before,
            Some(generation_id.to_string()),
            format!("Generation {generation_id}"),
        )
    }

    /// Refund of a failed or canceled generation.
    #[must_use]
    pub fn refund(
        user_id: UserId,
        generation_id: GenerationId,
        amount: i64,
        credit_before: i64,
        reason: &str,
    ) -> Self {
        Self::new(
            user_id,
            TransactionType::Refund,
            amount.abs(),
            credit_before,
            Some(generation_id.to_string()),
            format!("Refund for generation {generation_id}: {reason}"),
        )
    }

    /// Credits paid out to an influencer (recorded by an admin).
    #[must_use]
    pub fn payout(
        user_id: UserId,
        amount: i64,
        credit_before: i64,
        payout_reference: Option<String>,
        description: String,
    ) -> Self {
        Self::new(
            user_id,
            TransactionType::Payout,
            -amount.abs(),
            credit_before,
            payout_reference,
            description,
        )
    }
}

/// Type of credit transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    /// User purchased credits.
    Purchase,

    /// Credits reserved for a generation.
    Generation,

    /// Generation credits returned.
    Refund,

    /// Credits paid out to an influencer.
    Payout,
}

impl TransactionType {
    /// Check if this transaction type adds credits.
    #[must_use]
    pub const fn is_credit(&self) -> bool {
        matches!(self, Self::Purchase | Self::Refund)
    }

    /// Check if this transaction type removes credits.
    #[must_use]
    pub const fn is_debit(&self) -> bool {
        matches!(self, Self::Generation | Self::Payout)
    }

    /// Wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Purchase => "purchase",
            Self::Generation => "generation",
            Self::Refund => "refund",
            Self::Payout => "payout",
        }
    }
}

impl std::str::FromStr for TransactionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "purchase" => Ok(Self::Purchase),
            "generation" => Ok(Self::Generation),
            "refund" => Ok(Self::Refund),
            "payout" => Ok(Self::Payout),
            other => Err(format!("unknown transaction type: {other}")),
        }
    }
}

/// A break in a user's ledger found by [`verify_ledger`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerViolation {
    /// An entry does not start where the previous one ended.
    #[error("entry {id}: credit_before={credit_before}, expected {expected}")]
    BrokenChain {
        /// Offending entry.
        id: TransactionId,
        /// Recorded opening balance.
        credit_before: i64,
        /// Closing balance of the previous entry.
        expected: i64,
    },

    /// An entry's snapshots disagree with its amount.
    #[error("entry {id}: {credit_before} + {amount} != {credit_after}")]
    BadArithmetic {
        /// Offending entry.
        id: TransactionId,
        /// Recorded opening balance.
        credit_before: i64,
        /// Signed amount.
        amount: i64,
        /// Recorded closing balance.
        credit_after: i64,
    },

    /// An entry's sign does not match its type.
    #[error("entry {id}: amount {amount} has the wrong sign for {transaction_type:?}")]
    WrongSign {
        /// Offending entry.
        id: TransactionId,
        /// Entry type.
        transaction_type: TransactionType,
        /// Signed amount.
        amount: i64,
    },

    /// The balance went below zero at some point.
    #[error("entry {id}: balance went negative ({credit_after})")]
    NegativeBalance {
        /// Offending entry.
        id: TransactionId,
        /// Closing balance.
        credit_after: i64,
    },

    /// The replayed total does not match the cached balance.
    #[error("replayed balance {replayed} does not match cached balance {cached}")]
    BalanceMismatch {
        /// Sum of all amounts.
        replayed: i64,
        /// Balance stored on the user.
        cached: i64,
    },
}

/// Replay a user's ledger in creation order and compare it to the cached
/// balance. Entries must be sorted oldest first.
///
/// # Errors
///
/// Returns the first [`LedgerViolation`] encountered.
pub fn verify_ledger(entries: &[CreditTransaction], cached_balance: i64) -> Result<i64, LedgerViolation> {
    let mut running = 0_i64;

    for entry in entries {
        if entry.credit_before != running {
            return Err(LedgerViolation::BrokenChain {
                id: entry.id,
                credit_before: entry.credit_before,
                expected: running,
            });
        }
        if entry.credit_before + entry.amount != entry.credit_after {
            return Err(LedgerViolation::BadArithmetic {
                id: entry.id,
                credit_before: entry.credit_before,
                amount: entry.amount,
                credit_after: entry.credit_after,
            });
        }
        let sign_ok = (entry.transaction_type.is_credit() && entry.amount > 0)
            || (entry.transaction_type.is_debit() && entry.amount < 0);
        if !sign_ok {
            return Err(LedgerViolation::WrongSign {
                id: entry.id,
                transaction_type: entry.transaction_type,
                amount: entry.amount,
            });
        }
        if entry.credit_after < 0 {
            return Err(LedgerViolation::NegativeBalance {
                id: entry.id,
                credit_after: entry.credit_after,
            });
        }
        running = entry.credit_after;
    }

    if running != cached_balance {
        return Err(LedgerViolation::BalanceMismatch {
            replayed: running,
            cached: cached_balance,
        });
    }

    Ok(running)
}
