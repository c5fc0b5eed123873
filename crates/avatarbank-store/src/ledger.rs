//! Backend-independent planning for the compound operations.
//!
//! Each backend loads the records under its own lock or transaction, runs
//! these functions to compute the new records, then writes them in one
//! commit. Nothing here touches storage.

use chrono::Utc;

use avatarbank_core::{CreditTransaction, Generation, LedgerEffect, Transition, User};

use crate::error::{Result, StoreError};

/// Records to write for a new reservation.
pub(crate) struct DebitPlan {
    pub buyer: User,
    pub debit: CreditTransaction,
}

/// Check the buyer can pay for `generation` and build the debit.
pub(crate) fn plan_debit(buyer: &User, generation: &Generation) -> Result<DebitPlan> {
    let required = generation.credits_used;
    if !buyer.is_active() || !buyer.can_afford(required) {
        return Err(StoreError::InsufficientCredits {
            balance: buyer.spendable_credits(),
            required,
        });
    }

    let debit = CreditTransaction::generation(
        buyer.id,
        generation.id,
        required,
        buyer.credit_balance,
    );
    let mut buyer = buyer.clone();
    buyer.credit_balance = debit.credit_after;
    buyer.updated_at = Utc::now();

    Ok(DebitPlan { buyer, debit })
}

/// What a transition request resolves to.
pub(crate) enum TransitionPlan {
    /// Settlement of an already-terminal generation.
    AlreadySettled,

    /// Write the updated generation, plus a refund if one is owed.
    Apply {
        generation: Generation,
        refund_amount: Option<i64>,
    },
}

/// Run the state machine against a copy of `current`.
pub(crate) fn plan_transition(current: &Generation, transition: Transition) -> Result<TransitionPlan> {
    if current.is_settled() && transition.is_settlement() {
        return Ok(TransitionPlan::AlreadySettled);
    }

    let mut generation = current.clone();
    let refund_amount = match generation.apply(transition)? {
        LedgerEffect::None => None,
        LedgerEffect::Refund { amount } => Some(amount),
    };

    Ok(TransitionPlan::Apply {
        generation,
        refund_amount,
    })
}

/// Records to write for a refund.
pub(crate) struct RefundPlan {
    pub buyer: User,
    pub refund: CreditTransaction,
}

/// Build the refund for a settled generation. Refunds apply regardless of the
/// buyer's account status.
pub(crate) fn plan_refund(buyer: &User, generation: &Generation, amount: i64) -> RefundPlan {
    let reason = generation.fail_reason.as_deref().unwrap_or("refunded");
    let refund = CreditTransaction::refund(
        buyer.id,
        generation.id,
        amount,
        buyer.credit_balance,
        reason,
    );
    let mut buyer = buyer.clone();
    buyer.credit_balance = refund.credit_after;
    buyer.updated_at = Utc::now();

    RefundPlan { buyer, refund }
}

/// Build a purchase credit.
pub(crate) fn plan_purchase(user: &User, amount: i64, description: String) -> (User, CreditTransaction) {
    let tx = CreditTransaction::purchase(user.id, amount, user.credit_balance, description);
    let mut user = user.clone();
    user.credit_balance = tx.credit_after;
    user.updated_at = Utc::now();
    (user, tx)
}

/// Build a payout debit. A payout can never overdraw.
pub(crate) fn plan_payout(
    user: &User,
    amount: i64,
    payout_reference: Option<String>,
    description: String,
) -> Result<(User, CreditTransaction)> {
    if user.credit_balance < amount {
        return Err(StoreError::InsufficientCredits {
            balance: user.credit_balance,
            required: amount,
        });
    }
    let tx = CreditTransaction::payout(
        user.id,
        amount,
        user.credit_balance,
        payout_reference,
        description,
    );
    let mut user = user.clone();
    user.credit_balance = tx.credit_after;
    user.updated_at = Utc::now();
    Ok((user, tx))
}
