//! In-memory storage implementation.
//!
//! All state sits behind one mutex, so every compound operation is trivially
//! serialized. Used by the test harness and for single-node development.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use avatarbank_core::{
    Avatar, AvatarId, AvatarStatus, CreditTransaction, Generation, GenerationId, Task, TaskId,
    TransactionId, Transition, User, UserId, UserRole, UserStatus,
};

use crate::error::{Result, StoreError};
use crate::ledger::{self, TransitionPlan};
use crate::{Reservation, Store, TransitionOutcome};

#[derive(Default)]
struct Tables {
    users: HashMap<UserId, User>,
    avatars: HashMap<AvatarId, Avatar>,
    generations: HashMap<GenerationId, Generation>,
    idempotency: HashMap<(UserId, String), GenerationId>,
    transactions: BTreeMap<TransactionId, CreditTransaction>,
    refunds_by_generation: HashMap<GenerationId, TransactionId>,
    tasks: HashMap<TaskId, Task>,
}

impl Tables {
    fn user(&self, user_id: &UserId) -> Result<&User> {
        self.users
            .get(user_id)
            .ok_or_else(|| StoreError::not_found("user", user_id))
    }

    fn update_user(&mut self, user_id: &UserId, f: impl FnOnce(&mut User)) -> Result<User> {
        let user = self
            .users
            .get_mut(user_id)
            .ok_or_else(|| StoreError::not_found("user", user_id))?;
        f(user);
        user.updated_at = Utc::now();
        Ok(user.clone())
    }

    fn commit_ledger(&mut self, user: User, tx: &CreditTransaction) {
        self.users.insert(user.id, user);
        self.transactions.insert(tx.id, tx.clone());
    }
}

/// Process-local storage.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn page<T>(items: impl Iterator<Item = T>, limit: usize, offset: usize) -> Vec<T> {
    items.skip(offset).take(limit).collect()
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_user(&self, user: &User) -> Result<()> {
        let mut tables = self.tables.lock();
        if tables.users.contains_key(&user.id) {
            return Err(StoreError::AlreadyExists {
                entity: "user",
                id: user.id.to_string(),
            });
        }
        tables.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn get_user(&self, user_id: &UserId) -> Result<Option<User>> {
        Ok(self.tables.lock().users.get(user_id).cloned())
    }

    async fn set_user_status(&self, user_id: &UserId, status: UserStatus) -> Result<User> {
        self.tables
            .lock()
            .update_user(user_id, |user| user.status = status)
    }

    async fn set_user_role(&self, user_id: &UserId, role: UserRole) -> Result<User> {
        self.tables.lock().update_user(user_id, |user| user.role = role)
    }

    async fn create_avatar(&self, avatar: &Avatar) -> Result<()> {
        let mut tables = self.tables.lock();
        if tables.avatars.contains_key(&avatar.id) {
            return Err(StoreError::AlreadyExists {
                entity: "avatar",
                id: avatar.id.to_string(),
            });
        }
        tables.avatars.insert(avatar.id, avatar.clone());
        Ok(())
    }

    async fn get_avatar(&self, avatar_id: &AvatarId) -> Result<Option<Avatar>> {
        Ok(self.tables.lock().avatars.get(avatar_id).cloned())
    }

    async fn update_avatar(&self, avatar: &Avatar) -> Result<()> {
        let mut tables = self.tables.lock();
        let slot = tables
            .avatars
            .get_mut(&avatar.id)
            .ok_or_else(|| StoreError::not_found("avatar", avatar.id))?;
        *slot = avatar.clone();
        Ok(())
    }

    async fn list_avatars(
        &self,
        status: Option<AvatarStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Avatar>> {
        let tables = self.tables.lock();
        let mut avatars: Vec<_> = tables
            .avatars
            .values()
            .filter(|avatar| status.map_or(true, |s| avatar.status == s))
            .cloned()
            .collect();
        avatars.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(page(avatars.into_iter(), limit, offset))
    }

    async fn get_generation(&self, generation_id: &GenerationId) -> Result<Option<Generation>> {
        Ok(self.tables.lock().generations.get(generation_id).cloned())
    }

    async fn list_generations_by_buyer(
        &self,
        buyer_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Generation>> {
        let tables = self.tables.lock();
        let mut generations: Vec<_> = tables
            .generations
            .values()
            .filter(|generation| generation.buyer_id == *buyer_id)
            .cloned()
            .collect();
        generations.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(page(generations.into_iter(), limit, offset))
    }

    async fn list_stale_generations(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Generation>> {
        let tables = self.tables.lock();
        let mut generations: Vec<_> = tables
            .generations
            .values()
            .filter(|generation| !generation.is_settled() && generation.updated_at < older_than)
            .cloned()
            .collect();
        generations.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        generations.truncate(limit);
        Ok(generations)
    }

    async fn create_task(&self, task: &Task) -> Result<()> {
        let mut tables = self.tables.lock();
        if !tables.generations.contains_key(&task.generation_id) {
            return Err(StoreError::not_found("generation", task.generation_id));
        }
        tables.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        let mut tables = self.tables.lock();
        let slot = tables
            .tasks
            .get_mut(&task.id)
            .ok_or_else(|| StoreError::not_found("task", task.id))?;
        *slot = task.clone();
        Ok(())
    }

    async fn get_task(&self, task_id: &TaskId) -> Result<Option<Task>> {
        Ok(self.tables.lock().tasks.get(task_id).cloned())
    }

    async fn list_tasks_by_generation(&self, generation_id: &GenerationId) -> Result<Vec<Task>> {
        let tables = self.tables.lock();
        let mut tasks: Vec<_> = tables
            .tasks
            .values()
            .filter(|task| task.generation_id == *generation_id)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| {
            a.retry_count
                .cmp(&b.retry_count)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(tasks)
    }

    async fn get_transaction(
        &self,
        transaction_id: &TransactionId,
    ) -> Result<Option<CreditTransaction>> {
        Ok(self.tables.lock().transactions.get(transaction_id).cloned())
    }

    async fn list_transactions_by_user(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CreditTransaction>> {
        let tables = self.tables.lock();
        let newest_first = tables
            .transactions
            .values()
            .rev()
            .filter(|tx| tx.user_id == *user_id)
            .cloned();
        Ok(page(newest_first, limit, offset))
    }

    async fn ledger_for_user(&self, user_id: &UserId) -> Result<Vec<CreditTransaction>> {
        let tables = self.tables.lock();
        Ok(tables
            .transactions
            .values()
            .filter(|tx| tx.user_id == *user_id)
            .cloned()
            .collect())
    }

    async fn reserve_generation(&self, generation: &Generation) -> Result<Reservation> {
        let mut tables = self.tables.lock();

        if let Some(key) = &generation.idempotency_key {
            let existing = tables
                .idempotency
                .get(&(generation.buyer_id, key.clone()))
                .and_then(|id| tables.generations.get(id));
            if let Some(existing) = existing {
                return Ok(Reservation::Existing(existing.clone()));
            }
        }

        let buyer = tables.user(&generation.buyer_id)?;
        let plan = ledger::plan_debit(buyer, generation)?;

        tables.commit_ledger(plan.buyer, &plan.debit);
        tables.generations.insert(generation.id, generation.clone());
        if let Some(key) = &generation.idempotency_key {
            tables
                .idempotency
                .insert((generation.buyer_id, key.clone()), generation.id);
        }

        Ok(Reservation::Created {
            generation: generation.clone(),
            debit: plan.debit,
        })
    }

    async fn apply_transition(
        &self,
        generation_id: &GenerationId,
        transition: Transition,
    ) -> Result<TransitionOutcome> {
        let mut tables = self.tables.lock();

        let current = tables
            .generations
            .get(generation_id)
            .ok_or_else(|| StoreError::not_found("generation", generation_id))?;

        let (generation, refund_amount) = match ledger::plan_transition(current, transition)? {
            TransitionPlan::AlreadySettled => {
                return Ok(TransitionOutcome::AlreadySettled(current.clone()));
            }
            TransitionPlan::Apply {
                generation,
                refund_amount,
            } => (generation, refund_amount),
        };

        let refund = match refund_amount {
            Some(amount) if !tables.refunds_by_generation.contains_key(generation_id) => {
                let buyer = tables.user(&generation.buyer_id)?;
                let plan = ledger::plan_refund(buyer, &generation, amount);
                tables.commit_ledger(plan.buyer, &plan.refund);
                tables
                    .refunds_by_generation
                    .insert(generation.id, plan.refund.id);
                Some(plan.refund)
            }
            _ => None,
        };

        tables.generations.insert(generation.id, generation.clone());

        Ok(TransitionOutcome::Applied { generation, refund })
    }

    async fn add_credits(
        &self,
        user_id: &UserId,
        amount: i64,
        description: String,
    ) -> Result<CreditTransaction> {
        let mut tables = self.tables.lock();
        let user = tables.user(user_id)?;
        let (user, tx) = ledger::plan_purchase(user, amount, description);
        tables.commit_ledger(user, &tx);
        Ok(tx)
    }

    async fn record_payout(
        &self,
        user_id: &UserId,
        amount: i64,
        payout_reference: Option<String>,
        description: String,
    ) -> Result<CreditTransaction> {
        let mut tables = self.tables.lock();
        let user = tables.user(user_id)?;
        let (user, tx) = ledger::plan_payout(user, amount, payout_reference, description)?;
        tables.commit_ledger(user, &tx);
        Ok(tx)
    }
}
