//! `RocksDB` storage implementation.
//!
//! This module provides the `RocksStore` implementation of the `Store` trait.
//! Records are CBOR-encoded. Every operation that reads and rewrites a user
//! record takes that user's lock first and commits through one `WriteBatch`.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch,
};

use avatarbank_core::{
    Avatar, AvatarId, AvatarStatus, CreditTransaction, Generation, GenerationId, Task, TaskId,
    TransactionId, Transition, User, UserId, UserRole, UserStatus,
};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::ledger::{self, TransitionPlan};
use crate::schema::{all_column_families, cf};
use crate::{Reservation, Store, TransitionOutcome};

/// Handle on one user's write lock. The map entry goes away with the last
/// handle, so the map only holds users with writes in flight.
struct UserLock<'a> {
    locks: &'a DashMap<UserId, Arc<Mutex<()>>>,
    user_id: UserId,
    lock: Arc<Mutex<()>>,
}

impl UserLock<'_> {
    fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock()
    }
}

impl Drop for UserLock<'_> {
    fn drop(&mut self) {
        // The map and this handle are the only owners. Cloning happens under
        // the same shard lock, so no one can pick the entry up mid-removal.
        self.locks
            .remove_if(&self.user_id, |_, lock| Arc::strong_count(lock) == 2);
    }
}

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    user_locks: DashMap<UserId, Arc<Mutex<()>>>,
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(Self {
            db: Arc::new(db),
            user_locks: DashMap::new(),
        })
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    /// Lock handle for one user. The map entry is released before locking.
    fn user_lock(&self, user_id: &UserId) -> UserLock<'_> {
        let lock = self
            .user_locks
            .entry(*user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        UserLock {
            locks: &self.user_locks,
            user_id: *user_id,
            lock,
        }
    }

    /// Serialize a value using CBOR.
    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize a value from CBOR.
    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn get_value<T: serde::de::DeserializeOwned>(&self, family: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf(family)?;
        self.db
            .get_cf(&cf, key)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    fn exists(&self, family: &str, key: &[u8]) -> Result<bool> {
        let cf = self.cf(family)?;
        Ok(self
            .db
            .get_pinned_cf(&cf, key)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .is_some())
    }

    fn put_value<T: serde::Serialize>(&self, family: &str, key: &[u8], value: &T) -> Result<()> {
        let cf = self.cf(family)?;
        let value = Self::serialize(value)?;
        self.db
            .put_cf(&cf, key, value)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    /// Collect the index keys under `prefix`, in key order.
    fn index_keys(&self, family: &str, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
        let cf = self.cf(family)?;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));

        let mut out = Vec::new();
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push(key.to_vec());
        }
        Ok(out)
    }

    /// Decode every record in a column family.
    fn scan<T: serde::de::DeserializeOwned>(&self, family: &str) -> Result<Vec<T>> {
        let cf = self.cf(family)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            out.push(Self::deserialize(&value)?);
        }
        Ok(out)
    }

    fn load_user(&self, user_id: &UserId) -> Result<User> {
        self.get_value(cf::USERS, &keys::user_key(user_id))?
            .ok_or_else(|| StoreError::not_found("user", user_id))
    }

    fn load_generation(&self, generation_id: &GenerationId) -> Result<Generation> {
        self.get_value(cf::GENERATIONS, generation_id.as_bytes())?
            .ok_or_else(|| StoreError::not_found("generation", generation_id))
    }

    /// Stage a user record and a ledger entry in `batch`.
    fn stage_ledger(&self, batch: &mut WriteBatch, user: &User, tx: &CreditTransaction) -> Result<()> {
        let cf_users = self.cf(cf::USERS)?;
        let cf_tx = self.cf(cf::TRANSACTIONS)?;
        let cf_tx_by_user = self.cf(cf::TRANSACTIONS_BY_USER)?;

        batch.put_cf(&cf_users, keys::user_key(&user.id), Self::serialize(user)?);
        batch.put_cf(&cf_tx, keys::transaction_key(&tx.id), Self::serialize(tx)?);
        batch.put_cf(&cf_tx_by_user, keys::user_transaction_key(&user.id, &tx.id), []);
        Ok(())
    }

    fn update_user_locked(&self, user_id: &UserId, f: impl FnOnce(&mut User)) -> Result<User> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock();

        let mut user = self.load_user(user_id)?;
        f(&mut user);
        user.updated_at = Utc::now();
        self.put_value(cf::USERS, &keys::user_key(user_id), &user)?;
        Ok(user)
    }

    fn reserve_locked(&self, generation: &Generation) -> Result<Reservation> {
        let lock = self.user_lock(&generation.buyer_id);
        let _guard = lock.lock();

        let idempotency_key = generation
            .idempotency_key
            .as_deref()
            .map(|key| keys::idempotency_key(&generation.buyer_id, key));

        if let Some(key) = &idempotency_key {
            let cf_idem = self.cf(cf::GENERATION_IDEMPOTENCY)?;
            let existing = self
                .db
                .get_cf(&cf_idem, key)
                .map_err(|e| StoreError::Database(e.to_string()))?;
            if let Some(raw) = existing {
                let id = <[u8; 16]>::try_from(raw.as_slice())
                    .map(GenerationId::from_bytes)
                    .map_err(|_| StoreError::Serialization("malformed idempotency entry".into()))?;
                return Ok(Reservation::Existing(self.load_generation(&id)?));
            }
        }

        let buyer = self.load_user(&generation.buyer_id)?;
        let plan = ledger::plan_debit(&buyer, generation)?;

        let cf_gen = self.cf(cf::GENERATIONS)?;
        let cf_by_buyer = self.cf(cf::GENERATIONS_BY_BUYER)?;

        let mut batch = WriteBatch::default();
        self.stage_ledger(&mut batch, &plan.buyer, &plan.debit)?;
        batch.put_cf(&cf_gen, generation.id.as_bytes(), Self::serialize(generation)?);
        batch.put_cf(
            &cf_by_buyer,
            keys::buyer_generation_key(&generation.buyer_id, generation.created_at, &generation.id),
            [],
        );
        if let Some(key) = &idempotency_key {
            let cf_idem = self.cf(cf::GENERATION_IDEMPOTENCY)?;
            batch.put_cf(&cf_idem, key, generation.id.as_bytes());
        }
        self.write(batch)?;

        Ok(Reservation::Created {
            generation: generation.clone(),
            debit: plan.debit,
        })
    }

    fn transition_locked(
        &self,
        generation_id: &GenerationId,
        transition: Transition,
    ) -> Result<TransitionOutcome> {
        let buyer_id = self.load_generation(generation_id)?.buyer_id;
        let lock = self.user_lock(&buyer_id);
        let _guard = lock.lock();

        // Re-read under the lock; another writer may have settled it.
        let current = self.load_generation(generation_id)?;
        let (generation, refund_amount) = match ledger::plan_transition(&current, transition)? {
            TransitionPlan::AlreadySettled => return Ok(TransitionOutcome::AlreadySettled(current)),
            TransitionPlan::Apply {
                generation,
                refund_amount,
            } => (generation, refund_amount),
        };

        let cf_gen = self.cf(cf::GENERATIONS)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_gen, generation.id.as_bytes(), Self::serialize(&generation)?);

        let mut refund = None;
        if let Some(amount) = refund_amount {
            if self.exists(cf::REFUNDS_BY_GENERATION, generation.id.as_bytes())? {
                tracing::warn!(generation_id = %generation.id, "Refund already recorded, skipping");
            } else {
                let buyer = self.load_user(&buyer_id)?;
                let plan = ledger::plan_refund(&buyer, &generation, amount);
                self.stage_ledger(&mut batch, &plan.buyer, &plan.refund)?;
                let cf_refunds = self.cf(cf::REFUNDS_BY_GENERATION)?;
                batch.put_cf(&cf_refunds, generation.id.as_bytes(), plan.refund.id.to_bytes());
                refund = Some(plan.refund);
            }
        }

        self.write(batch)?;
        Ok(TransitionOutcome::Applied { generation, refund })
    }

    fn ledger_change_locked(
        &self,
        user_id: &UserId,
        plan: impl FnOnce(&User) -> Result<(User, CreditTransaction)>,
    ) -> Result<CreditTransaction> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock();

        let user = self.load_user(user_id)?;
        let (user, tx) = plan(&user)?;

        let mut batch = WriteBatch::default();
        self.stage_ledger(&mut batch, &user, &tx)?;
        self.write(batch)?;
        Ok(tx)
    }

    fn user_transactions(&self, user_id: &UserId) -> Result<Vec<CreditTransaction>> {
        let mut out = Vec::new();
        for key in self.index_keys(cf::TRANSACTIONS_BY_USER, user_id.as_bytes())? {
            let tx_id = keys::extract_transaction_id_from_user_key(&key)?;
            if let Some(tx) = self.get_value(cf::TRANSACTIONS, &keys::transaction_key(&tx_id))? {
                out.push(tx);
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl Store for RocksStore {
    // =========================================================================
    // User Operations
    // =========================================================================

    async fn create_user(&self, user: &User) -> Result<()> {
        let lock = self.user_lock(&user.id);
        let _guard = lock.lock();

        let key = keys::user_key(&user.id);
        if self.exists(cf::USERS, &key)? {
            return Err(StoreError::AlreadyExists {
                entity: "user",
                id: user.id.to_string(),
            });
        }
        self.put_value(cf::USERS, &key, user)
    }

    async fn get_user(&self, user_id: &UserId) -> Result<Option<User>> {
        self.get_value(cf::USERS, &keys::user_key(user_id))
    }

    async fn set_user_status(&self, user_id: &UserId, status: UserStatus) -> Result<User> {
        self.update_user_locked(user_id, |user| user.status = status)
    }

    async fn set_user_role(&self, user_id: &UserId, role: UserRole) -> Result<User> {
        self.update_user_locked(user_id, |user| user.role = role)
    }

    // =========================================================================
    // Avatar Operations
    // =========================================================================

    async fn create_avatar(&self, avatar: &Avatar) -> Result<()> {
        if self.exists(cf::AVATARS, avatar.id.as_bytes())? {
            return Err(StoreError::AlreadyExists {
                entity: "avatar",
                id: avatar.id.to_string(),
            });
        }
        self.put_value(cf::AVATARS, avatar.id.as_bytes(), avatar)
    }

    async fn get_avatar(&self, avatar_id: &AvatarId) -> Result<Option<Avatar>> {
        self.get_value(cf::AVATARS, avatar_id.as_bytes())
    }

    async fn update_avatar(&self, avatar: &Avatar) -> Result<()> {
        if !self.exists(cf::AVATARS, avatar.id.as_bytes())? {
            return Err(StoreError::not_found("avatar", avatar.id));
        }
        self.put_value(cf::AVATARS, avatar.id.as_bytes(), avatar)
    }

    async fn list_avatars(
        &self,
        status: Option<AvatarStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Avatar>> {
        let mut avatars: Vec<Avatar> = self.scan(cf::AVATARS)?;
        avatars.retain(|avatar| status.map_or(true, |s| avatar.status == s));
        avatars.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(avatars.into_iter().skip(offset).take(limit).collect())
    }

    // =========================================================================
    // Generation Operations
    // =========================================================================

    async fn get_generation(&self, generation_id: &GenerationId) -> Result<Option<Generation>> {
        self.get_value(cf::GENERATIONS, generation_id.as_bytes())
    }

    async fn list_generations_by_buyer(
        &self,
        buyer_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Generation>> {
        let mut index = self.index_keys(cf::GENERATIONS_BY_BUYER, buyer_id.as_bytes())?;
        // Reverse to get newest first
        index.reverse();

        let mut generations = Vec::new();
        for key in index.into_iter().skip(offset).take(limit) {
            let id = keys::extract_generation_id_from_buyer_key(&key)?;
            if let Some(generation) = self.get_value(cf::GENERATIONS, id.as_bytes())? {
                generations.push(generation);
            }
        }
        Ok(generations)
    }

    async fn list_stale_generations(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Generation>> {
        let mut generations: Vec<Generation> = self.scan(cf::GENERATIONS)?;
        generations.retain(|generation| !generation.is_settled() && generation.updated_at < older_than);
        generations.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        generations.truncate(limit);
        Ok(generations)
    }

    // =========================================================================
    // Task Operations
    // =========================================================================

    async fn create_task(&self, task: &Task) -> Result<()> {
        if !self.exists(cf::GENERATIONS, task.generation_id.as_bytes())? {
            return Err(StoreError::not_found("generation", task.generation_id));
        }

        let cf_tasks = self.cf(cf::TASKS)?;
        let cf_by_gen = self.cf(cf::TASKS_BY_GENERATION)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_tasks, task.id.as_bytes(), Self::serialize(task)?);
        batch.put_cf(
            &cf_by_gen,
            keys::generation_task_key(&task.generation_id, &task.id),
            [],
        );
        self.write(batch)
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        if !self.exists(cf::TASKS, task.id.as_bytes())? {
            return Err(StoreError::not_found("task", task.id));
        }
        self.put_value(cf::TASKS, task.id.as_bytes(), task)
    }

    async fn get_task(&self, task_id: &TaskId) -> Result<Option<Task>> {
        self.get_value(cf::TASKS, task_id.as_bytes())
    }

    async fn list_tasks_by_generation(&self, generation_id: &GenerationId) -> Result<Vec<Task>> {
        let mut tasks = Vec::new();
        for key in self.index_keys(cf::TASKS_BY_GENERATION, generation_id.as_bytes())? {
            let task_id = keys::extract_task_id_from_generation_key(&key)?;
            if let Some(task) = self.get_value::<Task>(cf::TASKS, task_id.as_bytes())? {
                tasks.push(task);
            }
        }
        tasks.sort_by(|a, b| {
            a.retry_count
                .cmp(&b.retry_count)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(tasks)
    }

    // =========================================================================
    // Transaction Operations
    // =========================================================================

    async fn get_transaction(
        &self,
        transaction_id: &TransactionId,
    ) -> Result<Option<CreditTransaction>> {
        self.get_value(cf::TRANSACTIONS, &keys::transaction_key(transaction_id))
    }

    async fn list_transactions_by_user(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CreditTransaction>> {
        let mut all_keys = self.index_keys(cf::TRANSACTIONS_BY_USER, user_id.as_bytes())?;
        // Reverse to get newest first
        all_keys.reverse();

        let mut transactions = Vec::new();
        for key in all_keys.into_iter().skip(offset).take(limit) {
            let tx_id = keys::extract_transaction_id_from_user_key(&key)?;
            if let Some(tx) = self.get_value(cf::TRANSACTIONS, &keys::transaction_key(&tx_id))? {
                transactions.push(tx);
            }
        }
        Ok(transactions)
    }

    async fn ledger_for_user(&self, user_id: &UserId) -> Result<Vec<CreditTransaction>> {
        self.user_transactions(user_id)
    }

    // =========================================================================
    // Compound Operations
    // =========================================================================

    async fn reserve_generation(&self, generation: &Generation) -> Result<Reservation> {
        self.reserve_locked(generation)
    }

    async fn apply_transition(
        &self,
        generation_id: &GenerationId,
        transition: Transition,
    ) -> Result<TransitionOutcome> {
        self.transition_locked(generation_id, transition)
    }

    async fn add_credits(
        &self,
        user_id: &UserId,
        amount: i64,
        description: String,
    ) -> Result<CreditTransaction> {
        self.ledger_change_locked(user_id, |user| {
            Ok(ledger::plan_purchase(user, amount, description))
        })
    }

    async fn record_payout(
        &self,
        user_id: &UserId,
        amount: i64,
        payout_reference: Option<String>,
        description: String,
    ) -> Result<CreditTransaction> {
        self.ledger_change_locked(user_id, |user| {
            ledger::plan_payout(user, amount, payout_reference, description)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avatarbank_core::{verify_ledger, GeneratedImage, GenerationStatus, TransactionType};
    use tempfile::TempDir;

    fn create_test_store() -> (RocksStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        (store, dir)
    }

    async fn funded_user(store: &RocksStore, balance: i64) -> User {
        let user = User::new(UserId::generate(), "buyer@example.com", "buyer");
        store.create_user(&user).await.unwrap();
        if balance > 0 {
            store
                .add_credits(&user.id, balance, "seed".into())
                .await
                .unwrap();
        }
        store.get_user(&user.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn user_locks_are_released_after_use() {
        let (store, _dir) = create_test_store();
        let buyer = funded_user(&store, 5).await;
        let generation = Generation::pending(buyer.id, None, "a fox", 2, None);
        store.reserve_generation(&generation).await.unwrap();

        assert!(store.user_locks.is_empty());

        let held = store.user_lock(&buyer.id);
        let second = store.user_lock(&buyer.id);
        drop(second);
        assert_eq!(store.user_locks.len(), 1);
        drop(held);
        assert!(store.user_locks.is_empty());
    }

    #[tokio::test]
    async fn user_crud() {
        let (store, _dir) = create_test_store();
        let user = funded_user(&store, 0).await;

        assert!(matches!(
            store.create_user(&user).await,
            Err(StoreError::AlreadyExists { .. })
        ));

        let suspended = store
            .set_user_status(&user.id, UserStatus::Suspended)
            .await
            .unwrap();
        assert_eq!(suspended.status, UserStatus::Suspended);
        assert!(store
            .set_user_status(&UserId::generate(), UserStatus::Active)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn reserve_then_fail_refunds_once() {
        let (store, _dir) = create_test_store();
        let buyer = funded_user(&store, 5).await;

        let generation = Generation::pending(buyer.id, None, "a fox", 3, None);
        let reservation = store.reserve_generation(&generation).await.unwrap();
        let Reservation::Created { debit, .. } = reservation else {
            panic!("expected a new reservation");
        };
        assert_eq!(debit.credit_before, 5);
        assert_eq!(debit.credit_after, 2);

        store
            .apply_transition(&generation.id, Transition::Start)
            .await
            .unwrap();
        let outcome = store
            .apply_transition(
                &generation.id,
                Transition::Fail {
                    reason: "provider error".into(),
                },
            )
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            TransitionOutcome::Applied {
                refund: Some(_),
                ..
            }
        ));

        let again = store
            .apply_transition(
                &generation.id,
                Transition::Fail {
                    reason: "provider error".into(),
                },
            )
            .await
            .unwrap();
        assert!(matches!(again, TransitionOutcome::AlreadySettled(_)));

        let user = store.get_user(&buyer.id).await.unwrap().unwrap();
        assert_eq!(user.credit_balance, 5);

        let ledger = store.ledger_for_user(&buyer.id).await.unwrap();
        let refunds = ledger
            .iter()
            .filter(|tx| tx.transaction_type == TransactionType::Refund)
            .count();
        assert_eq!(refunds, 1);
        assert_eq!(verify_ledger(&ledger, user.credit_balance), Ok(5));
    }

    #[tokio::test]
    async fn insufficient_credits_writes_nothing() {
        let (store, _dir) = create_test_store();
        let buyer = funded_user(&store, 2).await;

        let generation = Generation::pending(buyer.id, None, "a fox", 3, None);
        let result = store.reserve_generation(&generation).await;
        assert!(matches!(
            result,
            Err(StoreError::InsufficientCredits {
                balance: 2,
                required: 3
            })
        ));
        assert!(store.get_generation(&generation.id).await.unwrap().is_none());
        assert_eq!(store.ledger_for_user(&buyer.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn idempotency_key_returns_existing_generation() {
        let (store, _dir) = create_test_store();
        let buyer = funded_user(&store, 10).await;

        let first = Generation::pending(buyer.id, None, "a fox", 3, Some("req-1".into()));
        store.reserve_generation(&first).await.unwrap();

        let retry = Generation::pending(buyer.id, None, "a fox", 3, Some("req-1".into()));
        let reservation = store.reserve_generation(&retry).await.unwrap();
        assert!(matches!(&reservation, Reservation::Existing(g) if g.id == first.id));

        let user = store.get_user(&buyer.id).await.unwrap().unwrap();
        assert_eq!(user.credit_balance, 7);
    }

    #[tokio::test]
    async fn listings_are_newest_first() {
        let (store, _dir) = create_test_store();
        let buyer = funded_user(&store, 10).await;

        let mut ids = Vec::new();
        for prompt in ["one", "two", "three"] {
            let generation = Generation::pending(buyer.id, None, prompt, 1, None);
            store.reserve_generation(&generation).await.unwrap();
            ids.push(generation.id);
            std::thread::sleep(std::time::Duration::from_millis(2));
        }

        let listed = store
            .list_generations_by_buyer(&buyer.id, 10, 0)
            .await
            .unwrap();
        assert_eq!(listed.first().map(|g| g.id), ids.last().copied());
        assert_eq!(listed.len(), 3);

        let page = store.list_transactions_by_user(&buyer.id, 2, 0).await.unwrap();
        assert_eq!(page.len(), 2);
        assert!(page[0].id > page[1].id);
    }

    #[tokio::test]
    async fn complete_sets_image_fields() {
        let (store, _dir) = create_test_store();
        let buyer = funded_user(&store, 3).await;
        let generation = Generation::pending(buyer.id, None, "a fox", 3, None);
        store.reserve_generation(&generation).await.unwrap();
        store
            .apply_transition(&generation.id, Transition::Start)
            .await
            .unwrap();
        let done = store
            .apply_transition(
                &generation.id,
                Transition::Complete(GeneratedImage {
                    image_url: "https://cdn.example.com/fox.png".into(),
                    seed: Some("7".into()),
                    nsfw_flag: false,
                }),
            )
            .await
            .unwrap()
            .into_generation();
        assert_eq!(done.status, GenerationStatus::Success);
        assert_eq!(done.image_url.as_deref(), Some("https://cdn.example.com/fox.png"));
    }

    #[tokio::test]
    async fn tasks_are_indexed_by_generation() {
        let (store, _dir) = create_test_store();
        let buyer = funded_user(&store, 3).await;
        let generation = Generation::pending(buyer.id, None, "a fox", 3, None);
        store.reserve_generation(&generation).await.unwrap();

        let mut first = Task::queued(generation.id, 0);
        store.create_task(&first).await.unwrap();
        store.create_task(&Task::queued(generation.id, 1)).await.unwrap();

        first.start("worker-a");
        store.update_task(&first).await.unwrap();

        let tasks = store.list_tasks_by_generation(&generation.id).await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].retry_count, 0);
        assert_eq!(tasks[0].worker_id.as_deref(), Some("worker-a"));

        let orphan = Task::queued(GenerationId::generate(), 0);
        assert!(store.create_task(&orphan).await.is_err());
    }
}
