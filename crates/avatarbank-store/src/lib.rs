//! Storage layer for avatarbank.
//!
//! This crate provides persistent storage for users, avatars, generations,
//! tasks and the credit ledger behind a single async [`Store`] trait, with
//! three backends:
//!
//! - [`MemoryStore`]: process-local, for tests and single-node development
//! - [`RocksStore`]: embedded `RocksDB` (feature `rocksdb-backend`)
//! - [`PgStore`]: PostgreSQL via `sqlx`
//!
//! # Atomicity
//!
//! Every balance change is committed together with its ledger entry. The two
//! compound operations of the generation protocol are each one atomic unit:
//!
//! 1. [`Store::reserve_generation`]: balance check, debit, `Pending`
//!    generation and `generation` ledger entry.
//! 2. [`Store::apply_transition`]: state change and, for `Fail`/`Cancel`, the
//!    `refund` ledger entry.
//!
//! Check-and-debit is serialized per user. The in-memory and `RocksDB`
//! backends hold a per-user lock across read-check-write; PostgreSQL locks
//! the user row with `SELECT ... FOR UPDATE`.
//!
//! # Example
//!
//! ```no_run
//! use avatarbank_core::{User, UserId};
//! use avatarbank_store::{MemoryStore, Store};
//!
//! # async fn example() -> avatarbank_store::Result<()> {
//! let store = MemoryStore::new();
//! let user = User::new(UserId::generate(), "a@example.com", "alice");
//! store.create_user(&user).await?;
//! store.add_credits(&user.id, 10, "welcome pack".into()).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod keys;
mod ledger;
pub mod memory;
pub mod postgres;
#[cfg(feature = "rocksdb-backend")]
pub mod rocks;
pub mod schema;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use postgres::PgStore;
#[cfg(feature = "rocksdb-backend")]
pub use rocks::RocksStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use avatarbank_core::{
    Avatar, AvatarId, AvatarStatus, CreditTransaction, Generation, GenerationId, Task, TaskId,
    TransactionId, Transition, User, UserId, UserRole, UserStatus,
};

/// Result of [`Store::reserve_generation`].
#[derive(Debug, Clone)]
pub enum Reservation {
    /// The buyer was charged and a new `Pending` generation was created.
    Created {
        /// The new generation.
        generation: Generation,
        /// The `generation` debit entry.
        debit: CreditTransaction,
    },

    /// The idempotency key matched an earlier submission; nothing was written.
    Existing(Generation),
}

impl Reservation {
    /// The generation, new or existing.
    #[must_use]
    pub fn generation(&self) -> &Generation {
        match self {
            Self::Created { generation, .. } | Self::Existing(generation) => generation,
        }
    }

    /// Consume the reservation, returning the generation.
    #[must_use]
    pub fn into_generation(self) -> Generation {
        match self {
            Self::Created { generation, .. } | Self::Existing(generation) => generation,
        }
    }
}

/// Result of [`Store::apply_transition`].
#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    /// The transition was committed.
    Applied {
        /// The generation after the transition.
        generation: Generation,
        /// Refund entry written with it, for `Fail` and `Cancel`.
        refund: Option<CreditTransaction>,
    },

    /// A settling transition arrived for a generation that is already
    /// terminal. Nothing was written.
    AlreadySettled(Generation),
}

impl TransitionOutcome {
    /// The generation as it is now stored.
    #[must_use]
    pub fn generation(&self) -> &Generation {
        match self {
            Self::Applied { generation, .. } | Self::AlreadySettled(generation) => generation,
        }
    }

    /// Consume the outcome, returning the generation.
    #[must_use]
    pub fn into_generation(self) -> Generation {
        match self {
            Self::Applied { generation, .. } | Self::AlreadySettled(generation) => generation,
        }
    }
}

/// The storage trait defining all database operations.
///
/// This trait abstracts the storage layer, allowing for different
/// implementations (in-memory, `RocksDB`, PostgreSQL).
#[async_trait]
pub trait Store: Send + Sync {
    // =========================================================================
    // User Operations
    // =========================================================================

    /// Insert a new user.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::AlreadyExists` if the ID is taken.
    async fn create_user(&self, user: &User) -> Result<()>;

    /// Get a user by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_user(&self, user_id: &UserId) -> Result<Option<User>>;

    /// Change a user's account status. The balance is untouched.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the user doesn't exist.
    async fn set_user_status(&self, user_id: &UserId, status: UserStatus) -> Result<User>;

    /// Change a user's role. The balance is untouched.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the user doesn't exist.
    async fn set_user_role(&self, user_id: &UserId, role: UserRole) -> Result<User>;

    // =========================================================================
    // Avatar Operations
    // =========================================================================

    /// Insert a new avatar.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::AlreadyExists` if the ID is taken.
    async fn create_avatar(&self, avatar: &Avatar) -> Result<()>;

    /// Get an avatar by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_avatar(&self, avatar_id: &AvatarId) -> Result<Option<Avatar>>;

    /// Replace an existing avatar record.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the avatar doesn't exist.
    async fn update_avatar(&self, avatar: &Avatar) -> Result<()>;

    /// List avatars, newest first, optionally filtered by status.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_avatars(
        &self,
        status: Option<AvatarStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Avatar>>;

    // =========================================================================
    // Generation Operations
    // =========================================================================

    /// Get a generation by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_generation(&self, generation_id: &GenerationId) -> Result<Option<Generation>>;

    /// List a buyer's generations, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_generations_by_buyer(
        &self,
        buyer_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Generation>>;

    /// List non-terminal generations last updated before `older_than`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_stale_generations(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Generation>>;

    // =========================================================================
    // Task Operations
    // =========================================================================

    /// Insert a new task.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the generation doesn't exist.
    async fn create_task(&self, task: &Task) -> Result<()>;

    /// Replace an existing task record.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the task doesn't exist.
    async fn update_task(&self, task: &Task) -> Result<()>;

    /// Get a task by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_task(&self, task_id: &TaskId) -> Result<Option<Task>>;

    /// List a generation's tasks, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_tasks_by_generation(&self, generation_id: &GenerationId) -> Result<Vec<Task>>;

    // =========================================================================
    // Transaction Operations
    // =========================================================================

    /// Get a transaction by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_transaction(
        &self,
        transaction_id: &TransactionId,
    ) -> Result<Option<CreditTransaction>>;

    /// List transactions for a user, ordered by time (newest first).
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_transactions_by_user(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CreditTransaction>>;

    /// A user's full ledger in creation order (oldest first), for replay.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn ledger_for_user(&self, user_id: &UserId) -> Result<Vec<CreditTransaction>>;

    // =========================================================================
    // Compound Operations
    // =========================================================================

    /// Charge the buyer and create the `Pending` generation atomically.
    ///
    /// The debit is `generation.credits_used`. If the generation carries an
    /// idempotency key already used by the same buyer, the earlier generation
    /// is returned and nothing is written.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if the buyer doesn't exist.
    /// - `StoreError::InsufficientCredits` if the buyer is inactive or the
    ///   balance is too low. Nothing is written.
    /// - `StoreError::Conflict` if a concurrent writer won.
    async fn reserve_generation(&self, generation: &Generation) -> Result<Reservation>;

    /// Apply a state-machine transition and its ledger effect atomically.
    ///
    /// A settling transition (`Complete`, `Fail`, `Cancel`) against a terminal
    /// generation returns [`TransitionOutcome::AlreadySettled`] and writes
    /// nothing, so repeated outcome reports cannot refund twice.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if the generation doesn't exist.
    /// - `StoreError::InvalidTransition` if the state machine rejects it.
    /// - `StoreError::Conflict` if a concurrent writer won.
    async fn apply_transition(
        &self,
        generation_id: &GenerationId,
        transition: Transition,
    ) -> Result<TransitionOutcome>;

    /// Credit a purchase and record the transaction atomically.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the user doesn't exist.
    async fn add_credits(
        &self,
        user_id: &UserId,
        amount: i64,
        description: String,
    ) -> Result<CreditTransaction>;

    /// Debit a payout and record the transaction atomically.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if the user doesn't exist.
    /// - `StoreError::InsufficientCredits` if the payout exceeds the balance.
    async fn record_payout(
        &self,
        user_id: &UserId,
        amount: i64,
        payout_reference: Option<String>,
        description: String,
    ) -> Result<CreditTransaction>;
}
