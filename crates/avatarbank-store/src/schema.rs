//! Database schema definitions and column families.
//!
//! This module defines the column families used in `RocksDB` storage. The
//! PostgreSQL schema lives in `migrations/`.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// User records, keyed by `user_id`.
    pub const USERS: &str = "users";

    /// Avatar records, keyed by `avatar_id`.
    pub const AVATARS: &str = "avatars";

    /// Generation records, keyed by `generation_id`.
    pub const GENERATIONS: &str = "generations";

    /// Index: generations by buyer, keyed by `buyer_id || created_at_millis || generation_id`.
    /// Value is empty (index only).
    pub const GENERATIONS_BY_BUYER: &str = "generations_by_buyer";

    /// Index: idempotency keys, keyed by `buyer_id || key`. Value is the generation ID.
    pub const GENERATION_IDEMPOTENCY: &str = "generation_idempotency";

    /// Credit transactions, keyed by `transaction_id` (ULID).
    pub const TRANSACTIONS: &str = "transactions";

    /// Index: transactions by user, keyed by `user_id || transaction_id`.
    /// Value is empty (index only).
    pub const TRANSACTIONS_BY_USER: &str = "transactions_by_user";

    /// Index: refund transaction per generation, keyed by `generation_id`.
    /// Guards against a second refund.
    pub const REFUNDS_BY_GENERATION: &str = "refunds_by_generation";

    /// Task records, keyed by `task_id`.
    pub const TASKS: &str = "tasks";

    /// Index: tasks by generation, keyed by `generation_id || task_id`.
    pub const TASKS_BY_GENERATION: &str = "tasks_by_generation";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![
        cf::USERS,
        cf::AVATARS,
        cf::GENERATIONS,
        cf::GENERATIONS_BY_BUYER,
        cf::GENERATION_IDEMPOTENCY,
        cf::TRANSACTIONS,
        cf::TRANSACTIONS_BY_USER,
        cf::REFUNDS_BY_GENERATION,
        cf::TASKS,
        cf::TASKS_BY_GENERATION,
    ]
}
