//! PostgreSQL storage implementation.
//!
//! Compound operations run inside one database transaction and lock the
//! user row with `SELECT ... FOR UPDATE` before reading the balance. Lock
//! order is always user row, then generation row.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{PgConnection, Row};

use avatarbank_core::{
    Avatar, AvatarId, AvatarStatus, CreditTransaction, Generation, GenerationId, Task, TaskId,
    TransactionId, Transition, User, UserId, UserRole, UserStatus,
};

use crate::error::{Result, StoreError};
use crate::ledger::{self, TransitionPlan};
use crate::{Reservation, Store, TransitionOutcome};

/// SQLSTATE codes for serialization failure, deadlock and lock timeout.
const CONFLICT_CODES: [&str; 3] = ["40001", "40P01", "55P03"];

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) => {
                let code = db_err.code();
                if code.as_deref().is_some_and(|c| CONFLICT_CODES.contains(&c)) {
                    Self::Conflict(db_err.message().to_string())
                } else if db_err.is_unique_violation() {
                    Self::AlreadyExists {
                        entity: "record",
                        id: db_err.constraint().unwrap_or("unknown").to_string(),
                    }
                } else {
                    Self::Database(err.to_string())
                }
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                Self::Serialization(err.to_string())
            }
            _ => Self::Database(err.to_string()),
        }
    }
}

/// PostgreSQL-backed storage implementation.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Wrap an existing pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Apply pending schema migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if a migration fails.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    /// Get the connection pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// =============================================================================
// Row mapping
// =============================================================================

fn parse<T: FromStr<Err = String>>(value: &str) -> Result<T> {
    value.parse().map_err(StoreError::Serialization)
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn user_from_row(row: &PgRow) -> Result<User> {
    Ok(User {
        id: UserId::from_uuid(row.try_get("id")?),
        email: row.try_get("email")?,
        nickname: row.try_get("nickname")?,
        role: parse(row.try_get::<&str, _>("role")?)?,
        status: parse(row.try_get::<&str, _>("status")?)?,
        locale: row.try_get("locale")?,
        credit_balance: row.try_get("credit_balance")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn avatar_from_row(row: &PgRow) -> Result<Avatar> {
    Ok(Avatar {
        id: AvatarId::from_uuid(row.try_get("id")?),
        influencer_id: UserId::from_uuid(row.try_get("influencer_id")?),
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        credit_per_generation: row.try_get("credit_per_generation")?,
        nsfw_allowed: row.try_get("nsfw_allowed")?,
        preview_image_url: row.try_get("preview_image_url")?,
        status: parse(row.try_get::<&str, _>("status")?)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn generation_from_row(row: &PgRow) -> Result<Generation> {
    let avatar_id: Option<uuid::Uuid> = row.try_get("avatar_id")?;
    Ok(Generation {
        id: GenerationId::from_uuid(row.try_get("id")?),
        buyer_id: UserId::from_uuid(row.try_get("buyer_id")?),
        avatar_id: avatar_id.map(AvatarId::from_uuid),
        credits_used: row.try_get("credits_used")?,
        prompt: row.try_get("prompt")?,
        status: parse(row.try_get::<&str, _>("status")?)?,
        image_url: row.try_get("image_url")?,
        seed: row.try_get("seed")?,
        nsfw_flag: row.try_get("nsfw_flag")?,
        request_id: row.try_get("request_id")?,
        fail_reason: row.try_get("fail_reason")?,
        idempotency_key: row.try_get("idempotency_key")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn transaction_from_row(row: &PgRow) -> Result<CreditTransaction> {
    let id: TransactionId = row
        .try_get::<&str, _>("id")?
        .parse()
        .map_err(|e: avatarbank_core::IdError| StoreError::Serialization(e.to_string()))?;
    Ok(CreditTransaction {
        id,
        user_id: UserId::from_uuid(row.try_get("user_id")?),
        transaction_type: parse(row.try_get::<&str, _>("transaction_type")?)?,
        amount: row.try_get("amount")?,
        credit_before: row.try_get("credit_before")?,
        credit_after: row.try_get("credit_after")?,
        reference_id: row.try_get("reference_id")?,
        description: row.try_get("description")?,
        created_at: row.try_get("created_at")?,
    })
}

fn task_from_row(row: &PgRow) -> Result<Task> {
    let retry_count: i32 = row.try_get("retry_count")?;
    Ok(Task {
        id: TaskId::from_uuid(row.try_get("id")?),
        generation_id: GenerationId::from_uuid(row.try_get("generation_id")?),
        task_type: row.try_get("task_type")?,
        status: parse(row.try_get::<&str, _>("status")?)?,
        worker_id: row.try_get("worker_id")?,
        retry_count: u32::try_from(retry_count).unwrap_or(0),
        last_error_message: row.try_get("last_error_message")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}

// =============================================================================
// Statements shared by the compound operations
// =============================================================================

async fn lock_user(conn: &mut PgConnection, user_id: &UserId) -> Result<User> {
    let row = sqlx::query("SELECT * FROM users WHERE id = $1 FOR UPDATE")
        .bind(user_id.as_uuid())
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| StoreError::not_found("user", user_id))?;
    user_from_row(&row)
}

async fn write_balance(conn: &mut PgConnection, user: &User) -> Result<()> {
    sqlx::query("UPDATE users SET credit_balance = $2, updated_at = $3 WHERE id = $1")
        .bind(user.id.as_uuid())
        .bind(user.credit_balance)
        .bind(user.updated_at)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn insert_transaction(conn: &mut PgConnection, tx: &CreditTransaction) -> Result<()> {
    sqlx::query(
        r"
        INSERT INTO credit_transactions
            (id, user_id, transaction_type, amount, credit_before, credit_after,
             reference_id, description, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ",
    )
    .bind(tx.id.to_string())
    .bind(tx.user_id.as_uuid())
    .bind(tx.transaction_type.as_str())
    .bind(tx.amount)
    .bind(tx.credit_before)
    .bind(tx.credit_after)
    .bind(&tx.reference_id)
    .bind(&tx.description)
    .bind(tx.created_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn update_user_field(
    pool: &PgPool,
    user_id: &UserId,
    column_sql: &'static str,
    value: String,
) -> Result<User> {
    let row = sqlx::query(column_sql)
        .bind(user_id.as_uuid())
        .bind(value)
        .bind(Utc::now())
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| StoreError::not_found("user", user_id))?;
    user_from_row(&row)
}

#[async_trait]
impl Store for PgStore {
    // =========================================================================
    // User Operations
    // =========================================================================

    async fn create_user(&self, user: &User) -> Result<()> {
        let result = sqlx::query(
            r"
            INSERT INTO users
                (id, email, nickname, role, status, locale, credit_balance, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO NOTHING
            ",
        )
        .bind(user.id.as_uuid())
        .bind(&user.email)
        .bind(&user.nickname)
        .bind(user.role.to_string())
        .bind(user.status.to_string())
        .bind(&user.locale)
        .bind(user.credit_balance)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists {
                entity: "user",
                id: user.id.to_string(),
            });
        }
        Ok(())
    }

    async fn get_user(&self, user_id: &UserId) -> Result<Option<User>> {
        sqlx::query("SELECT * FROM users WHERE id = $1")
            .bind(user_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(user_from_row)
            .transpose()
    }

    async fn set_user_status(&self, user_id: &UserId, status: UserStatus) -> Result<User> {
        update_user_field(
            &self.pool,
            user_id,
            "UPDATE users SET status = $2, updated_at = $3 WHERE id = $1 RETURNING *",
            status.to_string(),
        )
        .await
    }

    async fn set_user_role(&self, user_id: &UserId, role: UserRole) -> Result<User> {
        update_user_field(
            &self.pool,
            user_id,
            "UPDATE users SET role = $2, updated_at = $3 WHERE id = $1 RETURNING *",
            role.to_string(),
        )
        .await
    }

    // =========================================================================
    // Avatar Operations
    // =========================================================================

    async fn create_avatar(&self, avatar: &Avatar) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO avatars
                (id, influencer_id, title, description, credit_per_generation, nsfw_allowed,
                 preview_image_url, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ",
        )
        .bind(avatar.id.as_uuid())
        .bind(avatar.influencer_id.as_uuid())
        .bind(&avatar.title)
        .bind(&avatar.description)
        .bind(avatar.credit_per_generation)
        .bind(avatar.nsfw_allowed)
        .bind(&avatar.preview_image_url)
        .bind(avatar.status.to_string())
        .bind(avatar.created_at)
        .bind(avatar.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_avatar(&self, avatar_id: &AvatarId) -> Result<Option<Avatar>> {
        sqlx::query("SELECT * FROM avatars WHERE id = $1")
            .bind(avatar_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(avatar_from_row)
            .transpose()
    }

    async fn update_avatar(&self, avatar: &Avatar) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE avatars
            SET title = $2, description = $3, credit_per_generation = $4, nsfw_allowed = $5,
                preview_image_url = $6, status = $7, updated_at = $8
            WHERE id = $1
            ",
        )
        .bind(avatar.id.as_uuid())
        .bind(&avatar.title)
        .bind(&avatar.description)
        .bind(avatar.credit_per_generation)
        .bind(avatar.nsfw_allowed)
        .bind(&avatar.preview_image_url)
        .bind(avatar.status.to_string())
        .bind(avatar.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("avatar", avatar.id));
        }
        Ok(())
    }

    async fn list_avatars(
        &self,
        status: Option<AvatarStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Avatar>> {
        let rows = sqlx::query(
            r"
            SELECT * FROM avatars
            WHERE ($1::TEXT IS NULL OR status = $1)
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            ",
        )
        .bind(status.map(|s| s.to_string()))
        .bind(to_i64(limit))
        .bind(to_i64(offset))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(avatar_from_row).collect()
    }

    // =========================================================================
    // Generation Operations
    // =========================================================================

    async fn get_generation(&self, generation_id: &GenerationId) -> Result<Option<Generation>> {
        sqlx::query("SELECT * FROM generations WHERE id = $1")
            .bind(generation_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(generation_from_row)
            .transpose()
    }

    async fn list_generations_by_buyer(
        &self,
        buyer_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Generation>> {
        let rows = sqlx::query(
            r"
            SELECT * FROM generations
            WHERE buyer_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2 OFFSET $3
            ",
        )
        .bind(buyer_id.as_uuid())
        .bind(to_i64(limit))
        .bind(to_i64(offset))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(generation_from_row).collect()
    }

    async fn list_stale_generations(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Generation>> {
        let rows = sqlx::query(
            r"
            SELECT * FROM generations
            WHERE status IN ('pending', 'processing') AND updated_at < $1
            ORDER BY updated_at
            LIMIT $2
            ",
        )
        .bind(older_than)
        .bind(to_i64(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(generation_from_row).collect()
    }

    // =========================================================================
    // Task Operations
    // =========================================================================

    async fn create_task(&self, task: &Task) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO tasks
                (id, generation_id, task_type, status, worker_id, retry_count,
                 last_error_message, created_at, started_at, finished_at)
            SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9, $10
            WHERE EXISTS (SELECT 1 FROM generations WHERE id = $2)
            ",
        )
        .bind(task.id.as_uuid())
        .bind(task.generation_id.as_uuid())
        .bind(&task.task_type)
        .bind(task.status.to_string())
        .bind(&task.worker_id)
        .bind(i32::try_from(task.retry_count).unwrap_or(i32::MAX))
        .bind(&task.last_error_message)
        .bind(task.created_at)
        .bind(task.started_at)
        .bind(task.finished_at)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)
        .and_then(|result| {
            if result.rows_affected() == 0 {
                Err(StoreError::not_found("generation", task.generation_id))
            } else {
                Ok(())
            }
        })
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE tasks
            SET status = $2, worker_id = $3, last_error_message = $4,
                started_at = $5, finished_at = $6
            WHERE id = $1
            ",
        )
        .bind(task.id.as_uuid())
        .bind(task.status.to_string())
        .bind(&task.worker_id)
        .bind(&task.last_error_message)
        .bind(task.started_at)
        .bind(task.finished_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("task", task.id));
        }
        Ok(())
    }

    async fn get_task(&self, task_id: &TaskId) -> Result<Option<Task>> {
        sqlx::query("SELECT * FROM tasks WHERE id = $1")
            .bind(task_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(task_from_row)
            .transpose()
    }

    async fn list_tasks_by_generation(&self, generation_id: &GenerationId) -> Result<Vec<Task>> {
        let rows = sqlx::query(
            "SELECT * FROM tasks WHERE generation_id = $1 ORDER BY retry_count, created_at",
        )
        .bind(generation_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(task_from_row).collect()
    }

    // =========================================================================
    // Transaction Operations
    // =========================================================================

    async fn get_transaction(
        &self,
        transaction_id: &TransactionId,
    ) -> Result<Option<CreditTransaction>> {
        sqlx::query("SELECT * FROM credit_transactions WHERE id = $1")
            .bind(transaction_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(transaction_from_row)
            .transpose()
    }

    async fn list_transactions_by_user(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CreditTransaction>> {
        let rows = sqlx::query(
            r"
            SELECT * FROM credit_transactions
            WHERE user_id = $1
            ORDER BY seq DESC
            LIMIT $2 OFFSET $3
            ",
        )
        .bind(user_id.as_uuid())
        .bind(to_i64(limit))
        .bind(to_i64(offset))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(transaction_from_row).collect()
    }

    async fn ledger_for_user(&self, user_id: &UserId) -> Result<Vec<CreditTransaction>> {
        let rows = sqlx::query("SELECT * FROM credit_transactions WHERE user_id = $1 ORDER BY seq")
            .bind(user_id.as_uuid())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(transaction_from_row).collect()
    }

    // =========================================================================
    // Compound Operations
    // =========================================================================

    async fn reserve_generation(&self, generation: &Generation) -> Result<Reservation> {
        let mut tx = self.pool.begin().await?;

        let buyer = lock_user(&mut tx, &generation.buyer_id).await?;

        if let Some(key) = &generation.idempotency_key {
            let existing = sqlx::query(
                "SELECT * FROM generations WHERE buyer_id = $1 AND idempotency_key = $2",
            )
            .bind(generation.buyer_id.as_uuid())
            .bind(key)
            .fetch_optional(&mut *tx)
            .await?;
            if let Some(row) = existing {
                let existing = generation_from_row(&row)?;
                tx.rollback().await?;
                return Ok(Reservation::Existing(existing));
            }
        }

        let plan = ledger::plan_debit(&buyer, generation)?;

        write_balance(&mut tx, &plan.buyer).await?;
        sqlx::query(
            r"
            INSERT INTO generations
                (id, buyer_id, avatar_id, credits_used, prompt, status, image_url, seed,
                 nsfw_flag, request_id, fail_reason, idempotency_key, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ",
        )
        .bind(generation.id.as_uuid())
        .bind(generation.buyer_id.as_uuid())
        .bind(generation.avatar_id.map(|id| *id.as_uuid()))
        .bind(generation.credits_used)
        .bind(&generation.prompt)
        .bind(generation.status.as_str())
        .bind(&generation.image_url)
        .bind(&generation.seed)
        .bind(generation.nsfw_flag)
        .bind(&generation.request_id)
        .bind(&generation.fail_reason)
        .bind(&generation.idempotency_key)
        .bind(generation.created_at)
        .bind(generation.updated_at)
        .execute(&mut *tx)
        .await?;
        insert_transaction(&mut tx, &plan.debit).await?;

        tx.commit().await?;

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
        let mut tx = self.pool.begin().await?;

        let buyer_id: uuid::Uuid = sqlx::query("SELECT buyer_id FROM generations WHERE id = $1")
            .bind(generation_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::not_found("generation", generation_id))?
            .try_get("buyer_id")?;
        let buyer = lock_user(&mut tx, &UserId::from_uuid(buyer_id)).await?;

        let row = sqlx::query("SELECT * FROM generations WHERE id = $1 FOR UPDATE")
            .bind(generation_id.as_uuid())
            .fetch_one(&mut *tx)
            .await?;
        let current = generation_from_row(&row)?;

        let (generation, refund_amount) = match ledger::plan_transition(&current, transition)? {
            TransitionPlan::AlreadySettled => {
                tx.rollback().await?;
                return Ok(TransitionOutcome::AlreadySettled(current));
            }
            TransitionPlan::Apply {
                generation,
                refund_amount,
            } => (generation, refund_amount),
        };

        sqlx::query(
            r"
            UPDATE generations
            SET status = $2, image_url = $3, seed = $4, nsfw_flag = $5, request_id = $6,
                fail_reason = $7, updated_at = $8
            WHERE id = $1
            ",
        )
        .bind(generation.id.as_uuid())
        .bind(generation.status.as_str())
        .bind(&generation.image_url)
        .bind(&generation.seed)
        .bind(generation.nsfw_flag)
        .bind(&generation.request_id)
        .bind(&generation.fail_reason)
        .bind(generation.updated_at)
        .execute(&mut *tx)
        .await?;

        let mut refund = None;
        if let Some(amount) = refund_amount {
            let already: bool = sqlx::query_scalar(
                r"
                SELECT EXISTS (
                    SELECT 1 FROM credit_transactions
                    WHERE reference_id = $1 AND transaction_type = 'refund'
                )
                ",
            )
            .bind(generation.id.to_string())
            .fetch_one(&mut *tx)
            .await?;

            if already {
                tracing::warn!(generation_id = %generation.id, "Refund already recorded, skipping");
            } else {
                let plan = ledger::plan_refund(&buyer, &generation, amount);
                write_balance(&mut tx, &plan.buyer).await?;
                insert_transaction(&mut tx, &plan.refund).await?;
                refund = Some(plan.refund);
            }
        }

        tx.commit().await?;
        Ok(TransitionOutcome::Applied { generation, refund })
    }

    async fn add_credits(
        &self,
        user_id: &UserId,
        amount: i64,
        description: String,
    ) -> Result<CreditTransaction> {
        let mut tx = self.pool.begin().await?;
        let user = lock_user(&mut tx, user_id).await?;
        let (user, entry) = ledger::plan_purchase(&user, amount, description);
        write_balance(&mut tx, &user).await?;
        insert_transaction(&mut tx, &entry).await?;
        tx.commit().await?;
        Ok(entry)
    }

    async fn record_payout(
        &self,
        user_id: &UserId,
        amount: i64,
        payout_reference: Option<String>,
        description: String,
    ) -> Result<CreditTransaction> {
        let mut tx = self.pool.begin().await?;
        let user = lock_user(&mut tx, user_id).await?;
        let (user, entry) = ledger::plan_payout(&user, amount, payout_reference, description)?;
        write_balance(&mut tx, &user).await?;
        insert_transaction(&mut tx, &entry).await?;
        tx.commit().await?;
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    //! These tests need a live database: `DATABASE_URL=... cargo test -- --ignored`.

    use super::*;
    use avatarbank_core::verify_ledger;

    async fn store() -> PgStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let store = PgStore::connect(&url, 5).await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn reserve_and_refund_round_trip() {
        let store = store().await;
        let user = User::new(UserId::generate(), "pg@example.com", "pg");
        store.create_user(&user).await.unwrap();
        store.add_credits(&user.id, 5, "seed".into()).await.unwrap();

        let generation = Generation::pending(user.id, None, "a heron", 3, None);
        store.reserve_generation(&generation).await.unwrap();
        store
            .apply_transition(
                &generation.id,
                Transition::Fail {
                    reason: "provider down".into(),
                },
            )
            .await
            .unwrap();

        let balance = store.get_user(&user.id).await.unwrap().unwrap().credit_balance;
        assert_eq!(balance, 5);
        let ledger = store.ledger_for_user(&user.id).await.unwrap();
        assert_eq!(ledger.len(), 3);
        assert_eq!(verify_ledger(&ledger, balance), Ok(5));
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn concurrent_reservations_never_overdraw() {
        let store = store().await;
        let user = User::new(UserId::generate(), "race@example.com", "race");
        store.create_user(&user).await.unwrap();
        store.add_credits(&user.id, 5, "seed".into()).await.unwrap();

        let a = Generation::pending(user.id, None, "a", 3, None);
        let b = Generation::pending(user.id, None, "b", 3, None);
        let (ra, rb) = tokio::join!(store.reserve_generation(&a), store.reserve_generation(&b));
        assert_eq!(usize::from(ra.is_ok()) + usize::from(rb.is_ok()), 1);

        let balance = store.get_user(&user.id).await.unwrap().unwrap().credit_balance;
        assert_eq!(balance, 2);
    }
}
