//! Key encoding utilities for `RocksDB`.
//!
//! Index keys are fixed-width concatenations so that a prefix scan over the
//! leading ID yields one owner's records in key order.

use chrono::{DateTime, Utc};

use avatarbank_core::{GenerationId, TaskId, TransactionId, UserId};

use crate::error::{Result, StoreError};

/// Create a user key from a user ID.
#[must_use]
pub fn user_key(user_id: &UserId) -> Vec<u8> {
    user_id.as_bytes().to_vec()
}

/// Create a transaction key from a transaction ID.
#[must_use]
pub fn transaction_key(transaction_id: &TransactionId) -> Vec<u8> {
    transaction_id.to_bytes().to_vec()
}

/// Create a user-transaction index key.
///
/// Format: `user_id (16 bytes) || transaction_id (16 bytes)`
///
/// Transaction IDs are monotonic ULIDs, so a user's entries sort in creation order.
#[must_use]
pub fn user_transaction_key(user_id: &UserId, transaction_id: &TransactionId) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(user_id.as_bytes());
    key.extend_from_slice(&transaction_id.to_bytes());
    key
}

/// Extract the transaction ID from a user-transaction index key.
///
/// # Errors
///
/// Returns `StoreError::Serialization` if the key is shorter than 32 bytes.
pub fn extract_transaction_id_from_user_key(key: &[u8]) -> Result<TransactionId> {
    id_bytes(key, 16).map(TransactionId::from_bytes)
}

/// Create a buyer-generation index key.
///
/// Format: `buyer_id (16) || created_at millis, big-endian (8) || generation_id (16)`
#[must_use]
pub fn buyer_generation_key(
    buyer_id: &UserId,
    created_at: DateTime<Utc>,
    generation_id: &GenerationId,
) -> Vec<u8> {
    // Pre-epoch timestamps clamp to zero so ordering stays unsigned.
    let millis = u64::try_from(created_at.timestamp_millis()).unwrap_or(0);
    let mut key = Vec::with_capacity(40);
    key.extend_from_slice(buyer_id.as_bytes());
    key.extend_from_slice(&millis.to_be_bytes());
    key.extend_from_slice(generation_id.as_bytes());
    key
}

/// Extract the generation ID from a buyer-generation index key.
///
/// # Errors
///
/// Returns `StoreError::Serialization` if the key is shorter than 40 bytes.
pub fn extract_generation_id_from_buyer_key(key: &[u8]) -> Result<GenerationId> {
    id_bytes(key, 24).map(GenerationId::from_bytes)
}

/// Create an idempotency index key.
///
/// Format: `buyer_id (16) || key bytes`
#[must_use]
pub fn idempotency_key(buyer_id: &UserId, key: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + key.len());
    out.extend_from_slice(buyer_id.as_bytes());
    out.extend_from_slice(key.as_bytes());
    out
}

/// Create a generation-task index key.
///
/// Format: `generation_id (16) || task_id (16)`
#[must_use]
pub fn generation_task_key(generation_id: &GenerationId, task_id: &TaskId) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(generation_id.as_bytes());
    key.extend_from_slice(task_id.as_bytes());
    key
}

/// Extract the task ID from a generation-task index key.
///
/// # Errors
///
/// Returns `StoreError::Serialization` if the key is shorter than 32 bytes.
pub fn extract_task_id_from_generation_key(key: &[u8]) -> Result<TaskId> {
    id_bytes(key, 16).map(TaskId::from_bytes)
}

fn id_bytes(key: &[u8], start: usize) -> Result<[u8; 16]> {
    key.get(start..start + 16)
        .and_then(|slice| <[u8; 16]>::try_from(slice).ok())
        .ok_or_else(|| {
            StoreError::Serialization(format!("malformed index key of length {}", key.len()))
        })
}
