//! Core types and utilities for avatarbank.
//!
//! This crate provides the foundational types used throughout the avatarbank
//! marketplace:
//!
//! - **Identifiers**: `UserId`, `AvatarId`, `GenerationId`, `TaskId`, `TransactionId`
//! - **Users & avatars**: `User`, `Avatar` and their status enums
//! - **Generations**: `Generation` and its transition function
//! - **Credits**: `CreditTransaction`, `TransactionType`, ledger replay
//! - **Tasks**: `Task`, `TaskStatus`
//! - **Pricing**: `PricingConfig`, `PricingRule`
//!
//! # Credits
//!
//! Credits are whole units stored as `i64`. A user's balance is the sum of
//! their ledger entries; it never goes negative.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod avatar;
pub mod credits;
pub mod error;
pub mod generation;
pub mod ids;
pub mod pricing;
pub mod task;
pub mod user;

pub use avatar::{Avatar, AvatarStatus, DEFAULT_CREDIT_PER_GENERATION};
pub use credits::{verify_ledger, CreditTransaction, LedgerViolation, TransactionType};
pub use error::{MarketError, Result};
pub use generation::{
    GeneratedImage, Generation, GenerationStatus, LedgerEffect, Transition, MAX_OPTION_CREDITS,
    MAX_PROMPT_CHARS,
};
pub use ids::{AvatarId, GenerationId, IdError, TaskId, TransactionId, UserId};
pub use pricing::{validate_prompt, PricingConfig, PricingRule, DEFAULT_BASE_CREDITS};
pub use task::{Task, TaskStatus, TASK_TYPE_IMAGE_GENERATION};
pub use user::{User, UserRole, UserStatus, DEFAULT_LOCALE, SUPPORTED_LOCALES};
