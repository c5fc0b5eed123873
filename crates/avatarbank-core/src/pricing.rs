//! Pricing configuration for avatarbank.
//!
//! Exactly one [`PricingRule`] is active. The cost of a generation is the
//! rule's base cost plus the request's option credits, computed once at
//! submission and snapshotted into the generation.

use serde::{Deserialize, Serialize};

use crate::error::{MarketError, Result};
use crate::generation::{MAX_OPTION_CREDITS, MAX_PROMPT_CHARS};
use crate::Avatar;

/// Base cost of a generation when the rule does not take it from an avatar.
pub const DEFAULT_BASE_CREDITS: i64 = 1;

/// How the base cost of a generation is determined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricingRule {
    /// The avatar's `credit_per_generation`, or the base credits without one.
    #[default]
    PerAvatar,

    /// The base credits for every request.
    Flat,
}

impl std::str::FromStr for PricingRule {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "per_avatar" => Ok(Self::PerAvatar),
            "flat" => Ok(Self::Flat),
            other => Err(format!("unknown pricing rule: {other}")),
        }
    }
}

/// Pricing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Active rule.
    pub rule: PricingRule,

    /// Base cost in credits used by `Flat` and by avatar-less `PerAvatar` requests.
    pub base_credits: i64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            rule: PricingRule::default(),
            base_credits: DEFAULT_BASE_CREDITS,
        }
    }
}

impl PricingConfig {
    /// Base cost for a request against `avatar`.
    #[must_use]
    pub fn base_cost(&self, avatar: Option<&Avatar>) -> i64 {
        match (self.rule, avatar) {
            (PricingRule::PerAvatar, Some(avatar)) => avatar.credit_per_generation,
            _ => self.base_credits,
        }
    }

    /// Total cost for a request: base cost plus option credits.
    ///
    /// # Errors
    ///
    /// Returns `MarketError::InvalidAmount` if `option_credits` is outside
    /// `0..=100`.
    pub fn total_cost(&self, avatar: Option<&Avatar>, option_credits: i64) -> Result<i64> {
        if !(0..=MAX_OPTION_CREDITS).contains(&option_credits) {
            return Err(MarketError::InvalidAmount(format!(
                "option_credits must be between 0 and {MAX_OPTION_CREDITS}, got {option_credits}"
            )));
        }
        Ok(self.base_cost(avatar) + option_credits)
    }
}

/// Validate a generation prompt.
///
/// # Errors
///
/// Returns `MarketError::InvalidRequest` if the prompt is blank or longer
/// than the maximum.
pub fn validate_prompt(prompt: &str) -> Result<()> {
    if prompt.trim().is_empty() {
        return Err(MarketError::InvalidRequest("prompt must not be empty".into()));
    }
    let chars = prompt.chars().count();
    if chars > MAX_PROMPT_CHARS {
        return Err(MarketError::InvalidRequest(format!(
            "prompt is {chars} characters, maximum is {MAX_PROMPT_CHARS}"
        )));
    }
    Ok(())
}
