//! Token budget enforcement
//!
//! Turns an externally measured token count into a decision about how many
//! of the oldest turns have to leave the context.

use serde::{Deserialize, Serialize};

/// Default context window size (in tokens)
pub const DEFAULT_MAX_CONTEXT_TOKENS: usize = 128_000;

/// Default share of the live turns taken per trim
pub const DEFAULT_COMPRESSION_RATIO: f64 = 0.5;

/// The ratio is clamped into this range before use
const MIN_COMPRESSION_RATIO: f64 = 0.1;
const MAX_COMPRESSION_RATIO: f64 = 1.0;

/// Budget settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenBudgetConfig {
    /// Token count above which history is trimmed
    pub max_context_tokens: usize,
    /// Fraction of the live turns trimmed per overflow
    pub compression_ratio: f64,
}

impl Default for TokenBudgetConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: DEFAULT_MAX_CONTEXT_TOKENS,
            compression_ratio: DEFAULT_COMPRESSION_RATIO,
        }
    }
}

/// What the policy wants done about a reported token count
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BudgetDecision {
    NoAction,
    Trim {
        /// How far over budget, relative to the budget
        excess_ratio: f64,
        /// Oldest turns to remove or summarize
        count: usize,
    },
}

/// Sizes trims from reported token usage
#[derive(Debug, Clone)]
pub struct TokenBudgetPolicy {
    config: TokenBudgetConfig,
}

impl TokenBudgetPolicy {
    pub fn new(config: TokenBudgetConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TokenBudgetConfig {
        &self.config
    }

    pub fn max_context_tokens(&self) -> usize {
        self.config.max_context_tokens
    }

    /// Effective ratio after clamping into `[0.1, 1.0]`
    pub fn effective_ratio(&self) -> f64 {
        let ratio = self.config.compression_ratio;
        if ratio.is_nan() {
            return MIN_COMPRESSION_RATIO;
        }
        ratio.clamp(MIN_COMPRESSION_RATIO, MAX_COMPRESSION_RATIO)
    }

    /// Decide how many of `eligible` oldest turns must go.
    ///
    /// At or under budget nothing happens. Over budget at least one turn
    /// is taken, never more than are eligible.
    pub fn evaluate(&self, total_tokens: usize, eligible: usize) -> BudgetDecision {
        let max = self.config.max_context_tokens;
        if total_tokens <= max || eligible == 0 {
            return BudgetDecision::NoAction;
        }

        let excess_ratio = (total_tokens - max) as f64 / max.max(1) as f64;
        let count = ((eligible as f64 * self.effective_ratio()).floor() as usize)
            .max(1)
            .min(eligible);

        BudgetDecision::Trim {
            excess_ratio,
            count,
        }
    }

    /// Usage as a percentage of the budget
    pub fn usage_percent(&self, total_tokens: usize) -> f32 {
        if self.config.max_context_tokens == 0 {
            return 0.0;
        }
        (total_tokens as f32 / self.config.max_context_tokens as f32) * 100.0
    }
}

impl Default for TokenBudgetPolicy {
    fn default() -> Self {
        Self::new(TokenBudgetConfig::default())
    }
}
