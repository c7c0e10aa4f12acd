//! Model pricing tables
//!
//! Prices are integer micro-USD per million tokens. Cost math runs in
//! i128 so a billion-token usage report cannot overflow midway.

use crate::money::MicroUsd;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum PricingError {
    #[error("No pricing entry for model: {0}")]
    UnknownModel(String),

    #[error("Computed cost overflows micro-USD range for model {0}")]
    Overflow(String),
}

/// Token usage reported by a provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Accumulate another usage report (ensemble aggregation).
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Price of one model, micro-USD per 1M tokens.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PricingEntry {
    pub input_per_1m_micro: i64,
    pub output_per_1m_micro: i64,
}

const TOKENS_PER_PRICE_UNIT: i128 = 1_000_000;

impl PricingEntry {
    pub fn new(input_per_1m_micro: i64, output_per_1m_micro: i64) -> Self {
        Self {
            input_per_1m_micro,
            output_per_1m_micro,
        }
    }

    /// Exact cost of a usage report, rounded up to the next micro-USD.
    ///
    /// Rounding up keeps the house from leaking fractions of a micro-cent
    /// across millions of calls.
    pub fn cost(&self, usage: &Usage) -> Result<MicroUsd, PricingError> {
        let input = div_ceil(
            usage.input_tokens as i128 * self.input_per_1m_micro as i128,
            TOKENS_PER_PRICE_UNIT,
        );
        let output = div_ceil(
            usage.output_tokens as i128 * self.output_per_1m_micro as i128,
            TOKENS_PER_PRICE_UNIT,
        );
        let total = input + output;
        i64::try_from(total)
            .map(MicroUsd::new)
            .map_err(|_| PricingError::Overflow(String::new()))
    }

    /// Largest output-token count a budget can cover at this price.
    ///
    /// Floor division: a budget never authorizes a token it cannot pay
    /// for. Zero output price means the budget imposes no token bound.
    pub fn max_output_tokens(&self, budget: MicroUsd) -> Option<u64> {
        if self.output_per_1m_micro <= 0 {
            return None;
        }
        if budget.get() <= 0 {
            return Some(0);
        }
        let tokens = budget.get() as i128 * TOKENS_PER_PRICE_UNIT
            / self.output_per_1m_micro as i128;
        Some(tokens.min(u64::MAX as i128) as u64)
    }
}

fn div_ceil(numerator: i128, denominator: i128) -> i128 {
    (numerator + denominator - 1) / denominator
}

/// Pricing for the whole fleet, keyed by `provider:model`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PricingTable {
    entries: HashMap<String, PricingEntry>,
}

impl PricingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, provider: &str, model: &str, entry: PricingEntry) {
        self.entries.insert(Self::key(provider, model), entry);
    }

    pub fn get(&self, provider: &str, model: &str) -> Result<PricingEntry, PricingError> {
        self.entries
            .get(&Self::key(provider, model))
            .copied()
            .ok_or_else(|| PricingError::UnknownModel(Self::key(provider, model)))
    }

    pub fn cost(
        &self,
        provider: &str,
        model: &str,
        usage: &Usage,
    ) -> Result<MicroUsd, PricingError> {
        self.get(provider, model)?
            .cost(usage)
            .map_err(|_| PricingError::Overflow(Self::key(provider, model)))
    }

    fn key(provider: &str, model: &str) -> String {
        format!("{}:{}", provider, model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_cost() {
        // $3 / 1M input, $15 / 1M output.
        let entry = PricingEntry::new(3_000_000, 15_000_000);
        let usage = Usage::new(1_000_000, 200_000);
        assert_eq!(entry.cost(&usage).unwrap(), MicroUsd::new(6_000_000));
    }

    #[test]
    fn test_fractional_cost_rounds_up() {
        let entry = PricingEntry::new(3_000_000, 15_000_000);
        // One input token: 3 µUSD exactly. One output token: 15 µUSD.
        assert_eq!(
            entry.cost(&Usage::new(1, 1)).unwrap(),
            MicroUsd::new(18)
        );
        // A price that does not divide evenly must round up, not drop.
        let odd = PricingEntry::new(1, 0);
        assert_eq!(odd.cost(&Usage::new(1, 0)).unwrap(), MicroUsd::new(1));
    }

    #[test]
    fn test_max_output_tokens_floor() {
        let entry = PricingEntry::new(0, 15_000_000);
        // 10_000 µUSD at $15/1M output → 666 tokens, floored.
        assert_eq!(entry.max_output_tokens(MicroUsd::new(10_000)), Some(666));
        assert_eq!(entry.max_output_tokens(MicroUsd::ZERO), Some(0));
        let free = PricingEntry::new(0, 0);
        assert_eq!(free.max_output_tokens(MicroUsd::new(1)), None);
    }

    #[test]
    fn test_unknown_model_fails_closed() {
        let table = PricingTable::new();
        assert!(matches!(
            table.get("anthropic", "claude-opus"),
            Err(PricingError::UnknownModel(_))
        ));
    }
}
